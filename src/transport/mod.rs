//! Transports other than the HTTP gateway

mod stdio;

pub use self::stdio::{run_stdio, serve};
