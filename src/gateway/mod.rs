//! Session-multiplexed HTTP gateway

pub mod auth;
mod router;
mod server;
pub mod session;

pub use auth::{API_KEY_HEADER, AuthGate, AuthenticatedClient, Rejection, auth_middleware};
pub use router::{AppState, SESSION_HEADER, create_router, parse_session_id};
pub use server::{Gateway, GatewayHandle};
pub use session::{AdmissionError, CloseReason, SessionStore};
