//! Newline-delimited JSON-RPC over stdin/stdout
//!
//! One engine, no authentication, no session header. Each inbound line is a
//! single JSON-RPC message; replies and notifications go out one per line.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::rpc_codes;
use crate::protocol::JsonRpcResponse;
use crate::{Error, Result};

/// One inbound frame
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Text(String),
    TooLong,
}

/// `LinesCodec` that reports an oversized line as an item instead of an
/// error, so the reader keeps going after it
struct MessageCodec {
    inner: LinesCodec,
}

impl MessageCodec {
    fn new(max_line_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_length),
        }
    }

    fn lift(
        decoded: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<Line>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(Line::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Line::TooLong)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Line;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Line>, Self::Error> {
        Self::lift(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Line>, Self::Error> {
        Self::lift(self.inner.decode_eof(buf))
    }
}

/// Serve `engine` over the process's stdin and stdout until stdin closes
///
/// # Errors
///
/// Returns an error if stdout cannot be written.
pub async fn run_stdio(engine: &Engine, max_line_length: usize) -> Result<()> {
    info!("Serving MCP over stdio");
    let mut stdout = tokio::io::stdout();
    serve(engine, tokio::io::stdin(), &mut stdout, max_line_length).await
}

/// Serve `engine` over any line-oriented reader and writer.
///
/// Returns at end of input or once the engine is closed. The engine is
/// closed on return.
///
/// # Errors
///
/// Returns an error if reading or writing fails at the I/O level.
pub async fn serve<R, W>(
    engine: &Engine,
    reader: R,
    writer: W,
    max_line_length: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, MessageCodec::new(max_line_length));
    let mut out = FramedWrite::new(writer, LinesCodec::new());
    let mut notifications = engine.subscribe();

    let result = loop {
        tokio::select! {
            biased;

            () = engine.closed() => break Ok(()),

            note = notifications.recv() => match note {
                Ok(note) => {
                    if let Err(e) = write_json(&mut out, &note).await {
                        break Err(e);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "Notifications dropped"),
                Err(RecvError::Closed) => break Ok(()),
            },

            line = lines.next() => {
                let reply = match line {
                    None => break Ok(()),
                    Some(Ok(Line::Text(line))) if line.trim().is_empty() => continue,
                    Some(Ok(Line::Text(line))) => match handle_line(engine, &line).await {
                        Ok(reply) => reply,
                        Err(Error::SessionClosed) => break Ok(()),
                        Err(e) => break Err(e),
                    },
                    Some(Ok(Line::TooLong)) => {
                        warn!(max_line_length, "Discarding oversized line");
                        Some(JsonRpcResponse::error(
                            None,
                            rpc_codes::INVALID_REQUEST,
                            "Message too large",
                        ))
                    }
                    Some(Err(LinesCodecError::Io(e))) => break Err(e.into()),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => continue,
                };
                if let Some(reply) = reply {
                    if let Err(e) = write_json(&mut out, &reply).await {
                        break Err(e);
                    }
                }
            }
        }
    };

    engine.close();
    debug!("Stdio transport stopped");
    result
}

async fn handle_line(engine: &Engine, line: &str) -> Result<Option<JsonRpcResponse>> {
    match serde_json::from_str::<Value>(line) {
        Ok(message) => engine.handle(&message).await,
        Err(e) => Ok(Some(JsonRpcResponse::error(
            None,
            rpc_codes::PARSE_ERROR,
            format!("Parse error: {e}"),
        ))),
    }
}

async fn write_json<W, T>(out: &mut FramedWrite<W, LinesCodec>, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = serde_json::to_string(value)?;
    out.send(line).await.map_err(|e| match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => Error::Internal(e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use crate::catalog::MemoryCatalog;
    use crate::engine::{Services, SessionFactory};

    fn engine() -> Engine {
        SessionFactory::new(Services::new(Arc::new(MemoryCatalog::new())), 8).create(None)
    }

    async fn exchange(engine: &Engine, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        serve(engine, input.as_bytes(), &mut output, 4096)
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn request_reply_per_line() {
        let engine = engine();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n",
        );
        let out = exchange(&engine, input).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], 1);
        assert_eq!(out[0]["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(out[1]["id"], 2);
        assert!(engine.is_closed());
    }

    #[tokio::test]
    async fn invalid_json_gets_parse_error() {
        let engine = engine();
        let out = exchange(&engine, "{not json\n").await;
        assert_eq!(out[0]["error"]["code"], rpc_codes::PARSE_ERROR);
        assert!(out[0]["id"].is_null());
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_and_stream_continues() {
        let engine = engine();
        let big = format!(r#"{{"jsonrpc":"2.0","id":1,"method":"{}"}}"#, "x".repeat(5000));
        let input = format!("{big}\n{{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}}\n");
        let out = exchange(&engine, &input).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["error"]["code"], rpc_codes::INVALID_REQUEST);
        assert_eq!(out[1]["id"], 2);
        assert_eq!(out[1]["result"], serde_json::json!({}));
    }

    #[test]
    fn codec_resumes_after_oversized_line() {
        let mut codec = MessageCodec::new(8);
        let mut buf = BytesMut::from("0123456789abcdef\nok\n");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Line::TooLong));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Line::Text("ok".to_string())));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn tool_call_notification_follows_reply() {
        let engine = engine();
        let out = exchange(
            &engine,
            "{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"tools/call\",\"params\":{\"name\":\"session_info\"}}\n",
        )
        .await;

        assert_eq!(out[0]["id"], 7);
        assert!(out[0]["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("(stdio)"));
        assert_eq!(out[1]["method"], "notifications/message");
    }
}
