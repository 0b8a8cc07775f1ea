//! Server-Sent Events framing.
//!
//! The reply channel is one-way text/event-stream. Three frame kinds are
//! used: the initial `endpoint` event (tells the client where to POST),
//! `message` events carrying serialized JSON-RPC responses, and bare
//! comments as keepalives.

use std::fmt;

/// One SSE frame, ready to be written to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `event: endpoint` — first frame on every stream; data is the
    /// absolute message URL including the session_id query parameter.
    Endpoint(String),
    /// `event: message` — data is a serialized JSON-RPC response.
    Message(String),
    /// `: keepalive` comment frame.
    Keepalive,
}

impl fmt::Display for SseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint(url) => write!(f, "event: endpoint\ndata: {}\n\n", url),
            Self::Message(payload) => {
                // Multi-line payloads must become multiple data: lines or the
                // frame is corrupted. JSON-RPC bodies are single-line by
                // construction, but split defensively anyway.
                writeln!(f, "event: message")?;
                for line in payload.split('\n') {
                    writeln!(f, "data: {}", line)?;
                }
                writeln!(f)
            }
            Self::Keepalive => write!(f, ":\n\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_frame_format() {
        let frame = SseFrame::Endpoint(
            "http://localhost:8787/mcp/v1/message?session_id=abc".to_string(),
        );
        assert_eq!(
            frame.to_string(),
            "event: endpoint\ndata: http://localhost:8787/mcp/v1/message?session_id=abc\n\n"
        );
    }

    #[test]
    fn message_frame_format() {
        let frame = SseFrame::Message(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string());
        let rendered = frame.to_string();
        assert!(rendered.starts_with("event: message\n"));
        assert!(rendered.contains(r#"data: {"jsonrpc":"2.0","id":1,"result":{}}"#));
        assert!(rendered.ends_with("\n\n"));
    }

    #[test]
    fn keepalive_is_comment() {
        assert_eq!(SseFrame::Keepalive.to_string(), ":\n\n");
    }

    #[test]
    fn multiline_payload_splits_into_data_lines() {
        let frame = SseFrame::Message("a\nb".to_string());
        assert_eq!(frame.to_string(), "event: message\ndata: a\ndata: b\n\n");
    }
}
