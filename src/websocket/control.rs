//! Gateway control messages.
//!
//! `{"type":"ping"}` → `{"type":"pong"}`
//! `{"type":"session_bind","session_id":"…"}` → `{"type":"session_bound","session_id":"…"}`
//!
//! Control messages never reach the backend. Any text frame that is not one of
//! them, including JSON with other `type` values, is forwarded verbatim.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    SessionBind { session_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Pong,
    SessionBound { session_id: String },
    Error { message: String },
}

impl ControlReply {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

/// Parse a text frame as a control message; `None` means forward it.
pub fn parse(text: &str) -> Option<ControlMessage> {
    // Cheap pre-check so ordinary traffic skips JSON parsing.
    if !text.trim_start().starts_with('{') || !text.contains("\"type\"") {
        return None;
    }
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse(r#"{"type":"ping"}"#), Some(ControlMessage::Ping));
        assert_eq!(parse(r#" { "type" : "ping" } "#), Some(ControlMessage::Ping));
    }

    #[test]
    fn test_parse_session_bind() {
        assert_eq!(
            parse(r#"{"type":"session_bind","session_id":"s-1"}"#),
            Some(ControlMessage::SessionBind { session_id: "s-1".into() })
        );
        // missing field → not a control message
        assert_eq!(parse(r#"{"type":"session_bind"}"#), None);
    }

    #[test]
    fn test_other_messages_forwarded() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse(r#"{"type":"chat","text":"hi"}"#), None);
        assert_eq!(parse(r#"{"kind":"ping"}"#), None);
    }

    #[test]
    fn test_replies() {
        assert_eq!(ControlReply::Pong.to_text(), r#"{"type":"pong"}"#);
        assert_eq!(
            ControlReply::SessionBound { session_id: "s".into() }.to_text(),
            r#"{"type":"session_bound","session_id":"s"}"#
        );
    }
}
