use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Session tag used when a client frame carries no `session_id`.
pub const DEFAULT_SESSION_TAG: &str = "web";

/// Session tag stamped on replies routed back from the bot.
pub const BOT_REPLY_SESSION_TAG: &str = "bot-reply";

/// Top-level envelope exchanged with clients over text WS frames.
///
/// Discriminated by `event`:
/// - `message_new`   — client → gateway chat message
/// - `message_reply` — gateway → client bot reply
/// - `error` / `service_unavailable` — gateway → client failure frames
///
/// The literal tokens `PING`/`PONG` travel outside this envelope; they
/// are not JSON and must be checked before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientFrame {
    MessageNew { payload: MessagePayload },
    MessageReply { payload: MessagePayload },
    Error { error: String },
    ServiceUnavailable { error: String },
}

/// Chat message body shared by `message_new` and `message_reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
    /// Optional on `message_new` when the connection is already
    /// identified; always present on `message_reply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Stamped by the reply correlator on synchronous waits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ClientFrame {
    /// Build the reply envelope routed to a client for a bot message.
    pub fn reply(user_id: &str, text: String) -> Self {
        ClientFrame::MessageReply {
            payload: MessagePayload {
                text,
                metadata: Some(MessageMetadata {
                    user_id: user_id.to_string(),
                    session_id: Some(BOT_REPLY_SESSION_TAG.to_string()),
                    request_id: None,
                }),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ClientFrame::Error {
            error: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ClientFrame::ServiceUnavailable {
            error: message.into(),
        }
    }
}

/// Encode a `ClientFrame` to a JSON string for a text WS frame.
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a `ClientFrame` from a text WS frame.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_new_roundtrip() {
        let frame = ClientFrame::MessageNew {
            payload: MessagePayload {
                text: "hello".into(),
                metadata: Some(MessageMetadata {
                    user_id: "10001".into(),
                    session_id: Some("web".into()),
                    request_id: None,
                }),
            },
        };
        let encoded = encode_client_frame(&frame).unwrap();
        let decoded = decode_client_frame(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn message_new_without_metadata() {
        let decoded =
            decode_client_frame(r#"{"event":"message_new","payload":{"text":"hi"}}"#).unwrap();
        match decoded {
            ClientFrame::MessageNew { payload } => {
                assert_eq!(payload.text, "hi");
                assert!(payload.metadata.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn reply_carries_bot_session_tag() {
        let frame = ClientFrame::reply("42", "pong".into());
        let json = encode_client_frame(&frame).unwrap();
        assert!(json.contains("\"event\":\"message_reply\""));
        assert!(json.contains("\"session_id\":\"bot-reply\""));
        assert!(!json.contains("request_id"));
    }

    #[test]
    fn error_frames_tagged_by_event() {
        let json = encode_client_frame(&ClientFrame::service_unavailable("bot offline")).unwrap();
        assert!(json.contains("\"event\":\"service_unavailable\""));
    }
}
