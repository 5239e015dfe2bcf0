use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The two bot-side actions that deliver a message to a user.
pub const ACTION_SEND_PRIVATE_MSG: &str = "send_private_msg";
pub const ACTION_SEND_MSG: &str = "send_msg";

/// Well-known acknowledgement return codes.
pub mod retcodes {
    pub const OK: i64 = 0;
    pub const INVALID_PARAMS: i64 = 100;
    pub const INTERNAL_ERROR: i64 = -1;
}

/// Outbound event framed for the bot backend: a private message from a
/// user, OneBot v11 shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub post_type: String,
    pub message_type: String,
    /// Unix seconds.
    pub time: u64,
    pub self_id: u64,
    pub sub_type: String,
    pub user_id: u64,
    pub message: Vec<Segment>,
    pub raw_message: String,
    pub font: u32,
    pub sender: Sender,
    pub message_id: u64,
}

impl MessageEvent {
    /// Wrap a plain text message as a private friend message event.
    pub fn private_text(self_id: u64, user_id: u64, text: &str, time: u64, message_id: u64) -> Self {
        Self {
            post_type: "message".into(),
            message_type: "private".into(),
            time,
            self_id,
            sub_type: "friend".into(),
            user_id,
            message: vec![Segment::text(text)],
            raw_message: text.to_string(),
            font: 0,
            sender: Sender {
                user_id,
                nickname: format!("User {user_id}"),
                sex: "unknown".into(),
                age: 0,
            },
            message_id,
        }
    }
}

/// One typed message segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: SegmentData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    pub text: String,
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            data: SegmentData { text: text.into() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: u64,
    pub nickname: String,
    pub sex: String,
    pub age: u32,
}

/// Inbound action call from the bot backend.
///
/// `params` is kept as raw JSON: the message field may be an array of
/// segments, a single segment object, or a bare string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Opaque correlation token, round-tripped on the acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

impl ActionCall {
    /// User id from `params.user_id`, accepting numeric or string form.
    pub fn user_id(&self) -> Option<String> {
        match self.params.get("user_id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Acknowledgement envelope written back for an echoed action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: String,
    pub retcode: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<AckData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    pub echo: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckData {
    pub message_id: u64,
    pub delivered: bool,
}

impl ActionResponse {
    pub fn ok(message_id: u64, delivered: bool, echo: Value) -> Self {
        Self {
            status: "ok".into(),
            retcode: retcodes::OK,
            data: Some(AckData {
                message_id,
                delivered,
            }),
            msg: None,
            echo,
        }
    }

    pub fn failed(retcode: i64, msg: impl Into<String>, echo: Value) -> Self {
        Self {
            status: "failed".into(),
            retcode,
            data: None,
            msg: Some(msg.into()),
            echo,
        }
    }
}

/// Extract plain text from an action call's `message` param.
///
/// Priority: array of typed segments (all `text`/`Plain` segments
/// concatenated), then a single segment object, then a raw string.
/// Anything else yields an empty string.
pub fn extract_message_text(params: &Value) -> String {
    let message = match params.get("message") {
        Some(m) => m,
        None => return String::new(),
    };
    match message {
        Value::Array(segments) => segments
            .iter()
            .filter(|seg| is_text_segment(seg))
            .filter_map(|seg| seg.pointer("/data/text").and_then(Value::as_str))
            .collect(),
        Value::String(s) => s.clone(),
        Value::Object(_) if is_text_segment(message) => message
            .pointer("/data/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn is_text_segment(seg: &Value) -> bool {
    matches!(
        seg.get("type").and_then(Value::as_str),
        Some("text") | Some("Plain")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_event_shape() {
        let event = MessageEvent::private_text(123456789, 10001, "hello bot", 1_700_000_000, 42);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["post_type"], "message");
        assert_eq!(json["message_type"], "private");
        assert_eq!(json["sub_type"], "friend");
        assert_eq!(json["user_id"], 10001);
        assert_eq!(json["message"][0]["type"], "text");
        assert_eq!(json["message"][0]["data"]["text"], "hello bot");
        assert_eq!(json["raw_message"], "hello bot");
        assert_eq!(json["sender"]["nickname"], "User 10001");
    }

    #[test]
    fn action_call_roundtrip() {
        let call: ActionCall = serde_json::from_str(
            r#"{"action":"send_private_msg","params":{"user_id":10001,"message":"hi"},"echo":"e1"}"#,
        )
        .unwrap();
        assert_eq!(call.action, ACTION_SEND_PRIVATE_MSG);
        assert_eq!(call.user_id().as_deref(), Some("10001"));
        assert_eq!(call.echo, Some(json!("e1")));
    }

    #[test]
    fn user_id_accepts_string_form() {
        let call: ActionCall =
            serde_json::from_value(json!({"action":"send_msg","params":{"user_id":"77"}})).unwrap();
        assert_eq!(call.user_id().as_deref(), Some("77"));
    }

    #[test]
    fn extract_text_from_segment_array() {
        let params = json!({
            "message": [
                {"type": "text", "data": {"text": "hello "}},
                {"type": "image", "data": {"file": "x.png"}},
                {"type": "Plain", "data": {"text": "world"}}
            ]
        });
        assert_eq!(extract_message_text(&params), "hello world");
    }

    #[test]
    fn extract_text_from_single_object() {
        let params = json!({"message": {"type": "text", "data": {"text": "solo"}}});
        assert_eq!(extract_message_text(&params), "solo");
    }

    #[test]
    fn extract_text_from_raw_string() {
        let params = json!({"message": "raw reply"});
        assert_eq!(extract_message_text(&params), "raw reply");
    }

    #[test]
    fn extract_text_ignores_non_text_object() {
        let params = json!({"message": {"type": "image", "data": {"file": "x.png"}}});
        assert_eq!(extract_message_text(&params), "");
    }

    #[test]
    fn ack_omits_null_fields() {
        let ack = ActionResponse::ok(7, true, json!("tok"));
        let encoded = serde_json::to_string(&ack).unwrap();
        assert!(!encoded.contains("\"msg\""));
        assert!(encoded.contains("\"delivered\":true"));
    }
}
