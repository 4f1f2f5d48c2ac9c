use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Gif,
}

/// A chat message as stored by the message-send handler. This is the usual
/// payload of a `new_message` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&MessageType::Gif).unwrap(), "\"gif\"");
        let parsed: MessageType = serde_json::from_str("\"image\"").unwrap();
        assert_eq!(parsed, MessageType::Image);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"id":"m1","chat_id":"c1","sender_id":"u1","content":"hey"}"#,
        )
        .unwrap();
        assert_eq!(msg.message_type, MessageType::Text);
        assert!(!msg.is_read);
        assert!(msg.created_at.is_none());
    }
}
