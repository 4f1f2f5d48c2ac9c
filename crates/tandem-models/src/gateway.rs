use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// Frame types, shared by both directions
pub const TYPE_NEW_MESSAGE: &str = "new_message";
pub const TYPE_TYPING: &str = "typing";
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";

/// Raw JSON shape of a gateway frame. Fields that do not apply to a type are
/// omitted on output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A decoded gateway frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A chat message that was already persisted upstream.
    NewMessage { chat_id: String, message: Value },
    /// Typing indicator. Inbound `user_id` is whatever the client claimed and
    /// must be overwritten before fan-out.
    Typing {
        chat_id: String,
        user_id: Option<String>,
    },
    Ping,
    Pong,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("{kind} frame is missing '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: GatewayFrame = serde_json::from_str(text)?;
        Self::try_from(frame)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(&GatewayFrame::from(self))?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => TYPE_NEW_MESSAGE,
            Self::Typing { .. } => TYPE_TYPING,
            Self::Ping => TYPE_PING,
            Self::Pong => TYPE_PONG,
        }
    }

    pub fn chat_id(&self) -> Option<&str> {
        match self {
            Self::NewMessage { chat_id, .. } | Self::Typing { chat_id, .. } => Some(chat_id),
            Self::Ping | Self::Pong => None,
        }
    }
}

fn required_chat_id(kind: &'static str, chat_id: Option<String>) -> Result<String, FrameError> {
    chat_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(FrameError::MissingField {
            kind,
            field: "chat_id",
        })
}

impl TryFrom<GatewayFrame> for Envelope {
    type Error = FrameError;

    fn try_from(frame: GatewayFrame) -> Result<Self, Self::Error> {
        match frame.kind.as_str() {
            TYPE_NEW_MESSAGE => {
                let chat_id = required_chat_id(TYPE_NEW_MESSAGE, frame.chat_id)?;
                let message = frame.message.ok_or(FrameError::MissingField {
                    kind: TYPE_NEW_MESSAGE,
                    field: "message",
                })?;
                Ok(Self::NewMessage { chat_id, message })
            }
            TYPE_TYPING => Ok(Self::Typing {
                chat_id: required_chat_id(TYPE_TYPING, frame.chat_id)?,
                user_id: frame.user_id,
            }),
            TYPE_PING => Ok(Self::Ping),
            TYPE_PONG => Ok(Self::Pong),
            _ => Err(FrameError::UnknownType(frame.kind)),
        }
    }
}

impl From<&Envelope> for GatewayFrame {
    fn from(envelope: &Envelope) -> Self {
        let kind = envelope.kind().to_string();
        match envelope {
            Envelope::NewMessage { chat_id, message } => GatewayFrame {
                kind,
                chat_id: Some(chat_id.clone()),
                message: Some(message.clone()),
                user_id: None,
            },
            Envelope::Typing { chat_id, user_id } => GatewayFrame {
                kind,
                chat_id: Some(chat_id.clone()),
                message: None,
                user_id: user_id.clone(),
            },
            Envelope::Ping | Envelope::Pong => GatewayFrame {
                kind,
                ..GatewayFrame::default()
            },
        }
    }
}
