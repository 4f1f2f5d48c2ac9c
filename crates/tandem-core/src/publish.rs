use serde::Serialize;
use tandem_models::gateway::Envelope;

use crate::hub::Hub;
use crate::session::Frame;

impl Hub {
    /// Fans a freshly persisted chat message out to the chat's participants
    /// as a `new_message` frame.
    ///
    /// Fire-and-forget: an unserializable payload is logged and dropped, and
    /// resolution or delivery problems never reach the caller.
    pub fn publish_new_message<T>(&self, chat_id: &str, message: &T)
    where
        T: Serialize + ?Sized,
    {
        let message = match serde_json::to_value(message) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(chat_id, error = %err, "new_message payload not serializable; dropped");
                return;
            }
        };
        let envelope = Envelope::NewMessage {
            chat_id: chat_id.to_string(),
            message,
        };
        match Frame::encode(&envelope) {
            Ok(frame) => self.broadcast_to_chat(chat_id, frame),
            Err(err) => {
                tracing::warn!(chat_id, error = %err, "new_message frame encoding failed; dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tandem_models::gateway::Envelope;
    use tandem_models::message::{ChatMessage, MessageType};

    use crate::hub::{Hub, HubConfig};
    use crate::resolver::StaticParticipants;
    use crate::session::Session;

    #[tokio::test]
    async fn typed_messages_are_published_as_json() {
        let resolver = StaticParticipants::from_chats([("c9", vec!["alice", "bob"])]);
        let hub = Hub::spawn(Arc::new(resolver), HubConfig::default());
        let (session, mut rx) = Session::new("bob", 8);
        hub.register(session).await.unwrap();

        let message = ChatMessage {
            id: "m1".into(),
            chat_id: "c9".into(),
            sender_id: "alice".into(),
            content: "look".into(),
            message_type: MessageType::Gif,
            is_read: false,
            created_at: Some(Utc::now()),
        };
        hub.publish_new_message("c9", &message);
        hub.stats().await.unwrap();

        let frame = rx.try_recv().expect("delivered");
        let Envelope::NewMessage { chat_id, message } = Envelope::decode(frame.as_str()).unwrap()
        else {
            panic!("expected new_message");
        };
        assert_eq!(chat_id, "c9");
        assert_eq!(message["sender_id"], "alice");
        assert_eq!(message["message_type"], "gif");
    }

    #[tokio::test]
    async fn unknown_chat_does_not_raise() {
        let hub = Hub::spawn(Arc::new(StaticParticipants::empty()), HubConfig::default());
        hub.publish_new_message("missing", &serde_json::json!({"text": "hi"}));
        assert_eq!(hub.stats().await.unwrap().dropped_broadcasts, 1);
    }
}
