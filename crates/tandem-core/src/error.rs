use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("hub is shut down")]
    HubClosed,
    #[error("user {user_id} already has {limit} live sessions")]
    SessionLimit { user_id: String, limit: usize },
    #[error("session {0} is already closed")]
    SessionClosed(Uuid),
}
