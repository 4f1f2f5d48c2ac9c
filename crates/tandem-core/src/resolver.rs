use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tandem_db::{DbError, DbPool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("chat {0} not found or no longer active")]
    ChatNotFound(String),
    #[error(transparent)]
    Database(#[from] DbError),
}

/// Answers "who belongs to chat X" for chat-scoped fan-out. Implementations
/// must reflect active membership only; results are never cached by the hub.
#[async_trait]
pub trait ParticipantResolver: Send + Sync {
    async fn resolve_chat_participants(&self, chat_id: &str) -> Result<Vec<String>, ResolveError>;
}

/// Resolves chats through the matches table: a chat belongs to the two users
/// of its match while that match is active.
pub struct DbParticipantResolver {
    pool: DbPool,
}

impl DbParticipantResolver {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParticipantResolver for DbParticipantResolver {
    async fn resolve_chat_participants(&self, chat_id: &str) -> Result<Vec<String>, ResolveError> {
        match tandem_db::chats::active_chat_participants(&self.pool, chat_id).await? {
            Some((user1, user2)) => Ok(vec![user1, user2]),
            None => Err(ResolveError::ChatNotFound(chat_id.to_string())),
        }
    }
}

/// In-memory index: Chat -> Set<UserId>.
pub struct StaticParticipants {
    chats: DashMap<String, HashSet<String>>,
}

impl StaticParticipants {
    pub fn empty() -> Self {
        Self {
            chats: DashMap::new(),
        }
    }

    pub fn from_chats<I, C, U>(chats: I) -> Self
    where
        I: IntoIterator<Item = (C, Vec<U>)>,
        C: Into<String>,
        U: Into<String>,
    {
        let index = Self::empty();
        for (chat_id, users) in chats {
            index.set_chat(chat_id, users);
        }
        index
    }

    pub fn set_chat<U: Into<String>>(&self, chat_id: impl Into<String>, users: Vec<U>) {
        self.chats
            .insert(chat_id.into(), users.into_iter().map(Into::into).collect());
    }

    pub fn add_participant(&self, chat_id: &str, user_id: &str) {
        self.chats
            .entry(chat_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn remove_participant(&self, chat_id: &str, user_id: &str) {
        if let Some(mut users) = self.chats.get_mut(chat_id) {
            users.remove(user_id);
        }
    }

    /// Drop an entire chat (e.g. after an unmatch).
    pub fn remove_chat(&self, chat_id: &str) {
        self.chats.remove(chat_id);
    }
}

impl Default for StaticParticipants {
    fn default() -> Self {
        Self::empty()
    }
}

#[async_trait]
impl ParticipantResolver for StaticParticipants {
    async fn resolve_chat_participants(&self, chat_id: &str) -> Result<Vec<String>, ResolveError> {
        self.chats
            .get(chat_id)
            .map(|users| users.iter().cloned().collect())
            .ok_or_else(|| ResolveError::ChatNotFound(chat_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_index_tracks_membership_changes() {
        let index = StaticParticipants::from_chats([("c1", vec!["alice", "bob"])]);
        let mut users = index.resolve_chat_participants("c1").await.unwrap();
        users.sort();
        assert_eq!(users, vec!["alice", "bob"]);

        index.remove_participant("c1", "bob");
        assert_eq!(
            index.resolve_chat_participants("c1").await.unwrap(),
            vec!["alice"]
        );

        index.remove_chat("c1");
        assert!(matches!(
            index.resolve_chat_participants("c1").await,
            Err(ResolveError::ChatNotFound(_))
        ));
    }

    #[tokio::test]
    async fn database_resolver_follows_match_state() {
        let pool = tandem_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("pool");
        sqlx::query(
            "CREATE TABLE matches (id TEXT PRIMARY KEY, user1_id TEXT, user2_id TEXT, is_active BOOLEAN)",
        )
        .execute(&pool)
        .await
        .expect("matches");
        sqlx::query("CREATE TABLE chats (id TEXT PRIMARY KEY, match_id TEXT)")
            .execute(&pool)
            .await
            .expect("chats");
        sqlx::query("INSERT INTO matches VALUES ('m1', 'alice', 'bob', 1)")
            .execute(&pool)
            .await
            .expect("insert match");
        sqlx::query("INSERT INTO chats VALUES ('c1', 'm1')")
            .execute(&pool)
            .await
            .expect("insert chat");

        let resolver = DbParticipantResolver::new(pool.clone());
        assert_eq!(
            resolver.resolve_chat_participants("c1").await.unwrap(),
            vec!["alice", "bob"]
        );

        sqlx::query("UPDATE matches SET is_active = 0 WHERE id = 'm1'")
            .execute(&pool)
            .await
            .expect("unmatch");
        assert!(matches!(
            resolver.resolve_chat_participants("c1").await,
            Err(ResolveError::ChatNotFound(_))
        ));
    }
}
