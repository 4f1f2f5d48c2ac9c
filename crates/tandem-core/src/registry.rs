use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::session::Session;

/// User -> live sessions. Owned by the hub task; never shared.
#[derive(Default)]
pub struct SessionRegistry {
    users: HashMap<String, HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts under the session's own user id, replacing a previous entry
    /// with the same handle.
    pub fn insert(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.users
            .entry(session.user_id().to_string())
            .or_default()
            .insert(session.id(), session)
    }

    pub fn remove(&mut self, user_id: &str, session_id: Uuid) -> Option<Arc<Session>> {
        let sessions = self.users.get_mut(user_id)?;
        let removed = sessions.remove(&session_id);
        if sessions.is_empty() {
            self.users.remove(user_id);
        }
        removed
    }

    pub fn contains(&self, user_id: &str, session_id: Uuid) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|sessions| sessions.contains_key(&session_id))
    }

    pub fn sessions(&self, user_id: &str) -> impl Iterator<Item = &Arc<Session>> {
        self.users
            .get(user_id)
            .into_iter()
            .flat_map(|sessions| sessions.values())
    }

    pub fn session_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map_or(0, HashMap::len)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn len(&self) -> usize {
        self.users.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Empties the registry and hands back every session it held.
    pub fn drain(&mut self) -> Vec<Arc<Session>> {
        self.users
            .drain()
            .flat_map(|(_, sessions)| sessions.into_values())
            .collect()
    }
}
