//! Conversation Store: per-session, append-only turn logs held for the process lifetime.
//!
//! Sessions are created on first use and evicted when idle past the TTL, or least recently
//! used first once `max_sessions` is reached. A session is held by at most one in-flight
//! loop; a second request for the same session is rejected with `SessionBusy` rather than
//! queued, so turns from concurrent loops never interleave.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::StoreError;

/// Session used when a request does not name one.
pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn { role: Role::User, content: content.into() });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn { role: Role::Assistant, content: content.into() });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn assistant_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::Assistant).count()
    }
}

struct SessionSlot {
    conversation: Arc<tokio::sync::Mutex<Conversation>>,
    last_used: Mutex<Instant>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            conversation: Arc::new(tokio::sync::Mutex::new(Conversation::default())),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_idle(&self) -> bool {
        self.conversation.try_lock().is_ok()
    }
}

/// Exclusive access to one session's conversation for the duration of a loop.
pub struct SessionGuard {
    id: String,
    conversation: OwnedMutexGuard<Conversation>,
    slot: Arc<SessionSlot>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.id
    }
}

impl Deref for SessionGuard {
    type Target = Conversation;

    fn deref(&self) -> &Conversation {
        &self.conversation
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.slot.touch();
    }
}

pub struct ConversationStore {
    sessions: DashMap<String, Arc<SessionSlot>>,
    ttl: Duration,
    max_sessions: usize,
}

impl ConversationStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Take exclusive hold of `session_id`, creating it on first use.
    pub fn acquire(&self, session_id: &str) -> Result<SessionGuard, StoreError> {
        if !self.sessions.contains_key(session_id) && self.sessions.len() >= self.max_sessions {
            self.evict_least_recent();
        }

        // Lock while the map entry is held so eviction cannot detach the slot in between.
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionSlot::new()));
        let slot = Arc::clone(entry.value());
        let conversation = Arc::clone(&slot.conversation)
            .try_lock_owned()
            .map_err(|_| StoreError::SessionBusy(session_id.to_string()))?;
        drop(entry);

        slot.touch();
        Ok(SessionGuard { id: session_id.to_string(), conversation, slot })
    }

    /// Copy of a session's turns; `Ok(None)` when the session does not exist.
    pub fn snapshot(&self, session_id: &str) -> Result<Option<Vec<Turn>>, StoreError> {
        let Some(slot) = self.sessions.get(session_id).map(|s| Arc::clone(s.value())) else {
            return Ok(None);
        };
        let conversation = slot
            .conversation
            .try_lock()
            .map_err(|_| StoreError::SessionBusy(session_id.to_string()))?;
        Ok(Some(conversation.turns().to_vec()))
    }

    /// Drop idle sessions unused for longer than the TTL. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let before = self.sessions.len();
        let ttl = self.ttl;
        self.sessions
            .retain(|_, slot| !(slot.last_used().elapsed() >= ttl && slot.is_idle()));
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            tracing::info!(target: "watchdog::store", evicted, "expired idle sessions");
        }
        evicted
    }

    fn evict_least_recent(&self) {
        let oldest = self
            .sessions
            .iter()
            .filter(|e| e.value().is_idle())
            .min_by_key(|e| e.value().last_used())
            .map(|e| e.key().clone());
        if let Some(id) = oldest {
            if self.sessions.remove_if(&id, |_, slot| slot.is_idle()).is_some() {
                tracing::debug!(target: "watchdog::store", session = %id, "evicted least recently used session");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_on_first_acquire_and_appends_persist() {
        let store = ConversationStore::default();
        assert!(!store.contains("a"));
        {
            let mut s = store.acquire("a").unwrap();
            s.push_user("hello");
            s.push_assistant("hi there");
        }
        let turns = store.snapshot("a").unwrap().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].content, "hi there");
    }

    #[test]
    fn second_acquire_of_held_session_is_rejected() {
        let store = ConversationStore::default();
        let held = store.acquire("a").unwrap();
        assert_eq!(
            store.acquire("a").err(),
            Some(StoreError::SessionBusy("a".to_string()))
        );
        // other sessions are unaffected
        assert!(store.acquire("b").is_ok());
        drop(held);
        assert!(store.acquire("a").is_ok());
    }

    #[test]
    fn snapshot_of_unknown_session_is_none() {
        let store = ConversationStore::default();
        assert_eq!(store.snapshot("nope").unwrap(), None);
    }

    #[test]
    fn expired_idle_sessions_are_evicted_but_held_ones_stay() {
        let store = ConversationStore::new(Duration::ZERO, 16);
        drop(store.acquire("idle").unwrap());
        let _held = store.acquire("busy").unwrap();

        assert_eq!(store.evict_expired(), 1);
        assert!(!store.contains("idle"));
        assert!(store.contains("busy"));
    }

    #[test]
    fn capacity_evicts_least_recently_used_idle_session() {
        let store = ConversationStore::new(Duration::from_secs(3600), 2);
        drop(store.acquire("old").unwrap());
        std::thread::sleep(Duration::from_millis(5));
        drop(store.acquire("newer").unwrap());

        drop(store.acquire("third").unwrap());
        assert_eq!(store.len(), 2);
        assert!(!store.contains("old"));
        assert!(store.contains("newer"));
        assert!(store.contains("third"));
    }
}
