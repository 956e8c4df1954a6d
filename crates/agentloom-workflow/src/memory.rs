//! Session memory contract.
//!
//! Workflows read a session's key/value state (for transform steps and loop
//! conditions) and append events to it (LLM conversations, state-writing
//! tools) through the [`MemoryStore`] trait.  The snapshot returned by
//! [`MemoryStore::full_state`] is a copy: concurrent writers may change the
//! session after it was taken.
//!
//! [`InMemoryStore`] is the default implementation; the `agentloom-store`
//! crate provides a SQLite-backed one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MemoryError;

/// A session's key/value state.
pub type StateMap = Map<String, Value>;

/// One event appended to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Who produced the event (`user`, `assistant`, a tool name, ...).
    pub author: String,
    /// Event payload.
    pub content: Value,
    /// Keys to merge into the session state.  A `null` value removes the key.
    #[serde(default)]
    pub state_delta: StateMap,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn new(author: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            author: author.into(),
            content: content.into(),
            state_delta: StateMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_state_delta(mut self, delta: StateMap) -> Self {
        self.state_delta = delta;
        self
    }
}

/// Merge `delta` into `state`, removing keys whose new value is `null`.
pub fn apply_delta(state: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        if value.is_null() {
            state.remove(key);
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
}

/// Session persistence used by workflows.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append an event to a session, creating the session if needed, and
    /// apply its state delta.
    async fn add_message(&self, session_id: &str, event: SessionEvent)
    -> Result<(), MemoryError>;

    /// Snapshot of a session's state.  Unknown sessions have an empty state.
    async fn full_state(&self, session_id: &str) -> Result<StateMap, MemoryError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionRecord {
    events: Vec<SessionEvent>,
    state: StateMap,
}

/// Process-local [`MemoryStore`] backed by [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: DashMap<String, SessionRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events of a session, oldest first.
    pub fn events(&self, session_id: &str) -> Result<Vec<SessionEvent>, MemoryError> {
        self.sessions
            .get(session_id)
            .map(|record| record.events.clone())
            .ok_or_else(|| MemoryError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn add_message(
        &self,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<(), MemoryError> {
        let mut record = self.sessions.entry(session_id.to_string()).or_default();
        apply_delta(&mut record.state, &event.state_delta);
        record.events.push(event);
        tracing::trace!(session_id, events = record.events.len(), "session event appended");
        Ok(())
    }

    async fn full_state(&self, session_id: &str) -> Result<StateMap, MemoryError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|record| record.state.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(value: Value) -> StateMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn unknown_session_has_empty_state() {
        let store = InMemoryStore::new();
        assert!(store.full_state("nobody").await.unwrap().is_empty());
        assert!(matches!(
            store.events("nobody"),
            Err(MemoryError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deltas_merge_and_null_removes() {
        let store = InMemoryStore::new();
        store
            .add_message(
                "s",
                SessionEvent::new("tool", "set").with_state_delta(delta(json!({"a": 1, "b": 2}))),
            )
            .await
            .unwrap();
        store
            .add_message(
                "s",
                SessionEvent::new("tool", "update")
                    .with_state_delta(delta(json!({"a": null, "c": "x"}))),
            )
            .await
            .unwrap();

        let state = store.full_state("s").await.unwrap();
        assert_eq!(Value::Object(state), json!({"b": 2, "c": "x"}));
        assert_eq!(store.events("s").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn events_without_delta_leave_state_alone() {
        let store = InMemoryStore::new();
        store
            .add_message("s", SessionEvent::new("user", "hello"))
            .await
            .unwrap();
        assert!(store.full_state("s").await.unwrap().is_empty());
        assert_eq!(store.events("s").unwrap()[0].content, json!("hello"));
    }
}
