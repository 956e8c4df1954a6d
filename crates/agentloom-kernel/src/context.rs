//! Per-invocation context.
//!
//! An [`InvocationContext`] is created fresh for every call to an agent's
//! `run`.  It is passed by value (or shared reference) to callbacks and tools
//! for correlation and is never mutated after construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Field names a callback predicate may refer to.
pub const CONTEXT_FIELDS: [&str; 4] = ["session_id", "invocation_id", "agent_name", "agent_module"];

/// Identity of one invocation of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// Session identity of the agent actor; stable across invocations.
    pub session_id: String,
    /// Fresh identifier for this invocation (UUID v7, time-ordered).
    pub invocation_id: Uuid,
    /// Configured agent name.
    pub agent_name: String,
    /// Workflow kind backing the agent (`sequential`, `parallel`, `loop`, `llm`).
    pub agent_module: String,
}

impl InvocationContext {
    /// Create a context with a freshly generated invocation id.
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_module: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            invocation_id: Uuid::now_v7(),
            agent_name: agent_name.into(),
            agent_module: agent_module.into(),
        }
    }

    /// Look up a context field by name, as used by predicate matching.
    ///
    /// Returns `None` for names outside [`CONTEXT_FIELDS`].
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "session_id" => Some(Value::String(self.session_id.clone())),
            "invocation_id" => Some(Value::String(self.invocation_id.to_string())),
            "agent_name" => Some(Value::String(self.agent_name.clone())),
            "agent_module" => Some(Value::String(self.agent_module.clone())),
            _ => None,
        }
    }
}
