//! Tools every manifest can use.

use std::sync::Arc;
use std::time::Duration;

use agentloom_kernel::{Fault, InvocationContext, KernelError, Params, Tool, ToolDefinition, ToolRegistry};
use agentloom_workflow::{MemoryStore, SessionEvent, StateMap};
use async_trait::async_trait;
use serde_json::{Value, json};

/// Register `echo`, `uppercase`, `concat`, `sleep` and `state_set`.
pub fn register(registry: &ToolRegistry, memory: Arc<dyn MemoryStore>) -> Result<(), KernelError> {
    registry.register("echo", Arc::new(Echo))?;
    registry.register("uppercase", Arc::new(Uppercase))?;
    registry.register("concat", Arc::new(Concat))?;
    registry.register("sleep", Arc::new(Sleep))?;
    registry.register("state_set", Arc::new(StateSet { memory }))?;
    tracing::debug!(count = registry.count(), "builtin tools registered");
    Ok(())
}

fn str_param<'a>(params: &'a Params, key: &str) -> Result<&'a str, Fault> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Fault::new(format!("missing string parameter `{key}`")))
}

/// Returns its parameters.
struct Echo;

#[async_trait]
impl Tool for Echo {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("echo", "Return the parameters unchanged.", json!({"type": "object"}))
    }

    async fn execute(&self, params: Params, _ctx: &InvocationContext) -> Result<Value, Fault> {
        Ok(Value::Object(params))
    }
}

struct Uppercase;

#[async_trait]
impl Tool for Uppercase {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "uppercase",
            "Uppercase `text`.",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        )
    }

    async fn execute(&self, params: Params, _ctx: &InvocationContext) -> Result<Value, Fault> {
        Ok(Value::from(str_param(&params, "text")?.to_uppercase()))
    }
}

/// Joins `parts` with an optional `separator`.  Non-string parts are
/// rendered as JSON.
struct Concat;

#[async_trait]
impl Tool for Concat {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "concat",
            "Join `parts` with `separator`.",
            json!({
                "type": "object",
                "properties": {
                    "parts": {"type": "array"},
                    "separator": {"type": "string"}
                },
                "required": ["parts"]
            }),
        )
    }

    async fn execute(&self, params: Params, _ctx: &InvocationContext) -> Result<Value, Fault> {
        let parts = params
            .get("parts")
            .and_then(Value::as_array)
            .ok_or_else(|| Fault::new("missing array parameter `parts`"))?;
        let separator = params.get("separator").and_then(Value::as_str).unwrap_or("");
        let joined = parts
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(separator);
        Ok(Value::from(joined))
    }
}

struct Sleep;

#[async_trait]
impl Tool for Sleep {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "sleep",
            "Wait `ms` milliseconds.",
            json!({
                "type": "object",
                "properties": {"ms": {"type": "integer", "minimum": 0}},
                "required": ["ms"]
            }),
        )
    }

    async fn execute(&self, params: Params, _ctx: &InvocationContext) -> Result<Value, Fault> {
        let ms = params
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| Fault::new("missing integer parameter `ms`"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Writes `value` under `key` in the caller's session state.
struct StateSet {
    memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for StateSet {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "state_set",
            "Set `key` to `value` in the session state; a null value removes the key.",
            json!({
                "type": "object",
                "properties": {"key": {"type": "string"}, "value": {}},
                "required": ["key"]
            }),
        )
    }

    async fn execute(&self, params: Params, ctx: &InvocationContext) -> Result<Value, Fault> {
        let key = str_param(&params, "key")?.to_string();
        let value = params.get("value").cloned().unwrap_or(Value::Null);

        let mut delta = StateMap::new();
        delta.insert(key.clone(), value.clone());
        let event = SessionEvent::new("state_set", json!({ "key": key })).with_state_delta(delta);
        self.memory
            .add_message(&ctx.session_id, event)
            .await
            .map_err(|e| Fault::new(e.to_string()))?;
        Ok(value)
    }
}
