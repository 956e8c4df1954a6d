//! Concurrent tool registry.
//!
//! The registry maps tool names to implementations of the [`Tool`] trait and
//! is the only path through which workflow steps and LLM tool calls reach a
//! tool.
//!
//! Internally the registry is backed by [`DashMap`], which provides lock-free
//! concurrent reads and per-shard write locking.  Registration goes through
//! [`DashMap::entry`], so the conflict check and the insert happen under the
//! same shard lock: concurrent registrations of the same name yield exactly
//! one winner, and an existing entry is never replaced.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use agentloom_kernel::registry::{Params, Tool, ToolDefinition, ToolRegistry};
//! # use agentloom_kernel::{Fault, InvocationContext};
//! # use serde_json::Value;
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Tool for Echo {
//!     fn definition(&self) -> ToolDefinition {
//!         ToolDefinition::new("echo", "Echo the params back", serde_json::json!({"type": "object"}))
//!     }
//!
//!     async fn execute(&self, params: Params, _ctx: &InvocationContext) -> Result<Value, Fault> {
//!         Ok(Value::Object(params))
//!     }
//! }
//!
//! let registry = ToolRegistry::new();
//! registry.register("echo", Arc::new(Echo)).unwrap();
//! assert!(registry.contains("echo"));
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::InvocationContext;
use crate::error::{KernelError, Result};
use crate::fault::{Fault, guard, guard_async};
use crate::telemetry::{TelemetryBus, TelemetryEvent};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Tool parameters: a JSON object.
pub type Params = Map<String, Value>;

/// Self-description of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Machine-readable tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's parameters.  Must be an object.
    pub param_schema: Value,
}

impl ToolDefinition {
    /// Create a definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        param_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            param_schema,
        }
    }
}

/// A tool implementation.
///
/// The two required capabilities are [`Tool::definition`] and
/// [`Tool::execute`]; the trait makes it impossible to register an
/// implementation that lacks either, and [`ToolRegistry::register`] validates
/// that the definition is usable.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Describe this tool.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool.  Errors and panics are reported by the registry as
    /// [`KernelError::ToolExecutionFailed`].
    async fn execute(
        &self,
        params: Params,
        ctx: &InvocationContext,
    ) -> std::result::Result<Value, Fault>;
}

/// Snapshot of a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Name the tool is registered under.
    pub name: String,
    /// The tool's definition as reported at registration time.
    pub definition: ToolDefinition,
    /// When the tool was registered.
    pub registered_at: DateTime<Utc>,
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    definition: ToolDefinition,
    registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent tool registry backed by [`DashMap`].
///
/// The registry is cheaply cloneable (`Arc`-backed) and `Send + Sync`; clones
/// share the same table.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    inner: Arc<DashMap<String, RegisteredTool>>,
    telemetry: Option<TelemetryBus>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a telemetry bus; every execution publishes a
    /// [`TelemetryEvent::ToolExecuted`].
    #[must_use]
    pub fn with_telemetry(mut self, bus: TelemetryBus) -> Self {
        self.telemetry = Some(bus);
        self
    }

    /// Register a tool under `name`.
    ///
    /// Fails with [`KernelError::ToolAlreadyRegistered`] if the name is taken
    /// and with [`KernelError::InvalidToolModule`] if the tool's definition is
    /// unusable.
    pub fn register(&self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Result<()> {
        let name = name.into();
        let definition = validate(&name, tool.as_ref())?;

        match self.inner.entry(name.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(tool = %name, "tool registration rejected: name taken");
                Err(KernelError::ToolAlreadyRegistered { name })
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredTool {
                    tool,
                    definition,
                    registered_at: Utc::now(),
                });
                tracing::info!(tool = %name, "tool registered");
                Ok(())
            }
        }
    }

    /// Remove a tool.  Idempotent; returns whether an entry was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.remove(name).is_some();
        if removed {
            tracing::info!(tool = %name, "tool unregistered");
        }
        removed
    }

    /// Look up a tool implementation by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.inner
            .get(name)
            .map(|entry| Arc::clone(&entry.tool))
            .ok_or_else(|| KernelError::ToolNotFound {
                name: name.to_string(),
            })
    }

    /// Look up and execute a tool.
    ///
    /// Errors returned by the tool and panics raised while it runs are both
    /// reported as [`KernelError::ToolExecutionFailed`]; nothing propagates
    /// to the caller as an unhandled fault.
    pub async fn execute(
        &self,
        name: &str,
        params: Params,
        ctx: &InvocationContext,
    ) -> Result<Value> {
        // The shard guard is released here, before any await point.
        let tool = self.lookup(name)?;
        let started = Instant::now();

        tracing::debug!(
            tool = %name,
            invocation_id = %ctx.invocation_id,
            "executing tool"
        );

        let outcome = guard_async(tool.execute(params, ctx)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(bus) = &self.telemetry {
            bus.publish(TelemetryEvent::ToolExecuted {
                tool: name.to_string(),
                invocation_id: ctx.invocation_id,
                success: outcome.is_ok(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        outcome.map_err(|fault| {
            tracing::warn!(tool = %name, error = %fault, "tool execution failed");
            KernelError::ToolExecutionFailed {
                name: name.to_string(),
                reason: fault.message().to_string(),
            }
        })
    }

    /// Definitions for the given names, renamed to their registry keys.
    /// Unknown names are skipped.
    pub fn definitions<S: AsRef<str>>(&self, names: &[S]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                let entry = self.inner.get(name);
                if entry.is_none() {
                    tracing::warn!(tool = %name, "declared tool is not registered");
                }
                entry.map(|e| ToolDefinition {
                    name: name.to_string(),
                    ..e.definition.clone()
                })
            })
            .collect()
    }

    /// Return a snapshot of all registered tools.
    pub fn list_all(&self) -> Vec<ToolInfo> {
        self.inner
            .iter()
            .map(|e| ToolInfo {
                name: e.key().clone(),
                definition: e.definition.clone(),
                registered_at: e.registered_at,
            })
            .collect()
    }

    /// Return the names of all registered tools.
    pub fn list_names(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Whether a tool is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Return the total number of registered tools.
    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

/// Check that a tool describes itself usably.
fn validate(name: &str, tool: &dyn Tool) -> Result<ToolDefinition> {
    let invalid = |reason: String| KernelError::InvalidToolModule {
        name: name.to_string(),
        reason,
    };

    if name.trim().is_empty() {
        return Err(invalid("registration name is empty".into()));
    }

    let definition = guard(|| Ok(tool.definition()))
        .map_err(|fault| invalid(format!("definition() failed: {fault}")))?;

    if definition.name.trim().is_empty() {
        return Err(invalid("definition has an empty name".into()));
    }
    if !definition.param_schema.is_object() {
        return Err(invalid("parameter schema must be a JSON object".into()));
    }

    Ok(definition)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("upper", "Uppercase `text`", json!({"type": "object"}))
        }

        async fn execute(
            &self,
            params: Params,
            _ctx: &InvocationContext,
        ) -> std::result::Result<Value, Fault> {
            let text = params
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| Fault::new("missing `text`"))?;
            Ok(Value::from(text.to_uppercase()))
        }
    }

    struct Exploding;

    #[async_trait]
    impl Tool for Exploding {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("explode", "Always panics", json!({"type": "object"}))
        }

        async fn execute(
            &self,
            _params: Params,
            _ctx: &InvocationContext,
        ) -> std::result::Result<Value, Fault> {
            panic!("kaboom")
        }
    }

    struct BadSchema;

    #[async_trait]
    impl Tool for BadSchema {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("bad", "Schema is a string", json!("nope"))
        }

        async fn execute(
            &self,
            _params: Params,
            _ctx: &InvocationContext,
        ) -> std::result::Result<Value, Fault> {
            Ok(Value::Null)
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new("session", "agent", "sequential")
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register("upper", Arc::new(Upper)).expect("register");

        assert!(registry.contains("upper"));
        assert_eq!(registry.count(), 1);
        let tool = registry.lookup("upper").expect("tool should exist");
        assert_eq!(tool.definition().name, "upper");
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_original() {
        let registry = ToolRegistry::new();
        registry.register("upper", Arc::new(Upper)).unwrap();

        let result = registry.register("upper", Arc::new(BadSchema));
        // Validation runs first, so use a valid tool to hit the name check.
        assert!(result.is_err());
        let result = registry.register("upper", Arc::new(Upper));
        assert!(matches!(
            result,
            Err(KernelError::ToolAlreadyRegistered { name }) if name == "upper"
        ));
        assert_eq!(registry.lookup("upper").unwrap().definition().name, "upper");
    }

    #[test]
    fn invalid_modules_are_rejected() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.register("bad", Arc::new(BadSchema)),
            Err(KernelError::InvalidToolModule { .. })
        ));
        assert!(matches!(
            registry.register("  ", Arc::new(Upper)),
            Err(KernelError::InvalidToolModule { .. })
        ));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ToolRegistry::new();
        registry.register("upper", Arc::new(Upper)).unwrap();

        assert!(registry.unregister("upper"));
        assert!(!registry.unregister("upper"));
        assert!(matches!(
            registry.lookup("upper"),
            Err(KernelError::ToolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn execute_success() {
        let registry = ToolRegistry::new();
        registry.register("upper", Arc::new(Upper)).unwrap();

        let out = registry
            .execute("upper", params(json!({"text": "hi"})), &ctx())
            .await
            .expect("execute");
        assert_eq!(out, json!("HI"));
    }

    #[tokio::test]
    async fn execute_missing_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("ghost", Params::new(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            KernelError::ToolNotFound {
                name: "ghost".into()
            }
        );
    }

    #[tokio::test]
    async fn tool_errors_and_panics_become_execution_failures() {
        let registry = ToolRegistry::new();
        registry.register("upper", Arc::new(Upper)).unwrap();
        registry.register("explode", Arc::new(Exploding)).unwrap();

        let err = registry
            .execute("upper", Params::new(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::ToolExecutionFailed { ref reason, .. } if reason == "missing `text`"
        ));

        let err = registry
            .execute("explode", Params::new(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::ToolExecutionFailed { ref name, ref reason }
                if name == "explode" && reason.contains("kaboom")
        ));
    }

    #[tokio::test]
    async fn execution_publishes_telemetry() {
        let bus = TelemetryBus::new(8);
        let mut rx = bus.subscribe();
        let registry = ToolRegistry::new().with_telemetry(bus);
        registry.register("upper", Arc::new(Upper)).unwrap();

        registry
            .execute("upper", params(json!({"text": "a"})), &ctx())
            .await
            .unwrap();

        let event = rx.recv().await.expect("event");
        match event.as_ref() {
            TelemetryEvent::ToolExecuted { tool, success, .. } => {
                assert_eq!(tool, "upper");
                assert!(*success);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn definitions_use_registry_names_and_skip_unknown() {
        let registry = ToolRegistry::new();
        registry.register("shout", Arc::new(Upper)).unwrap();

        let defs = registry.definitions(&["shout", "missing"]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "shout");
        assert_eq!(defs[0].description, "Uppercase `text`");
    }
}
