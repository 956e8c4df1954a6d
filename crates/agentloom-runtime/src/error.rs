//! Runtime error types.
//!
//! Callers of an agent see exactly two shapes: an output value or a
//! [`RuntimeError`].  Workflow failures arrive as
//! [`RuntimeError::AgentExecution`], which keeps the typed cause next to the
//! payload produced by the `on_error` callback stage.

use agentloom_kernel::KernelError;
use agentloom_workflow::{ConfigError, WorkflowError};
use serde_json::Value;

/// Unified error type for agent actors and the supervisor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    // -- Configuration -------------------------------------------------------
    /// The agent configuration is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The runtime configuration could not be loaded.
    #[error("runtime config error: {reason}")]
    RuntimeConfig { reason: String },

    /// A kernel service could not be created.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    // -- Invocation ----------------------------------------------------------
    /// The workflow failed or faulted.  `payload` is the error value after
    /// the `on_error` callbacks ran.
    #[error("agent execution failed: {cause}")]
    AgentExecution { cause: WorkflowError, payload: Value },

    /// The caller stopped waiting.  The invocation keeps running.
    #[error("agent `{agent}` did not reply within {timeout_ms}ms")]
    Timeout { agent: String, timeout_ms: u64 },

    /// The actor behind this handle has stopped or been replaced.
    #[error("agent `{agent}` is no longer running")]
    NotRunning { agent: String },

    // -- Supervision ---------------------------------------------------------
    #[error("agent not found: {name}")]
    AgentNotFound { name: String },

    #[error("agent already running: {name}")]
    AgentAlreadyRunning { name: String },

    /// The agent crashed more often than the restart intensity allows.
    #[error("agent `{name}` exceeded {max_restarts} restarts; giving up")]
    RestartLimitExceeded { name: String, max_restarts: u32 },
}

/// Convenience alias used throughout the runtime crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Short machine-readable tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::RuntimeConfig { .. } => "runtime_config_error",
            Self::Kernel(_) => "kernel_error",
            Self::AgentExecution { .. } => "agent_execution_error",
            Self::Timeout { .. } => "timeout",
            Self::NotRunning { .. } => "not_running",
            Self::AgentNotFound { .. } => "agent_not_found",
            Self::AgentAlreadyRunning { .. } => "agent_already_running",
            Self::RestartLimitExceeded { .. } => "restart_limit_exceeded",
        }
    }

    /// Structured representation for callers that print or forward errors.
    /// Execution errors yield their `on_error` payload.
    pub fn to_value(&self) -> Value {
        match self {
            Self::AgentExecution { payload, .. } => payload.clone(),
            other => serde_json::json!({
                "error": other.kind(),
                "message": other.to_string(),
            }),
        }
    }
}
