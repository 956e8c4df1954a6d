//! Workflow error types.
//!
//! Every failure inside a workflow is reported as a [`WorkflowError`] value.
//! Errors are `Clone` so that the parallel strategy can keep a copy of each
//! task failure in its partial results while still reporting the first one.

use std::collections::BTreeMap;
use std::fmt;

use agentloom_kernel::{Fault, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// A problem with an agent configuration, detected when it is built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A mandatory field was not provided.
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    /// The agent name is empty or whitespace.
    #[error("agent name must not be empty")]
    EmptyName,

    /// The parallel task timeout is zero.
    #[error("task timeout must be greater than zero")]
    InvalidTimeout,

    /// Any other invalid value.
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ---------------------------------------------------------------------------
// Memory errors
// ---------------------------------------------------------------------------

/// Failure reported by a [`MemoryStore`](crate::memory::MemoryStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The backing store failed (I/O, SQL, serialization).
    #[error("memory backend error: {reason}")]
    Backend { reason: String },
}

// ---------------------------------------------------------------------------
// Step errors
// ---------------------------------------------------------------------------

/// Which kind of step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Tool,
    Function,
    Transform,
    UnknownType,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Function => "function",
            Self::Transform => "transform",
            Self::UnknownType => "unknown_type",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The underlying cause of a step failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepFailure {
    /// The tool registry refused or the tool itself failed.
    #[error(transparent)]
    Tool(#[from] KernelError),

    /// A step function or transform returned an error or panicked.
    #[error(transparent)]
    Fault(#[from] Fault),

    /// The memory snapshot for a transform could not be fetched.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The step has no recognised shape.
    #[error("unrecognised step shape: {shape}")]
    UnknownShape { shape: String },
}

// ---------------------------------------------------------------------------
// Parallel task failures
// ---------------------------------------------------------------------------

/// Why a single parallel task did not produce a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskFailure {
    #[error("{0}")]
    Error(Box<WorkflowError>),

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
}

/// Successes and failures observed by a parallel run, keyed by task index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResults {
    pub successes: BTreeMap<usize, Value>,
    pub failures: BTreeMap<usize, TaskFailure>,
}

impl PartialResults {
    /// Number of tasks accounted for.
    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Workflow errors
// ---------------------------------------------------------------------------

/// Unified error type for workflow execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    // -- Construction -------------------------------------------------------
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    // -- Execution ----------------------------------------------------------
    /// A step failed; later steps did not run.
    #[error("{kind} step `{descriptor}` failed: {cause}")]
    StepExecution {
        kind: StepKind,
        descriptor: String,
        cause: StepFailure,
    },

    /// At least one parallel task failed.  `index`/`failure` is the first
    /// failure (first observed when halting, lowest index otherwise).
    #[error("parallel task {index} failed: {failure}")]
    ParallelTaskFailed {
        index: usize,
        failure: TaskFailure,
        partial: PartialResults,
    },

    /// A loop condition returned an error or panicked.
    #[error("loop condition failed: {cause}")]
    Condition { cause: Fault },

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// The language model failed or the tool-use loop ran out of turns.
    #[error("llm error: {reason}")]
    Llm { reason: String },

    /// A fault that escaped the strategy's own error handling.
    #[error("fault: {reason}")]
    Fault { reason: String },
}

/// Convenience alias used throughout the workflow crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;

impl WorkflowError {
    /// Short machine-readable tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::StepExecution { .. } => "step_execution_error",
            Self::ParallelTaskFailed { .. } => "parallel_task_failed",
            Self::Condition { .. } => "condition_error",
            Self::Memory(_) => "memory_error",
            Self::Llm { .. } => "llm_error",
            Self::Fault { .. } => "fault",
        }
    }

    /// Render the error as a JSON value, the shape handed to `on_error`
    /// callbacks and printed by the CLI.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("error".into(), Value::from(self.kind()));
        obj.insert("message".into(), Value::from(self.to_string()));

        match self {
            Self::StepExecution {
                kind,
                descriptor,
                cause,
            } => {
                obj.insert("step_kind".into(), Value::from(kind.as_str()));
                obj.insert("step".into(), Value::from(descriptor.as_str()));
                obj.insert("cause".into(), Value::from(cause.to_string()));
            }
            Self::ParallelTaskFailed {
                index,
                failure,
                partial,
            } => {
                let successes: Map<String, Value> = partial
                    .successes
                    .iter()
                    .map(|(i, v)| (i.to_string(), v.clone()))
                    .collect();
                let failures: Map<String, Value> = partial
                    .failures
                    .iter()
                    .map(|(i, f)| (i.to_string(), Value::from(f.to_string())))
                    .collect();
                obj.insert("index".into(), json!(index));
                obj.insert("failure".into(), Value::from(failure.to_string()));
                obj.insert("successes".into(), Value::Object(successes));
                obj.insert("failures".into(), Value::Object(failures));
            }
            Self::Condition { cause } => {
                obj.insert("cause".into(), Value::from(cause.message()));
            }
            _ => {}
        }

        Value::Object(obj)
    }
}
