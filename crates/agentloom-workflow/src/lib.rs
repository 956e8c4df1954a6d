//! Workflow strategies for agentloom.
//!
//! An agent's configuration selects one of four strategies:
//!
//! - [`sequential`] -- steps folded left to right.
//! - [`parallel`] -- tasks fanned out on one input through a bounded worker
//!   pool, with per-task timeouts and a halt-on-error policy.
//! - [`looping`] -- steps repeated until a condition holds or an iteration
//!   cap is reached.
//! - [`llm`] -- a ReAct tool-use loop over an [`LlmProvider`].
//!
//! ## Modules
//!
//! - [`step`] -- The [`Step`] type and step execution.
//! - [`config`] -- [`AgentConfig`] and its validating builders.
//! - [`engine`] -- The [`Workflow`] trait, [`WorkflowEnv`] and
//!   [`build_workflow`].
//! - [`memory`] -- The session [`MemoryStore`] contract and
//!   [`InMemoryStore`].
//! - [`error`] -- Workflow error types.

pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod looping;
pub mod memory;
pub mod parallel;
pub mod sequential;
pub mod step;

pub use config::{
    AgentConfig, AgentKind, Condition, LlmConfig, LoopConfig, ParallelConfig, SequentialConfig,
};
pub use engine::{LoopStatus, Workflow, WorkflowEnv, WorkflowOutput, build_workflow};
pub use error::{
    ConfigError, MemoryError, PartialResults, Result, StepFailure, StepKind, TaskFailure,
    WorkflowError,
};
pub use llm::{ChatResponse, LlmProvider, LlmWorkflow, Message, Role, ToolCall};
pub use memory::{InMemoryStore, MemoryStore, SessionEvent, StateMap, apply_delta};
pub use step::Step;
