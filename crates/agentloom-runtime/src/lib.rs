//! Agent actors and supervision for agentloom.
//!
//! Every agent runs as an isolated actor that serializes its invocations,
//! wraps each one in the `before_run`/`after_run`/`on_error` callback stages,
//! and turns panics into ordinary error replies.  Agents share one set of
//! [`Services`]; an [`AgentSupervisor`] restarts crashed actors one at a time.
//!
//! ## Modules
//!
//! - [`actor`] -- [`AgentRuntime`] and the caller-side [`AgentHandle`].
//! - [`supervisor`] -- One-for-one supervision with restart intensity.
//! - [`services`] -- The shared registry, pipeline, memory, pool and bus.
//! - [`config`] -- TOML-backed [`RuntimeConfig`].
//! - [`error`] -- [`RuntimeError`].

pub mod actor;
pub mod config;
pub mod error;
pub mod services;
pub mod supervisor;

pub use actor::{AgentHandle, AgentInfo, AgentRuntime, RunningAgent};
pub use config::{RuntimeConfig, SupervisorConfig, TelemetryConfig, WorkerPoolConfig};
pub use error::{Result, RuntimeError};
pub use services::Services;
pub use supervisor::AgentSupervisor;
