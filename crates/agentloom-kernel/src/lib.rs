//! agentloom kernel.
//!
//! The shared services every agent is built on:
//!
//! - **[`registry`]** -- Concurrent tool registry using [`DashMap`] with
//!   insert-if-absent registration and fault-isolated execution.
//! - **[`callback`]** -- Typed callback pipelines with context predicates and
//!   continue/halt control.
//! - **[`context`]** -- The per-invocation [`InvocationContext`].
//! - **[`pool`]** -- Bounded worker pool for parallel task execution.
//! - **[`telemetry`]** -- Lifecycle event bus backed by
//!   [`tokio::sync::broadcast`].
//! - **[`fault`]** -- The [`Fault`] type for user code and the panic guards.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.
//!
//! [`DashMap`]: dashmap::DashMap

pub mod callback;
pub mod context;
pub mod error;
pub mod fault;
pub mod pool;
pub mod registry;
pub mod telemetry;

pub use callback::{CallbackHandler, CallbackId, CallbackPipeline, CallbackType, Flow, Predicate};
pub use context::{CONTEXT_FIELDS, InvocationContext};
pub use error::{KernelError, Result};
pub use fault::{Fault, guard, guard_async};
pub use pool::WorkerPool;
pub use registry::{Params, Tool, ToolDefinition, ToolInfo, ToolRegistry};
pub use telemetry::{TelemetryBus, TelemetryEvent};
