//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

use crate::callback::{CallbackId, CallbackType};

/// Unified error type for the agentloom kernel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    // -- Tool registry errors -----------------------------------------------
    /// A tool is already registered under this name.  Registration never
    /// replaces an existing entry.
    #[error("tool already registered: {name}")]
    ToolAlreadyRegistered { name: String },

    /// The tool implementation does not describe itself usably: an empty
    /// name, a panicking `definition()`, or a non-object parameter schema.
    #[error("invalid tool module `{name}`: {reason}")]
    InvalidToolModule { name: String, reason: String },

    /// The requested tool is not registered.
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// The tool returned an error or panicked while executing.
    #[error("tool `{name}` failed: {reason}")]
    ToolExecutionFailed { name: String, reason: String },

    // -- Callback errors ----------------------------------------------------
    /// No callback with this id is registered for the given type.
    #[error("callback {id} not found for {callback_type}")]
    CallbackNotFound {
        callback_type: CallbackType,
        id: CallbackId,
    },

    // -- Worker pool errors -------------------------------------------------
    /// The worker pool was configured with zero slots.
    #[error("worker pool needs at least one slot")]
    InvalidPoolSize,

    /// The worker pool was closed and no longer hands out permits.
    #[error("worker pool is closed")]
    WorkerPoolClosed,
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
