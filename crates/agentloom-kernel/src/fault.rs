//! Faults raised by user-supplied code.
//!
//! Tools, step functions, loop conditions and callback handlers are written by
//! agent developers.  They report failure by returning a [`Fault`], and any
//! panic they raise is caught at the invocation site and converted into one,
//! so that nothing escapes into the actor's own control flow.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

/// A failure reported by (or caught from) user-supplied code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Fault {
    message: String,
}

impl Fault {
    /// Create a fault with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build a fault from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(format!("panicked: {detail}"))
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for Fault {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("json error: {err}"))
    }
}

/// Run a synchronous closure, converting a panic into a [`Fault`].
pub fn guard<T>(f: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}

/// Await a future, converting a panic raised while polling it into a [`Fault`].
pub async fn guard_async<T, F>(fut: F) -> Result<T, Fault>
where
    F: Future<Output = Result<T, Fault>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}
