//! Callback pipeline.
//!
//! Handlers are registered per [`CallbackType`] together with a
//! [`Predicate`] over the [`InvocationContext`].  Executing a callback type
//! folds a value through every matching handler in registration order; any
//! handler may stop the fold early by returning [`Flow::Halt`].
//!
//! Handlers are user code.  An error or panic from a handler is logged and
//! skipped: the value is left as it was before that handler ran, and the fold
//! continues with the next one.
//!
//! The pipeline is a cheaply cloneable handle; clones share one table.  No
//! lock is held while a handler runs, so handlers may register or unregister
//! other callbacks without deadlocking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::InvocationContext;
use crate::error::{KernelError, Result};
use crate::fault::{Fault, guard};

// ---------------------------------------------------------------------------
// Callback types and ids
// ---------------------------------------------------------------------------

/// The points in an invocation at which callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackType {
    BeforeRun,
    AfterRun,
    BeforeLlmCall,
    AfterLlmCall,
    BeforeToolCall,
    AfterToolCall,
    OnError,
}

impl CallbackType {
    /// Every callback type, in lifecycle order.
    pub const ALL: [CallbackType; 7] = [
        Self::BeforeRun,
        Self::AfterRun,
        Self::BeforeLlmCall,
        Self::AfterLlmCall,
        Self::BeforeToolCall,
        Self::AfterToolCall,
        Self::OnError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeRun => "before_run",
            Self::AfterRun => "after_run",
            Self::BeforeLlmCall => "before_llm_call",
            Self::AfterLlmCall => "after_llm_call",
            Self::BeforeToolCall => "before_tool_call",
            Self::AfterToolCall => "after_tool_call",
            Self::OnError => "on_error",
        }
    }
}

impl fmt::Display for CallbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier handed out by [`CallbackPipeline::register`].  Ids are unique
/// and strictly increasing across all callback types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(u64);

impl CallbackId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

/// Result of a handler, and of a whole pipeline execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Pass this value to the next handler.
    Continue(Value),
    /// Stop the pipeline; this value is final.
    Halt(Value),
}

impl Flow {
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt(_))
    }

    pub fn value(&self) -> &Value {
        match self {
            Self::Continue(v) | Self::Halt(v) => v,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Continue(v) | Self::Halt(v) => v,
        }
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A partial map of context fields that must all match for a handler to run.
///
/// The empty predicate matches every context.  Keys outside
/// [`CONTEXT_FIELDS`](crate::context::CONTEXT_FIELDS) never match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Predicate(BTreeMap<String, Value>);

impl Predicate {
    /// The empty predicate.
    pub fn any() -> Self {
        Self::default()
    }

    /// Add a required field value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every key in this predicate equals the same field in `ctx`.
    pub fn matches(&self, ctx: &InvocationContext) -> bool {
        self.0
            .iter()
            .all(|(key, expected)| ctx.field(key).as_ref() == Some(expected))
    }

    /// Whether every key/value pair of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &Predicate) -> bool {
        self.0
            .iter()
            .all(|(key, value)| other.0.get(key) == Some(value))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Predicate {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A callback handler.
///
/// Implemented for every `Fn(Value, &InvocationContext) -> Result<Flow, Fault>`
/// closure, so most callers never name this trait.
pub trait CallbackHandler: Send + Sync {
    fn handle(&self, value: Value, ctx: &InvocationContext) -> std::result::Result<Flow, Fault>;
}

impl<F> CallbackHandler for F
where
    F: Fn(Value, &InvocationContext) -> std::result::Result<Flow, Fault> + Send + Sync,
{
    fn handle(&self, value: Value, ctx: &InvocationContext) -> std::result::Result<Flow, Fault> {
        self(value, ctx)
    }
}

#[derive(Clone)]
struct CallbackEntry {
    id: CallbackId,
    predicate: Predicate,
    handler: Arc<dyn CallbackHandler>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PipelineInner {
    entries: DashMap<CallbackType, Vec<CallbackEntry>>,
    next_id: AtomicU64,
}

/// Shared table of callback handlers, keyed by [`CallbackType`].
#[derive(Clone, Default)]
pub struct CallbackPipeline {
    inner: Arc<PipelineInner>,
}

impl CallbackPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.  It runs after every handler of the same type
    /// registered before it.
    pub fn register(
        &self,
        callback_type: CallbackType,
        predicate: Predicate,
        handler: impl CallbackHandler + 'static,
    ) -> CallbackId {
        // Allocate the id under the shard lock so list order matches id order.
        let mut list = self.inner.entries.entry(callback_type).or_default();
        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        list.push(CallbackEntry {
            id,
            predicate,
            handler: Arc::new(handler),
        });
        drop(list);

        tracing::debug!(callback_type = %callback_type, callback_id = %id, "callback registered");
        id
    }

    /// Remove one handler by id.
    pub fn unregister(&self, callback_type: CallbackType, id: CallbackId) -> Result<()> {
        let removed = self
            .inner
            .entries
            .get_mut(&callback_type)
            .and_then(|mut list| {
                let pos = list.iter().position(|e| e.id == id)?;
                Some(list.remove(pos))
            });

        match removed {
            Some(_) => {
                tracing::debug!(callback_type = %callback_type, callback_id = %id, "callback unregistered");
                Ok(())
            }
            None => Err(KernelError::CallbackNotFound { callback_type, id }),
        }
    }

    /// Remove every handler of `callback_type` whose predicate is a subset of
    /// `filter`.  Returns the number removed.
    ///
    /// An empty handler predicate is a subset of everything, so catch-all
    /// handlers are always removed; an empty `filter` removes only catch-all
    /// handlers.
    pub fn unregister_by_filter(&self, callback_type: CallbackType, filter: &Predicate) -> usize {
        let Some(mut list) = self.inner.entries.get_mut(&callback_type) else {
            return 0;
        };
        let before = list.len();
        list.retain(|e| !e.predicate.is_subset_of(filter));
        let removed = before - list.len();
        drop(list);

        if removed > 0 {
            tracing::debug!(callback_type = %callback_type, removed, "callbacks unregistered by filter");
        }
        removed
    }

    /// Fold `value` through every handler of `callback_type` whose predicate
    /// matches `ctx`.
    ///
    /// Returns [`Flow::Halt`] with the halting handler's value if any handler
    /// halts, otherwise [`Flow::Continue`] with the final value.  With no
    /// matching handlers the input is returned unchanged.
    pub fn execute(&self, callback_type: CallbackType, value: Value, ctx: &InvocationContext) -> Flow {
        let matching: Vec<CallbackEntry> = self
            .inner
            .entries
            .get(&callback_type)
            .map(|list| {
                list.iter()
                    .filter(|e| e.predicate.matches(ctx))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut current = value;
        for entry in matching {
            let input = current.clone();
            match guard(|| entry.handler.handle(input, ctx)) {
                Ok(Flow::Continue(next)) => current = next,
                Ok(Flow::Halt(last)) => {
                    tracing::debug!(
                        callback_type = %callback_type,
                        callback_id = %entry.id,
                        invocation_id = %ctx.invocation_id,
                        "callback halted pipeline"
                    );
                    return Flow::Halt(last);
                }
                Err(fault) => {
                    tracing::warn!(
                        callback_type = %callback_type,
                        callback_id = %entry.id,
                        invocation_id = %ctx.invocation_id,
                        error = %fault,
                        "callback failed; value left unchanged"
                    );
                }
            }
        }
        Flow::Continue(current)
    }

    /// Number of handlers registered for `callback_type`.
    pub fn count(&self, callback_type: CallbackType) -> usize {
        self.inner
            .entries
            .get(&callback_type)
            .map_or(0, |list| list.len())
    }

    /// Remove every handler of every type.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
