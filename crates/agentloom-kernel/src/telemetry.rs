//! Telemetry bus.
//!
//! A publish/subscribe channel for lifecycle events, built on top of
//! [`tokio::sync::broadcast`].  Agents, the supervisor and the tool registry
//! publish [`TelemetryEvent`]s; anything interested (a CLI progress printer,
//! a test) subscribes.
//!
//! Events are wrapped in [`Arc`] so broadcasting to several subscribers does
//! not clone the payload.  Publishing never blocks and never fails: with no
//! subscribers the event is dropped, and a subscriber that falls more than
//! `capacity` events behind observes `RecvError::Lagged`.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use agentloom_kernel::telemetry::{TelemetryBus, TelemetryEvent};
//! # async fn example() {
//! let bus = TelemetryBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(TelemetryEvent::AgentStopped {
//!     agent_name: "writer".into(),
//!     timestamp: chrono::Utc::now(),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An event that flows through the telemetry bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// An agent actor began accepting invocations.
    AgentStarted {
        agent_name: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An agent actor shut down.
    AgentStopped {
        agent_name: String,
        timestamp: DateTime<Utc>,
    },

    /// The supervisor replaced a dead agent actor.
    AgentRestarted {
        agent_name: String,
        /// Restarts within the current window, including this one.
        restarts: u32,
        timestamp: DateTime<Utc>,
    },

    /// An invocation was dequeued and is about to run.
    InvocationStarted {
        agent_name: String,
        invocation_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// An invocation produced a reply.
    InvocationCompleted {
        agent_name: String,
        invocation_id: Uuid,
        /// `before_run` halted, so the workflow never ran.
        halted: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An invocation ended in an agent execution error.
    InvocationFailed {
        agent_name: String,
        invocation_id: Uuid,
        error: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed through the registry.
    ToolExecuted {
        tool: String,
        invocation_id: Uuid,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Publish/subscribe telemetry bus backed by [`tokio::sync::broadcast`].
///
/// Cheaply cloneable; clones publish into the same channel.
#[derive(Clone)]
pub struct TelemetryBus {
    inner: Arc<TelemetryBusInner>,
}

struct TelemetryBusInner {
    sender: broadcast::Sender<Arc<TelemetryEvent>>,
}

impl std::fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl TelemetryBus {
    /// Create a bus with the given channel capacity (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(TelemetryBusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe it; zero when nobody
    /// is listening.
    pub fn publish(&self, event: TelemetryEvent) -> usize {
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "telemetry event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to all future events.  Earlier events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetryEvent>> {
        self.inner.sender.subscribe()
    }

    /// Return the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
