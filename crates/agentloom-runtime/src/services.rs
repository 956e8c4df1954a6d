//! Shared services handed to every agent actor.

use std::fmt;
use std::sync::Arc;

use agentloom_kernel::{CallbackPipeline, TelemetryBus, ToolRegistry, WorkerPool};
use agentloom_workflow::{InMemoryStore, MemoryStore, WorkflowEnv};

use crate::config::RuntimeConfig;
use crate::error::Result;

/// The process-wide tables and collaborators agents share.
///
/// Cloning is cheap and every clone refers to the same registry, pipeline,
/// memory, pool and bus.
#[derive(Clone)]
pub struct Services {
    pub tools: ToolRegistry,
    pub callbacks: CallbackPipeline,
    pub memory: Arc<dyn MemoryStore>,
    pub pool: WorkerPool,
    pub telemetry: TelemetryBus,
}

impl Services {
    /// Build services sized by `config`, with an in-memory session store.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let telemetry = TelemetryBus::new(config.telemetry.capacity);
        let pool = match config.worker_pool.max_concurrency {
            Some(n) => WorkerPool::new(n)?,
            None => WorkerPool::default(),
        };
        Ok(Self {
            tools: ToolRegistry::new().with_telemetry(telemetry.clone()),
            callbacks: CallbackPipeline::new(),
            memory: Arc::new(InMemoryStore::new()),
            pool,
            telemetry,
        })
    }

    /// Replace the session store.
    #[must_use]
    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    /// The environment workflows run in.
    pub fn workflow_env(&self) -> WorkflowEnv {
        WorkflowEnv::new(
            self.tools.clone(),
            self.callbacks.clone(),
            Arc::clone(&self.memory),
            self.pool.clone(),
        )
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("tools", &self.tools.count())
            .field("pool", &self.pool)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}
