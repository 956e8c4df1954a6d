//! Workflow engine: strategy selection and shared execution environment.
//!
//! [`build_workflow`] turns an [`AgentConfig`] into the matching [`Workflow`]
//! implementation once, at agent construction.  Every run then goes straight
//! to that implementation with a [`WorkflowEnv`] holding the shared services.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use agentloom_kernel::{CallbackPipeline, InvocationContext, ToolRegistry, WorkerPool};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{AgentConfig, AgentKind};
use crate::error::{ConfigError, Result};
use crate::llm::LlmWorkflow;
use crate::looping::LoopWorkflow;
use crate::memory::{InMemoryStore, MemoryStore};
use crate::parallel::ParallelWorkflow;
use crate::sequential::SequentialWorkflow;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Services a workflow reaches while it runs.  Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEnv {
    pub tools: ToolRegistry,
    pub callbacks: CallbackPipeline,
    pub memory: Arc<dyn MemoryStore>,
    pub pool: WorkerPool,
}

impl WorkflowEnv {
    pub fn new(
        tools: ToolRegistry,
        callbacks: CallbackPipeline,
        memory: Arc<dyn MemoryStore>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            tools,
            callbacks,
            memory,
            pool,
        }
    }
}

impl Default for WorkflowEnv {
    /// Fresh registry and pipeline, an [`InMemoryStore`], and a default-sized
    /// worker pool.
    fn default() -> Self {
        Self {
            tools: ToolRegistry::new(),
            callbacks: CallbackPipeline::new(),
            memory: Arc::new(InMemoryStore::new()),
            pool: WorkerPool::default(),
        }
    }
}

impl fmt::Debug for WorkflowEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEnv")
            .field("tools", &self.tools.count())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// How a loop workflow terminated successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    ConditionMet,
    MaxIterationsReached,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConditionMet => "condition_met",
            Self::MaxIterationsReached => "max_iterations_reached",
        }
    }
}

/// Successful result of a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutput {
    Sequential {
        output: Value,
    },
    Parallel {
        /// Task outputs keyed by task index.
        output: BTreeMap<usize, Value>,
        /// Outputs in index order, joined by newlines.
        combined: String,
    },
    Loop {
        output: Value,
        status: LoopStatus,
        iterations: u32,
    },
    Llm {
        output: String,
        turns: u32,
    },
}

impl WorkflowOutput {
    /// The primary output value.
    pub fn output(&self) -> Value {
        match self {
            Self::Sequential { output } | Self::Loop { output, .. } => output.clone(),
            Self::Parallel { output, .. } => Value::Object(index_map(output)),
            Self::Llm { output, .. } => Value::from(output.as_str()),
        }
    }

    /// Render as the JSON result handed to `after_run` and to callers:
    /// `{output}`, `{output, combined}`, `{output, status, iterations}` or
    /// `{output, turns}`.
    pub fn into_value(self) -> Value {
        let mut obj = Map::new();
        match self {
            Self::Sequential { output } => {
                obj.insert("output".into(), output);
            }
            Self::Parallel { output, combined } => {
                obj.insert("output".into(), Value::Object(index_map(&output)));
                obj.insert("combined".into(), Value::from(combined));
            }
            Self::Loop {
                output,
                status,
                iterations,
            } => {
                obj.insert("output".into(), output);
                obj.insert("status".into(), Value::from(status.as_str()));
                obj.insert("iterations".into(), Value::from(iterations));
            }
            Self::Llm { output, turns } => {
                obj.insert("output".into(), Value::from(output));
                obj.insert("turns".into(), Value::from(turns));
            }
        }
        Value::Object(obj)
    }
}

fn index_map(output: &BTreeMap<usize, Value>) -> Map<String, Value> {
    output
        .iter()
        .map(|(i, v)| (i.to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// One execution strategy bound to its configuration.
#[async_trait]
pub trait Workflow: Send + Sync {
    fn kind(&self) -> AgentKind;

    fn name(&self) -> &str;

    /// Run the workflow on `input`.  Runs are independent; nothing carries
    /// over from one to the next except session memory.
    async fn run(
        &self,
        input: Value,
        env: &WorkflowEnv,
        ctx: &InvocationContext,
    ) -> Result<WorkflowOutput>;
}

/// Validate `config` and select its strategy.
pub fn build_workflow(config: AgentConfig) -> std::result::Result<Arc<dyn Workflow>, ConfigError> {
    config.validate()?;
    let workflow: Arc<dyn Workflow> = match config {
        AgentConfig::Sequential(c) => Arc::new(SequentialWorkflow::new(c)),
        AgentConfig::Parallel(c) => Arc::new(ParallelWorkflow::new(c)),
        AgentConfig::Loop(c) => Arc::new(LoopWorkflow::new(c)),
        AgentConfig::Llm(c) => Arc::new(LlmWorkflow::new(c)),
    };
    tracing::debug!(agent = %workflow.name(), kind = %workflow.kind(), "workflow built");
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::SequentialConfig;

    #[test]
    fn output_shapes() {
        let seq = WorkflowOutput::Sequential { output: json!("1") };
        assert_eq!(seq.into_value(), json!({"output": "1"}));

        let par = WorkflowOutput::Parallel {
            output: BTreeMap::from([(0, json!("a")), (1, json!(2))]),
            combined: "a\n2".into(),
        };
        assert_eq!(
            par.into_value(),
            json!({"output": {"0": "a", "1": 2}, "combined": "a\n2"})
        );

        let lp = WorkflowOutput::Loop {
            output: json!(3),
            status: LoopStatus::MaxIterationsReached,
            iterations: 3,
        };
        assert_eq!(
            lp.into_value(),
            json!({"output": 3, "status": "max_iterations_reached", "iterations": 3})
        );
    }

    #[test]
    fn build_selects_strategy_once() {
        let config = SequentialConfig::builder()
            .name("seq")
            .steps(vec![])
            .build()
            .unwrap();
        let wf = build_workflow(config.into()).unwrap();
        assert_eq!(wf.kind(), AgentKind::Sequential);
        assert_eq!(wf.name(), "seq");
    }

    #[test]
    fn build_rejects_invalid_hand_made_config() {
        let config = AgentConfig::Sequential(SequentialConfig {
            name: String::new(),
            steps: vec![],
            tools: vec![],
        });
        assert_eq!(build_workflow(config).err(), Some(ConfigError::EmptyName));
    }
}
