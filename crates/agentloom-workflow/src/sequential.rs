//! Sequential strategy: fold steps left to right.

use agentloom_kernel::InvocationContext;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::{AgentKind, SequentialConfig};
use crate::engine::{Workflow, WorkflowEnv, WorkflowOutput};
use crate::error::Result;
use crate::step::run_steps;

pub struct SequentialWorkflow {
    config: SequentialConfig,
}

impl SequentialWorkflow {
    pub fn new(config: SequentialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Workflow for SequentialWorkflow {
    fn kind(&self) -> AgentKind {
        AgentKind::Sequential
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(
        &self,
        input: Value,
        env: &WorkflowEnv,
        ctx: &InvocationContext,
    ) -> Result<WorkflowOutput> {
        let output = run_steps(&self.config.steps, input, env, ctx).await?;
        Ok(WorkflowOutput::Sequential { output })
    }
}
