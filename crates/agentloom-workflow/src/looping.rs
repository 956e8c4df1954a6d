//! Loop strategy: repeat the steps until a condition holds.
//!
//! The loop is a small state machine.  From `Running(iteration, output)`:
//!
//! 1. if `iteration >= max_iterations`, stop with `MaxIterationsReached`;
//! 2. otherwise evaluate the condition on the output and a fresh session
//!    snapshot; `true` stops with `ConditionMet`, an error fails the run;
//! 3. otherwise fold the steps once and continue from
//!    `Running(iteration + 1, new_output)`.
//!
//! The cap is checked before the condition, so once it is reached the
//! condition is not evaluated again.

use agentloom_kernel::InvocationContext;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::{AgentKind, LoopConfig};
use crate::engine::{LoopStatus, Workflow, WorkflowEnv, WorkflowOutput};
use crate::error::{Result, WorkflowError};
use crate::step::run_steps;

#[derive(Debug)]
enum LoopState {
    Running { iteration: u32, output: Value },
    ConditionMet { iteration: u32, output: Value },
    MaxIterationsReached { iteration: u32, output: Value },
    Failed(WorkflowError),
}

pub struct LoopWorkflow {
    config: LoopConfig,
}

impl LoopWorkflow {
    pub fn new(config: LoopConfig) -> Self {
        Self { config }
    }

    async fn advance(
        &self,
        iteration: u32,
        output: Value,
        env: &WorkflowEnv,
        ctx: &InvocationContext,
    ) -> LoopState {
        if iteration >= self.config.max_iterations {
            return LoopState::MaxIterationsReached { iteration, output };
        }

        let state = match env.memory.full_state(&ctx.session_id).await {
            Ok(state) => state,
            Err(err) => return LoopState::Failed(err.into()),
        };
        match self.config.condition.evaluate(&output, &state) {
            Err(cause) => return LoopState::Failed(WorkflowError::Condition { cause }),
            Ok(true) => return LoopState::ConditionMet { iteration, output },
            Ok(false) => {}
        }

        tracing::debug!(agent = %self.config.name, iteration, "loop iteration");
        match run_steps(&self.config.steps, output, env, ctx).await {
            Ok(output) => LoopState::Running {
                iteration: iteration + 1,
                output,
            },
            Err(err) => LoopState::Failed(err),
        }
    }
}

#[async_trait]
impl Workflow for LoopWorkflow {
    fn kind(&self) -> AgentKind {
        AgentKind::Loop
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
        let mut state = LoopState::Running {
            iteration: 0,
            output: input,
        };

        loop {
            state = match state {
                LoopState::Running { iteration, output } => {
                    self.advance(iteration, output, env, ctx).await
                }
                LoopState::ConditionMet { iteration, output } => {
                    tracing::debug!(agent = %self.config.name, iteration, "loop condition met");
                    return Ok(WorkflowOutput::Loop {
                        output,
                        status: LoopStatus::ConditionMet,
                        iterations: iteration,
                    });
                }
                LoopState::MaxIterationsReached { iteration, output } => {
                    tracing::debug!(agent = %self.config.name, iteration, "loop hit max iterations");
                    return Ok(WorkflowOutput::Loop {
                        output,
                        status: LoopStatus::MaxIterationsReached,
                        iterations: iteration,
                    });
                }
                LoopState::Failed(err) => return Err(err),
            };
        }
    }
}
