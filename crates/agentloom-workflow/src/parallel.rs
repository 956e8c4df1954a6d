//! Parallel strategy: fan out one input to every task, fan in by index.
//!
//! Each task runs as its own tokio task, gated by the shared [`WorkerPool`]
//! and bounded by `task_timeout`, which starts once the task holds a pool
//! slot.  A timed-out task's future is dropped, so it is cancelled at its
//! next await point; a synchronous body already running on the blocking pool
//! is abandoned and its result discarded.
//!
//! With `halt_on_error` the first observed failure ends the run and every
//! task still in flight is aborted; otherwise all tasks are awaited and the
//! lowest-indexed failure is reported.
//!
//! [`WorkerPool`]: agentloom_kernel::WorkerPool

use std::collections::BTreeMap;
use std::time::Duration;

use agentloom_kernel::InvocationContext;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tokio::task::{AbortHandle, JoinError};

use crate::config::{AgentKind, ParallelConfig};
use crate::engine::{Workflow, WorkflowEnv, WorkflowOutput};
use crate::error::{PartialResults, Result, TaskFailure, WorkflowError};
use crate::step::{Step, execute_step};

pub struct ParallelWorkflow {
    config: ParallelConfig,
}

impl ParallelWorkflow {
    pub fn new(config: ParallelConfig) -> Self {
        Self { config }
    }
}

/// Aborts every task it holds when dropped, so no task outlives the run.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

type TaskOutcome = std::result::Result<Value, TaskFailure>;

async fn run_task(
    task: Step,
    input: Value,
    env: WorkflowEnv,
    ctx: InvocationContext,
    timeout: Duration,
) -> TaskOutcome {
    let _permit = env.pool.acquire().await.map_err(|e| {
        TaskFailure::Error(Box::new(WorkflowError::Fault {
            reason: e.to_string(),
        }))
    })?;

    match tokio::time::timeout(timeout, execute_step(&task, input, &env, &ctx)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskFailure::Error(Box::new(err))),
        Err(_) => Err(TaskFailure::Timeout {
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

fn flatten(joined: std::result::Result<TaskOutcome, JoinError>) -> TaskOutcome {
    joined.unwrap_or_else(|join_err| {
        Err(TaskFailure::Error(Box::new(WorkflowError::Fault {
            reason: format!("task did not complete: {join_err}"),
        })))
    })
}

/// Strings as-is, anything else as JSON text, joined by newlines in index
/// order.
fn combine(outputs: &BTreeMap<usize, Value>) -> String {
    outputs
        .values()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Workflow for ParallelWorkflow {
    fn kind(&self) -> AgentKind {
        AgentKind::Parallel
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
        let config = &self.config;
        if config.tasks.is_empty() {
            return Ok(WorkflowOutput::Parallel {
                output: BTreeMap::new(),
                combined: String::new(),
            });
        }

        tracing::debug!(
            agent = %config.name,
            tasks = config.tasks.len(),
            halt_on_error = config.halt_on_error,
            timeout_ms = config.task_timeout.as_millis() as u64,
            "dispatching parallel tasks"
        );

        let mut running = FuturesUnordered::new();
        let mut aborts = AbortOnDrop(Vec::with_capacity(config.tasks.len()));
        for (index, task) in config.tasks.iter().cloned().enumerate() {
            let handle = tokio::spawn(run_task(
                task,
                input.clone(),
                env.clone(),
                ctx.clone(),
                config.task_timeout,
            ));
            aborts.0.push(handle.abort_handle());
            running.push(async move { (index, handle.await) });
        }

        let mut partial = PartialResults::default();
        let mut halted: Option<(usize, TaskFailure)> = None;

        while let Some((index, joined)) = running.next().await {
            match flatten(joined) {
                Ok(value) => {
                    partial.successes.insert(index, value);
                }
                Err(failure) => {
                    tracing::warn!(
                        agent = %config.name,
                        task = index,
                        error = %failure,
                        "parallel task failed"
                    );
                    partial.failures.insert(index, failure.clone());
                    if config.halt_on_error {
                        halted = Some((index, failure));
                        break;
                    }
                }
            }
        }
        drop(running);
        drop(aborts);

        if let Some((index, failure)) = halted {
            return Err(WorkflowError::ParallelTaskFailed {
                index,
                failure,
                partial,
            });
        }

        let first = partial
            .failures
            .iter()
            .next()
            .map(|(index, failure)| (*index, failure.clone()));
        match first {
            Some((index, failure)) => {
                Err(WorkflowError::ParallelTaskFailed {
                    index,
                    failure,
                    partial,
                })
            }
            None => {
                let combined = combine(&partial.successes);
                Ok(WorkflowOutput::Parallel {
                    output: partial.successes,
                    combined,
                })
            }
        }
    }
}
