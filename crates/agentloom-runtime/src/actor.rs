//! The per-agent actor.
//!
//! Each agent runs as one tokio task that owns its workflow and drains an
//! mpsc inbox, one invocation at a time, in arrival order.  Callers talk to
//! it through a cloneable [`AgentHandle`] and wait on a oneshot reply.
//!
//! An invocation goes through these stages:
//!
//! 1. build a fresh [`InvocationContext`] from the actor's session id;
//! 2. `before_run` callbacks; a halt replies with the halted value at once;
//! 3. the workflow, behind a panic barrier;
//! 4. on success the `after_run` callbacks shape the reply, on failure the
//!    `on_error` callbacks shape the error payload.
//!
//! Nothing that happens inside an invocation can stop the actor loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agentloom_kernel::{
    CallbackPipeline, CallbackType, Fault, Flow, InvocationContext, TelemetryBus, TelemetryEvent,
    ToolDefinition, ToolRegistry, guard_async,
};
use agentloom_workflow::{AgentConfig, AgentKind, Workflow, WorkflowEnv, WorkflowError, build_workflow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::services::Services;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Identity of a running agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Identifies this actor instance; a restart produces a new one.
    pub agent_id: Uuid,
    pub name: String,
    pub kind: AgentKind,
    /// Stable across invocations and restarts.
    pub session_id: String,
}

enum Command {
    Run {
        input: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
}

/// Cloneable reference to an agent actor.
#[derive(Clone)]
pub struct AgentHandle {
    info: Arc<AgentInfo>,
    tx: mpsc::Sender<Command>,
    abort: AbortHandle,
    tools: Arc<[String]>,
    registry: ToolRegistry,
    call_timeout: Duration,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("info", &self.info)
            .field("running", &self.is_running())
            .finish()
    }
}

impl AgentHandle {
    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Whether the actor is still accepting invocations.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Run the agent, waiting at most the configured call timeout.
    pub async fn run(&self, input: Value) -> Result<Value> {
        self.run_with_timeout(input, self.call_timeout).await
    }

    /// Run the agent, waiting at most `timeout`.
    ///
    /// Time spent waiting for inbox space counts against the timeout.  When
    /// it expires the caller gets [`RuntimeError::Timeout`]; the actor still
    /// completes the invocation and discards the reply.
    pub async fn run_with_timeout(&self, input: Value, timeout: Duration) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || RuntimeError::Timeout {
            agent: self.info.name.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let not_running = || RuntimeError::NotRunning {
            agent: self.info.name.clone(),
        };

        let (reply, rx) = oneshot::channel();
        match tokio::time::timeout_at(deadline, self.tx.send(Command::Run { input, reply })).await {
            Err(_) => return Err(timed_out()),
            Ok(Err(_)) => return Err(not_running()),
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => Err(timed_out()),
            Ok(Err(_)) => Err(not_running()),
            Ok(Ok(result)) => result,
        }
    }

    /// Definitions of the tools this agent declares, resolved against the
    /// registry.  Undeclared or unregistered tools are skipped.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions(&self.tools)
    }

    /// Abort the actor task.  Queued and in-flight invocations fail with
    /// [`RuntimeError::NotRunning`]; a supervisor treats this as a crash.
    pub fn kill(&self) {
        tracing::warn!(agent = %self.info.name, agent_id = %self.info.agent_id, "killing agent");
        self.abort.abort();
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// A freshly spawned actor: its handle and its task.
pub struct RunningAgent {
    pub handle: AgentHandle,
    pub task: JoinHandle<()>,
}

/// Entry points for starting agent actors.
pub struct AgentRuntime;

impl AgentRuntime {
    /// Start an unsupervised agent with a new session id.
    pub fn start(config: AgentConfig, services: &Services, runtime: &RuntimeConfig) -> Result<AgentHandle> {
        Ok(Self::spawn(config, services, runtime, None)?.handle)
    }

    /// Start an agent, reusing `session_id` when given.
    ///
    /// The workflow strategy is selected here, once; an invalid config fails
    /// before any task is spawned.  Must be called within a tokio runtime.
    pub fn spawn(
        config: AgentConfig,
        services: &Services,
        runtime: &RuntimeConfig,
        session_id: Option<String>,
    ) -> Result<RunningAgent> {
        let tools: Arc<[String]> = config.tools().into();
        let workflow = build_workflow(config)?;

        let info = Arc::new(AgentInfo {
            agent_id: Uuid::now_v7(),
            name: workflow.name().to_string(),
            kind: workflow.kind(),
            session_id: session_id.unwrap_or_else(|| Uuid::now_v7().to_string()),
        });

        let (tx, rx) = mpsc::channel(runtime.inbox_capacity.max(1));
        let actor = AgentActor {
            info: Arc::clone(&info),
            workflow,
            env: services.workflow_env(),
            callbacks: services.callbacks.clone(),
            telemetry: services.telemetry.clone(),
            rx,
        };
        let task = tokio::spawn(actor.run_loop());

        let handle = AgentHandle {
            info,
            tx,
            abort: task.abort_handle(),
            tools,
            registry: services.tools.clone(),
            call_timeout: runtime.call_timeout(),
        };
        Ok(RunningAgent { handle, task })
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct AgentActor {
    info: Arc<AgentInfo>,
    workflow: Arc<dyn Workflow>,
    env: WorkflowEnv,
    callbacks: CallbackPipeline,
    telemetry: TelemetryBus,
    rx: mpsc::Receiver<Command>,
}

impl AgentActor {
    async fn run_loop(mut self) {
        tracing::info!(
            agent = %self.info.name,
            kind = %self.info.kind,
            session_id = %self.info.session_id,
            "agent started"
        );
        self.telemetry.publish(TelemetryEvent::AgentStarted {
            agent_name: self.info.name.clone(),
            session_id: self.info.session_id.clone(),
            timestamp: Utc::now(),
        });

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Run { input, reply } => {
                    let result = self.invoke(input).await;
                    if reply.send(result).is_err() {
                        tracing::debug!(agent = %self.info.name, "caller gone; reply dropped");
                    }
                }
            }
        }

        tracing::info!(agent = %self.info.name, "agent stopped");
        self.telemetry.publish(TelemetryEvent::AgentStopped {
            agent_name: self.info.name.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let ctx = InvocationContext::new(
            self.info.session_id.clone(),
            self.info.name.clone(),
            self.info.kind.as_str(),
        );
        let span = tracing::info_span!(
            "invocation",
            agent = %ctx.agent_name,
            session_id = %ctx.session_id,
            invocation_id = %ctx.invocation_id,
        );
        self.invoke_in(input, ctx).instrument(span).await
    }

    async fn invoke_in(&self, input: Value, ctx: InvocationContext) -> Result<Value> {
        let started = Instant::now();
        self.telemetry.publish(TelemetryEvent::InvocationStarted {
            agent_name: ctx.agent_name.clone(),
            invocation_id: ctx.invocation_id,
            timestamp: Utc::now(),
        });

        let input = match self.callbacks.execute(CallbackType::BeforeRun, input, &ctx) {
            Flow::Halt(value) => {
                tracing::debug!("before_run halted; workflow skipped");
                self.completed(&ctx, started, true);
                return Ok(value);
            }
            Flow::Continue(input) => input,
        };

        let outcome = guard_async(async {
            Ok::<_, Fault>(self.workflow.run(input, &self.env, &ctx).await)
        })
        .await
        .unwrap_or_else(|fault| {
            Err(WorkflowError::Fault {
                reason: fault.message().to_string(),
            })
        });

        match outcome {
            Ok(output) => {
                let value = self
                    .callbacks
                    .execute(CallbackType::AfterRun, output.into_value(), &ctx)
                    .into_value();
                self.completed(&ctx, started, false);
                Ok(value)
            }
            Err(cause) => {
                let payload = self
                    .callbacks
                    .execute(CallbackType::OnError, cause.to_value(), &ctx)
                    .into_value();
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(error = %cause, duration_ms, "invocation failed");
                self.telemetry.publish(TelemetryEvent::InvocationFailed {
                    agent_name: ctx.agent_name.clone(),
                    invocation_id: ctx.invocation_id,
                    error: cause.to_string(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Err(RuntimeError::AgentExecution { cause, payload })
            }
        }
    }

    fn completed(&self, ctx: &InvocationContext, started: Instant, halted: bool) {
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(duration_ms, halted, "invocation completed");
        self.telemetry.publish(TelemetryEvent::InvocationCompleted {
            agent_name: ctx.agent_name.clone(),
            invocation_id: ctx.invocation_id,
            halted,
            duration_ms,
            timestamp: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agentloom_kernel::Predicate;
    use agentloom_workflow::{SequentialConfig, Step};
    use serde_json::json;

    fn services() -> Services {
        Services::new(&RuntimeConfig::default()).unwrap()
    }

    fn sequential(name: &str, steps: Vec<Step>) -> AgentConfig {
        SequentialConfig::builder()
            .name(name)
            .steps(steps)
            .build()
            .unwrap()
            .into()
    }

    fn upper() -> Step {
        Step::function(|v| Ok(Value::from(v.as_str().unwrap_or_default().to_uppercase())))
    }

    #[tokio::test]
    async fn run_returns_workflow_output() {
        let services = services();
        let handle =
            AgentRuntime::start(sequential("up", vec![upper()]), &services, &RuntimeConfig::default())
                .unwrap();

        let out = handle.run(json!("hi")).await.unwrap();
        assert_eq!(out, json!({"output": "HI"}));
        assert_eq!(handle.info().kind, AgentKind::Sequential);
    }

    #[tokio::test]
    async fn invalid_config_fails_to_start() {
        let config = AgentConfig::Sequential(SequentialConfig {
            name: " ".into(),
            steps: vec![],
            tools: vec![],
        });
        let err = AgentRuntime::start(config, &services(), &RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[tokio::test]
    async fn before_run_halt_skips_the_workflow() {
        let services = services();
        let calls = Arc::new(AtomicUsize::new(0));
        let spy = {
            let calls = Arc::clone(&calls);
            Step::function(move |v| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            })
        };
        services.callbacks.register(
            CallbackType::BeforeRun,
            Predicate::any().with("agent_name", "guarded"),
            |_v: Value, _c: &InvocationContext| -> std::result::Result<Flow, Fault> {
                Ok(Flow::Halt(json!("blocked")))
            },
        );

        let handle = AgentRuntime::start(sequential("guarded", vec![spy]), &services, &RuntimeConfig::default())
            .unwrap();
        assert_eq!(handle.run(json!("x")).await.unwrap(), json!("blocked"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn after_run_halt_still_succeeds() {
        let services = services();
        services.callbacks.register(
            CallbackType::AfterRun,
            Predicate::any(),
            |v: Value, _c: &InvocationContext| -> std::result::Result<Flow, Fault> {
                Ok(Flow::Halt(json!({"wrapped": v})))
            },
        );

        let handle =
            AgentRuntime::start(sequential("wrap", vec![upper()]), &services, &RuntimeConfig::default())
                .unwrap();
        let out = handle.run(json!("a")).await.unwrap();
        assert_eq!(out, json!({"wrapped": {"output": "A"}}));
    }

    #[tokio::test]
    async fn failures_pass_through_on_error() {
        let services = services();
        services.callbacks.register(
            CallbackType::OnError,
            Predicate::any(),
            |v: Value, _c: &InvocationContext| -> std::result::Result<Flow, Fault> {
                Ok(Flow::Continue(json!({"handled": v["error"].clone()})))
            },
        );

        let failing = Step::function(|_| Err(Fault::new("nope")));
        let handle =
            AgentRuntime::start(sequential("fails", vec![failing]), &services, &RuntimeConfig::default())
                .unwrap();

        match handle.run(json!(null)).await.unwrap_err() {
            RuntimeError::AgentExecution { cause, payload } => {
                assert!(matches!(cause, WorkflowError::StepExecution { .. }));
                assert_eq!(payload, json!({"handled": "step_execution_error"}));
            }
            other => panic!("unexpected error: {other}"),
        }

        // The actor survives and keeps serving.
        assert!(handle.is_running());
        assert!(handle.run(json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn panicking_step_does_not_kill_the_actor() {
        let services = services();
        let step = Step::function_async(|v| async move {
            if v == json!("boom") {
                panic!("exploded");
            }
            Ok(v)
        });
        let handle =
            AgentRuntime::start(sequential("fragile", vec![step]), &services, &RuntimeConfig::default())
                .unwrap();

        let err = handle.run(json!("boom")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AgentExecution { .. }));
        assert_eq!(handle.run(json!("fine")).await.unwrap(), json!({"output": "fine"}));
    }

    #[tokio::test]
    async fn caller_timeout_leaves_the_actor_working() {
        let services = services();
        let finished = Arc::new(AtomicUsize::new(0));
        let slow = {
            let finished = Arc::clone(&finished);
            Step::function_async(move |v| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(v)
                }
            })
        };
        let handle =
            AgentRuntime::start(sequential("slow", vec![slow]), &services, &RuntimeConfig::default())
                .unwrap();

        let err = handle
            .run_with_timeout(json!(1), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 10, .. }));

        // The next call queues behind the abandoned one and still succeeds.
        let out = handle
            .run_with_timeout(json!(2), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(out, json!({"output": 2}));
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_is_stable_and_invocations_are_fresh() {
        let services = services();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        services.callbacks.register(
            CallbackType::BeforeRun,
            Predicate::any(),
            move |v: Value, c: &InvocationContext| -> std::result::Result<Flow, Fault> {
                sink.lock().unwrap().push((c.session_id.clone(), c.invocation_id));
                Ok(Flow::Continue(v))
            },
        );

        let handle =
            AgentRuntime::start(sequential("ids", vec![]), &services, &RuntimeConfig::default()).unwrap();
        handle.run(json!(1)).await.unwrap();
        handle.run(json!(2)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, handle.info().session_id);
        assert_eq!(seen[0].0, seen[1].0);
        assert_ne!(seen[0].1, seen[1].1);
    }

    #[tokio::test]
    async fn killed_actor_reports_not_running() {
        let services = services();
        let handle =
            AgentRuntime::start(sequential("doomed", vec![]), &services, &RuntimeConfig::default())
                .unwrap();
        handle.kill();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = handle.run(json!(1)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotRunning { .. }));
        assert!(!handle.is_running());
    }
}
