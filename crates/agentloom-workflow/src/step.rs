//! Steps: the units of work every strategy is made of.
//!
//! A [`Step`] is one of four shapes:
//!
//! - [`Step::Tool`] invokes a registered tool with fixed parameters and
//!   ignores the running input.
//! - [`Step::Function`] maps the running input to a new value.
//! - [`Step::Transform`] maps the running input and a snapshot of the
//!   session state to a new value.
//! - [`Step::Unknown`] is anything else; executing it always fails.
//!
//! Function and transform bodies are asynchronous so that a parallel task
//! timeout can cancel them.  The synchronous constructors run their closure
//! on tokio's blocking pool, so a slow closure never stalls a runtime worker
//! and a timed-out task is abandoned instead of awaited.  Panics in either
//! kind are caught and reported as step errors.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use agentloom_kernel::{
    CallbackType, Fault, Flow, InvocationContext, Params, guard, guard_async,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::engine::WorkflowEnv;
use crate::error::{StepFailure, StepKind, WorkflowError};
use crate::memory::StateMap;

/// Boxed future returned by step bodies.
pub type StepFuture = BoxFuture<'static, Result<Value, Fault>>;

/// Body of a function step.
pub type FunctionFn = Arc<dyn Fn(Value) -> StepFuture + Send + Sync>;

/// Body of a transform step.
pub type TransformFn = Arc<dyn Fn(Value, StateMap) -> StepFuture + Send + Sync>;

/// Run a synchronous step body on the blocking pool.  The closure is only
/// submitted once the returned future is first polled.
fn on_blocking_pool<F>(body: F) -> StepFuture
where
    F: FnOnce() -> Result<Value, Fault> + Send + 'static,
{
    async move {
        tokio::task::spawn_blocking(move || guard(body))
            .await
            .unwrap_or_else(|e| Err(Fault::new(format!("blocking step did not complete: {e}"))))
    }
    .boxed()
}

/// One unit of work inside a workflow.
#[derive(Clone)]
pub enum Step {
    Tool {
        tool: String,
        params: Params,
    },
    Function {
        name: Option<String>,
        f: FunctionFn,
    },
    Transform {
        name: Option<String>,
        f: TransformFn,
    },
    Unknown(Value),
}

impl Step {
    /// A tool step.  Parameters that are not a JSON object (or null) make the
    /// step [`Step::Unknown`].
    pub fn tool(tool: impl Into<String>, params: Value) -> Self {
        let tool = tool.into();
        match params {
            Value::Object(params) => Self::Tool { tool, params },
            Value::Null => Self::Tool {
                tool,
                params: Params::new(),
            },
            other => Self::Unknown(json!({ "tool": tool, "params": other })),
        }
    }

    /// A function step from a synchronous closure.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::Function {
            name: None,
            f: Arc::new(move |input| {
                let f = Arc::clone(&f);
                on_blocking_pool(move || f(input))
            }),
        }
    }

    /// A function step from an async closure.
    pub fn function_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        Self::Function {
            name: None,
            f: Arc::new(move |input| f(input).boxed()),
        }
    }

    /// A transform step from a synchronous closure.
    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(Value, &StateMap) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::Transform {
            name: None,
            f: Arc::new(move |input, state| {
                let f = Arc::clone(&f);
                on_blocking_pool(move || f(input, &state))
            }),
        }
    }

    /// A transform step from an async closure.
    pub fn transform_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, StateMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        Self::Transform {
            name: None,
            f: Arc::new(move |input, state| f(input, state).boxed()),
        }
    }

    /// A step of unrecognised shape.
    pub fn unknown(shape: Value) -> Self {
        Self::Unknown(shape)
    }

    /// Label a function or transform step; used in error descriptors and logs.
    #[must_use]
    pub fn named(self, label: impl Into<String>) -> Self {
        match self {
            Self::Function { f, .. } => Self::Function {
                name: Some(label.into()),
                f,
            },
            Self::Transform { f, .. } => Self::Transform {
                name: Some(label.into()),
                f,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Self::Tool { .. } => StepKind::Tool,
            Self::Function { .. } => StepKind::Function,
            Self::Transform { .. } => StepKind::Transform,
            Self::Unknown(_) => StepKind::UnknownType,
        }
    }

    /// Human-readable identification of this step.
    pub fn descriptor(&self) -> String {
        match self {
            Self::Tool { tool, .. } => tool.clone(),
            Self::Function { name, .. } => name.clone().unwrap_or_else(|| "<function>".into()),
            Self::Transform { name, .. } => name.clone().unwrap_or_else(|| "<transform>".into()),
            Self::Unknown(shape) => shape.to_string(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool { tool, params } => f
                .debug_struct("Tool")
                .field("tool", tool)
                .field("params", params)
                .finish(),
            Self::Function { name, .. } => f.debug_struct("Function").field("name", name).finish(),
            Self::Transform { name, .. } => {
                f.debug_struct("Transform").field("name", name).finish()
            }
            Self::Unknown(shape) => f.debug_tuple("Unknown").field(shape).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Execute one step against the running input.
pub async fn execute_step(
    step: &Step,
    input: Value,
    env: &WorkflowEnv,
    ctx: &InvocationContext,
) -> Result<Value, WorkflowError> {
    let outcome = match step {
        Step::Tool { tool, params } => call_tool(env, ctx, tool, params.clone()).await,
        Step::Function { f, .. } => {
            let f = Arc::clone(f);
            guard_async(async move { f(input).await })
                .await
                .map_err(StepFailure::from)
        }
        Step::Transform { f, .. } => match env.memory.full_state(&ctx.session_id).await {
            Ok(state) => {
                let f = Arc::clone(f);
                guard_async(async move { f(input, state).await })
                    .await
                    .map_err(StepFailure::from)
            }
            Err(err) => Err(StepFailure::from(err)),
        },
        Step::Unknown(shape) => Err(StepFailure::UnknownShape {
            shape: shape.to_string(),
        }),
    };

    outcome.map_err(|cause| WorkflowError::StepExecution {
        kind: step.kind(),
        descriptor: step.descriptor(),
        cause,
    })
}

/// Fold `steps` left to right; each step's output is the next one's input.
/// The first failure stops the fold.
pub async fn run_steps(
    steps: &[Step],
    input: Value,
    env: &WorkflowEnv,
    ctx: &InvocationContext,
) -> Result<Value, WorkflowError> {
    let mut current = input;
    for (index, step) in steps.iter().enumerate() {
        tracing::debug!(
            agent = %ctx.agent_name,
            step = index,
            kind = %step.kind(),
            descriptor = %step.descriptor(),
            "running step"
        );
        current = execute_step(step, current, env, ctx).await?;
    }
    Ok(current)
}

/// Execute a tool through the registry, wrapped in the `before_tool_call`
/// and `after_tool_call` callback stages.
///
/// `before_tool_call` sees `{"tool": name, "params": {...}}`; continuing with
/// a value whose `params` is an object replaces the parameters, and halting
/// skips the tool and uses the halted value as its result.  `after_tool_call`
/// sees the result and may replace it.
pub async fn call_tool(
    env: &WorkflowEnv,
    ctx: &InvocationContext,
    tool: &str,
    params: Params,
) -> Result<Value, StepFailure> {
    let request = json!({ "tool": tool, "params": Value::Object(params.clone()) });
    let params = match env.callbacks.execute(CallbackType::BeforeToolCall, request, ctx) {
        Flow::Halt(result) => {
            tracing::debug!(tool, "tool call short-circuited by callback");
            return Ok(result);
        }
        Flow::Continue(Value::Object(mut request)) => match request.remove("params") {
            Some(Value::Object(replaced)) => replaced,
            _ => params,
        },
        Flow::Continue(_) => params,
    };

    let result = env.tools.execute(tool, params, ctx).await?;
    Ok(env
        .callbacks
        .execute(CallbackType::AfterToolCall, result, ctx)
        .into_value())
}
