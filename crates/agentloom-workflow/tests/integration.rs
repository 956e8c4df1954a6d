//! Integration tests for the agentloom-workflow crate.
//!
//! These tests drive every strategy through [`build_workflow`] with real
//! tools, session memory and callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agentloom_kernel::{
    CallbackType, Fault, Flow, InvocationContext, Params, Predicate, Tool, ToolDefinition,
};
use agentloom_workflow::{
    AgentConfig, LoopConfig, MemoryStore, ParallelConfig, SequentialConfig, SessionEvent,
    StateMap, Step, StepKind, TaskFailure, WorkflowEnv, WorkflowError, build_workflow,
};
use async_trait::async_trait;
use serde_json::{Value, json};

/// Returns its params unchanged.
struct EchoParams;

#[async_trait]
impl Tool for EchoParams {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("echo", "return the params", json!({"type": "object"}))
    }

    async fn execute(&self, params: Params, _ctx: &InvocationContext) -> Result<Value, Fault> {
        Ok(Value::Object(params))
    }
}

/// Counts calls and bumps `counter` in session memory.
struct Bump {
    memory: Arc<dyn MemoryStore>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for Bump {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("bump", "increment session counter", json!({"type": "object"}))
    }

    async fn execute(&self, _params: Params, ctx: &InvocationContext) -> Result<Value, Fault> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let mut delta = StateMap::new();
        delta.insert("counter".into(), json!(n));
        self.memory
            .add_message(&ctx.session_id, SessionEvent::new("bump", n).with_state_delta(delta))
            .await
            .map_err(|e| Fault::new(e.to_string()))?;
        Ok(json!(n))
    }
}

fn ctx(kind: &str) -> InvocationContext {
    InvocationContext::new("session-int", "agent", kind)
}

fn env() -> WorkflowEnv {
    let env = WorkflowEnv::default();
    env.tools.register("echo", Arc::new(EchoParams)).unwrap();
    env
}

// ═══════════════════════════════════════════════════════════════════════
//  Sequential
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sequential_mixes_tools_functions_and_transforms() {
    let env = env();
    let mut seed = StateMap::new();
    seed.insert("greeting".into(), json!("hello"));
    env.memory
        .add_message("session-int", SessionEvent::new("test", "seed").with_state_delta(seed))
        .await
        .unwrap();

    let config = SequentialConfig::builder()
        .name("mix")
        .step(Step::tool("echo", json!({"name": "world"})))
        .step(Step::function(|v| Ok(v["name"].clone())))
        .step(Step::transform(|v, state| {
            let greeting = state["greeting"].as_str().unwrap_or_default();
            Ok(Value::from(format!("{greeting}, {}", v.as_str().unwrap_or_default())))
        }))
        .build()
        .unwrap();

    let out = build_workflow(config.into())
        .unwrap()
        .run(json!("ignored"), &env, &ctx("sequential"))
        .await
        .unwrap();
    assert_eq!(out.into_value(), json!({"output": "hello, world"}));
}

#[tokio::test]
async fn sequential_error_at_step_k_skips_the_rest() {
    let calls = Arc::new(AtomicUsize::new(0));
    let spy = {
        let calls = Arc::clone(&calls);
        Step::function(move |v| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(v)
        })
    };

    let config = SequentialConfig::builder()
        .name("broken")
        .steps(vec![
            spy.clone(),
            spy.clone(),
            Step::tool("missing_tool", Value::Null),
            spy,
        ])
        .build()
        .unwrap();

    let err = build_workflow(config.into())
        .unwrap()
        .run(json!(1), &env(), &ctx("sequential"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::StepExecution { kind: StepKind::Tool, ref descriptor, .. } if descriptor == "missing_tool"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tool_callbacks_respect_predicates() {
    let env = env();
    env.callbacks.register(
        CallbackType::AfterToolCall,
        Predicate::any().with("agent_module", "parallel"),
        |_v: Value, _c: &InvocationContext| -> Result<Flow, Fault> {
            Ok(Flow::Continue(json!("intercepted")))
        },
    );

    let config = SequentialConfig::builder()
        .name("plain")
        .step(Step::tool("echo", json!({"a": 1})))
        .build()
        .unwrap();

    let out = build_workflow(config.into())
        .unwrap()
        .run(Value::Null, &env, &ctx("sequential"))
        .await
        .unwrap();
    assert_eq!(out.output(), json!({"a": 1}));
}

// ═══════════════════════════════════════════════════════════════════════
//  Parallel
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn parallel_partial_results_cover_every_task() {
    let tasks = vec![
        Step::function(|v| Ok(v)),
        Step::function(|_| Err(Fault::new("bad"))),
        Step::tool("echo", json!({"k": "v"})),
        Step::function_async(|_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::Null)
        }),
        Step::unknown(json!("???")),
    ];
    let total = tasks.len();

    let config: AgentConfig = ParallelConfig::builder()
        .name("fan")
        .tasks(tasks)
        .halt_on_error(false)
        .task_timeout(Duration::from_millis(50))
        .build()
        .unwrap()
        .into();

    let err = build_workflow(config)
        .unwrap()
        .run(json!("in"), &env(), &ctx("parallel"))
        .await
        .unwrap_err();

    let WorkflowError::ParallelTaskFailed {
        index, partial, ..
    } = err
    else {
        panic!("expected a parallel failure");
    };
    assert_eq!(index, 1);
    assert_eq!(partial.successes.len() + partial.failures.len(), total);
    assert_eq!(partial.successes[&0], json!("in"));
    assert_eq!(partial.successes[&2], json!({"k": "v"}));
    assert!(matches!(partial.failures[&3], TaskFailure::Timeout { .. }));
    assert!(partial.failures.contains_key(&4));
}

#[tokio::test]
async fn parallel_success_combines_in_index_order() {
    let config: AgentConfig = ParallelConfig::builder()
        .name("fan")
        .task(Step::function(|_| Ok(json!("one"))))
        .task(Step::function(|_| Ok(json!(2))))
        .task(Step::function(|_| Ok(json!(["three"]))))
        .build()
        .unwrap()
        .into();

    let out = build_workflow(config)
        .unwrap()
        .run(Value::Null, &env(), &ctx("parallel"))
        .await
        .unwrap()
        .into_value();
    assert_eq!(out["combined"], json!("one\n2\n[\"three\"]"));
    assert_eq!(out["output"]["1"], json!(2));
}

// ═══════════════════════════════════════════════════════════════════════
//  Loop
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn loop_condition_reads_state_written_by_a_tool() {
    let env = env();
    let calls = Arc::new(AtomicUsize::new(0));
    env.tools
        .register(
            "bump",
            Arc::new(Bump {
                memory: Arc::clone(&env.memory),
                calls: Arc::clone(&calls),
            }),
        )
        .unwrap();

    let config: AgentConfig = LoopConfig::builder()
        .name("until-three")
        .step(Step::tool("bump", Value::Null))
        .condition(|_, state| Ok(state.get("counter") == Some(&json!(3))))
        .max_iterations(10)
        .build()
        .unwrap()
        .into();

    let out = build_workflow(config)
        .unwrap()
        .run(json!(0), &env, &ctx("loop"))
        .await
        .unwrap()
        .into_value();

    assert_eq!(
        out,
        json!({"output": 3, "status": "condition_met", "iterations": 3})
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
