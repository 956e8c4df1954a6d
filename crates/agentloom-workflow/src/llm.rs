//! Language-model agents.
//!
//! The [`LlmProvider`] trait is the boundary to a chat-completion service; no
//! HTTP adapter lives in this crate.  [`LlmWorkflow`] drives a ReAct
//! (Reason + Act) loop over a provider:
//!
//! 1. Send the conversation and the agent's tool definitions to the model.
//! 2. If the model asks for tools, execute them through the tool registry and
//!    append the results (errors included) to the conversation.
//! 3. Repeat until the model answers with text or `max_turns` is exhausted.
//!
//! The `before_llm_call`/`after_llm_call` callback stages wrap every model
//! call, and the user input and final answer are recorded in the session.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use agentloom_kernel::{CallbackType, Fault, Flow, InvocationContext, ToolDefinition, guard_async};

use crate::config::{AgentKind, LlmConfig};
use crate::engine::{Workflow, WorkflowEnv, WorkflowOutput};
use crate::error::{Result, WorkflowError};
use crate::memory::SessionEvent;
use crate::step::call_tool;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Which tool call a [`Role::Tool`] message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// An assistant message carrying tool calls.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, "")
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A model reply: text, tool calls, or both.  An empty `tool_calls` list
/// ends the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls: calls,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// A chat-completion service.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Single-prompt completion.
    async fn complete(&self, prompt: &str, options: &Map<String, Value>)
    -> std::result::Result<String, Fault>;

    /// Multi-turn chat with tool definitions.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &Map<String, Value>,
    ) -> std::result::Result<ChatResponse, Fault>;

    /// Provider configuration, for diagnostics.
    fn config(&self) -> Map<String, Value> {
        Map::new()
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// ReAct loop over an [`LlmProvider`].
pub struct LlmWorkflow {
    config: LlmConfig,
}

impl LlmWorkflow {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    async fn record(&self, env: &WorkflowEnv, ctx: &InvocationContext, author: &str, content: Value) -> Result<()> {
        env.memory
            .add_message(&ctx.session_id, SessionEvent::new(author, content))
            .await
            .map_err(WorkflowError::from)
    }

    /// One model call, wrapped in the LLM callback stages.  A halt in either
    /// stage yields a final text answer.
    async fn call_model(
        &self,
        env: &WorkflowEnv,
        ctx: &InvocationContext,
        messages: &mut Vec<Message>,
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        let request = json!({ "messages": &*messages });
        match env.callbacks.execute(CallbackType::BeforeLlmCall, request, ctx) {
            Flow::Halt(value) => return Ok(ChatResponse::text(render(&value))),
            Flow::Continue(value) => {
                if let Some(replaced) = value
                    .get("messages")
                    .and_then(|m| serde_json::from_value::<Vec<Message>>(m.clone()).ok())
                {
                    *messages = replaced;
                }
            }
        }

        let provider = &self.config.provider;
        let response = guard_async(provider.chat(messages, tools, &self.config.options))
            .await
            .map_err(|fault| WorkflowError::Llm {
                reason: format!("{} chat failed: {fault}", provider.name()),
            })?;

        let raw = serde_json::to_value(&response).unwrap_or(Value::Null);
        Ok(match env.callbacks.execute(CallbackType::AfterLlmCall, raw, ctx) {
            Flow::Halt(value) => ChatResponse::text(render(&value)),
            Flow::Continue(value) => serde_json::from_value(value).unwrap_or(response),
        })
    }
}

#[async_trait]
impl Workflow for LlmWorkflow {
    fn kind(&self) -> AgentKind {
        AgentKind::Llm
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, input: Value, env: &WorkflowEnv, ctx: &InvocationContext) -> Result<WorkflowOutput> {
        let tools = env.tools.definitions(&self.config.tools);
        let max_turns = self.config.max_turns;

        let mut messages = Vec::new();
        if let Some(instruction) = &self.config.instruction {
            messages.push(Message::system(instruction.clone()));
        }
        messages.push(Message::user(render(&input)));
        self.record(env, ctx, "user", input).await?;

        tracing::info!(
            agent = %self.config.name,
            invocation_id = %ctx.invocation_id,
            provider = %self.config.provider.name(),
            max_turns,
            tool_count = tools.len(),
            "starting ReAct loop"
        );

        for turn in 0..max_turns {
            tracing::debug!(turn, "ReAct turn start");
            let response = self.call_model(env, ctx, &mut messages, &tools).await?;

            if response.tool_calls.is_empty() {
                tracing::info!(
                    agent = %self.config.name,
                    turns = turn + 1,
                    "ReAct loop completed with text response"
                );
                messages.push(Message::assistant(response.content.clone()));
                self.record(env, ctx, "assistant", Value::from(response.content.clone()))
                    .await?;
                return Ok(WorkflowOutput::Llm {
                    output: response.content,
                    turns: turn + 1,
                });
            }

            tracing::info!(
                agent = %self.config.name,
                turn,
                tools = ?response.tool_calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                "model requested tool calls"
            );
            messages.push(Message::assistant_tool_calls(response.tool_calls.clone()));

            let results = join_all(
                response
                    .tool_calls
                    .iter()
                    .map(|call| execute_tool_call(env, ctx, call)),
            )
            .await;
            messages.extend(results);
        }

        Err(WorkflowError::Llm {
            reason: format!("exceeded max turns ({max_turns})"),
        })
    }
}

/// Run one requested tool call; failures become an error message for the
/// model rather than a workflow error.
async fn execute_tool_call(env: &WorkflowEnv, ctx: &InvocationContext, call: &ToolCall) -> Message {
    let outcome = match &call.arguments {
        Value::Object(params) => call_tool(env, ctx, &call.name, params.clone())
            .await
            .map_err(|e| e.to_string()),
        Value::Null => call_tool(env, ctx, &call.name, Map::new())
            .await
            .map_err(|e| e.to_string()),
        other => Err(format!("arguments must be an object, got {other}")),
    };

    match outcome {
        Ok(value) => Message::tool_result(&call.id, render(&value)),
        Err(reason) => {
            tracing::warn!(tool = %call.name, error = %reason, "tool call failed");
            Message::tool_result(&call.id, format!("Error: {reason}"))
        }
    }
}

/// Strings as-is, anything else as JSON text.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use agentloom_kernel::{Params, Predicate, Tool};

    use crate::memory::InMemoryStore;

    /// Replays canned responses and records what it was sent.
    struct Scripted {
        replies: Mutex<VecDeque<ChatResponse>>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl Scripted {
        fn new(replies: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, prompt: &str, _o: &Map<String, Value>) -> std::result::Result<String, Fault> {
            Ok(prompt.to_string())
        }

        async fn chat(
            &self,
            messages: &[Message],
            _tools: &[ToolDefinition],
            _o: &Map<String, Value>,
        ) -> std::result::Result<ChatResponse, Fault> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Fault::new("script exhausted"))
        }
    }

    struct Add;

    #[async_trait]
    impl Tool for Add {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("add", "add a and b", json!({"type": "object"}))
        }

        async fn execute(&self, params: Params, _ctx: &InvocationContext) -> std::result::Result<Value, Fault> {
            let a = params.get("a").and_then(Value::as_i64).ok_or("missing a")?;
            let b = params.get("b").and_then(Value::as_i64).ok_or("missing b")?;
            Ok(json!(a + b))
        }
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    fn setup(provider: Arc<Scripted>, max_turns: u32) -> (LlmWorkflow, WorkflowEnv, Arc<InMemoryStore>) {
        let memory = Arc::new(InMemoryStore::new());
        let env = WorkflowEnv {
            memory: memory.clone(),
            ..WorkflowEnv::default()
        };
        env.tools.register("add", Arc::new(Add)).unwrap();
        let config = LlmConfig::builder()
            .name("math")
            .provider(provider)
            .instruction("be precise")
            .tool("add")
            .max_turns(max_turns)
            .build()
            .unwrap();
        (LlmWorkflow::new(config), env, memory)
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new("s-llm", "math", "llm")
    }

    #[tokio::test]
    async fn text_reply_finishes_in_one_turn() {
        let provider = Scripted::new(vec![ChatResponse::text("42")]);
        let (wf, env, memory) = setup(Arc::clone(&provider), 3);

        let out = wf.run(json!("what is 6*7"), &env, &ctx()).await.unwrap();
        assert_eq!(
            out,
            WorkflowOutput::Llm {
                output: "42".into(),
                turns: 1
            }
        );

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0][0], Message::system("be precise"));
        assert_eq!(seen[0][1], Message::user("what is 6*7"));

        let events = memory.events("s-llm").unwrap();
        let authors: Vec<_> = events.iter().map(|e| e.author.as_str()).collect();
        assert_eq!(authors, vec!["user", "assistant"]);
    }

    #[tokio::test]
    async fn tool_results_and_errors_are_fed_back() {
        let provider = Scripted::new(vec![
            ChatResponse::tool_calls(vec![
                call("c1", "add", json!({"a": 2, "b": 3})),
                call("c2", "add", json!({"a": 1})),
                call("c3", "nope", json!({})),
            ]),
            ChatResponse::text("done"),
        ]);
        let (wf, env, _) = setup(Arc::clone(&provider), 5);

        let out = wf.run(json!("go"), &env, &ctx()).await.unwrap();
        assert_eq!(out.output(), json!("done"));

        let seen = provider.seen.lock().unwrap();
        let second = &seen[1];
        let results: Vec<_> = second.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "5");
        assert!(results[1].content.starts_with("Error:"));
        assert!(results[2].content.contains("tool not found"));
    }

    #[tokio::test]
    async fn running_out_of_turns_is_an_llm_error() {
        let provider = Scripted::new(vec![
            ChatResponse::tool_calls(vec![call("c1", "add", json!({"a": 1, "b": 1}))]),
            ChatResponse::tool_calls(vec![call("c2", "add", json!({"a": 1, "b": 1}))]),
        ]);
        let (wf, env, _) = setup(provider, 2);

        let err = wf.run(json!("loop"), &env, &ctx()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Llm { ref reason } if reason.contains("max turns")));
    }

    #[tokio::test]
    async fn provider_failure_is_an_llm_error() {
        let provider = Scripted::new(vec![]);
        let (wf, env, _) = setup(provider, 2);
        let err = wf.run(json!("x"), &env, &ctx()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Llm { ref reason } if reason.contains("script exhausted")));
    }

    #[tokio::test]
    async fn before_llm_call_halt_answers_without_the_model() {
        let provider = Scripted::new(vec![]);
        let (wf, env, _) = setup(Arc::clone(&provider), 2);
        env.callbacks.register(
            CallbackType::BeforeLlmCall,
            Predicate::any().with("agent_name", "math"),
            |_v: Value, _c: &InvocationContext| -> std::result::Result<Flow, Fault> {
                Ok(Flow::Halt(json!("cached answer")))
            },
        );

        let out = wf.run(json!("x"), &env, &ctx()).await.unwrap();
        assert_eq!(out.output(), json!("cached answer"));
        assert!(provider.seen.lock().unwrap().is_empty());
    }
}
