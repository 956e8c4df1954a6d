//! Agent configuration.
//!
//! [`AgentConfig`] is a closed set of variants, one per workflow strategy.
//! Each variant has a builder that validates mandatory fields, so a
//! configuration that reaches the engine is known to be well-formed;
//! [`AgentConfig::validate`] repeats the checks for configs assembled by hand.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agentloom_kernel::{Fault, guard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::llm::LlmProvider;
use crate::memory::StateMap;
use crate::step::Step;

/// Default per-task timeout for parallel workflows.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default iteration cap for loop workflows.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Default turn cap for LLM workflows.
pub const DEFAULT_MAX_TURNS: u32 = 10;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Which workflow strategy an agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Sequential,
    Parallel,
    Loop,
    Llm,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Loop => "loop",
            Self::Llm => "llm",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Loop condition
// ---------------------------------------------------------------------------

/// Termination predicate of a loop workflow, evaluated against the current
/// output and a snapshot of the session state.
#[derive(Clone)]
pub struct Condition(Arc<dyn Fn(&Value, &StateMap) -> Result<bool, Fault> + Send + Sync>);

impl Condition {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &StateMap) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Evaluate the condition; a panic is reported as a [`Fault`].
    pub fn evaluate(&self, output: &Value, state: &StateMap) -> Result<bool, Fault> {
        guard(|| (self.0)(output, state))
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Condition(..)")
    }
}

// ---------------------------------------------------------------------------
// Variant configs
// ---------------------------------------------------------------------------

/// Steps folded left to right.
#[derive(Debug, Clone)]
pub struct SequentialConfig {
    pub name: String,
    pub steps: Vec<Step>,
    pub tools: Vec<String>,
}

/// Tasks run concurrently on the same input.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub name: String,
    pub tasks: Vec<Step>,
    pub tools: Vec<String>,
    pub task_timeout: Duration,
    pub halt_on_error: bool,
}

/// Steps repeated until a condition holds or the iteration cap is reached.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub name: String,
    pub steps: Vec<Step>,
    pub condition: Condition,
    pub max_iterations: u32,
    pub tools: Vec<String>,
}

/// A tool-using conversation with a language model.
#[derive(Clone)]
pub struct LlmConfig {
    pub name: String,
    pub provider: Arc<dyn LlmProvider>,
    /// System prompt.
    pub instruction: Option<String>,
    pub tools: Vec<String>,
    pub max_turns: u32,
    /// Provider options passed through on every call.
    pub options: Map<String, Value>,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("instruction", &self.instruction)
            .field("tools", &self.tools)
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

/// Configuration of one agent.
#[derive(Debug, Clone)]
pub enum AgentConfig {
    Sequential(SequentialConfig),
    Parallel(ParallelConfig),
    Loop(LoopConfig),
    Llm(LlmConfig),
}

impl AgentConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Sequential(c) => &c.name,
            Self::Parallel(c) => &c.name,
            Self::Loop(c) => &c.name,
            Self::Llm(c) => &c.name,
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            Self::Sequential(_) => AgentKind::Sequential,
            Self::Parallel(_) => AgentKind::Parallel,
            Self::Loop(_) => AgentKind::Loop,
            Self::Llm(_) => AgentKind::Llm,
        }
    }

    /// Tools the agent declares it uses.
    pub fn tools(&self) -> &[String] {
        match self {
            Self::Sequential(c) => &c.tools,
            Self::Parallel(c) => &c.tools,
            Self::Loop(c) => &c.tools,
            Self::Llm(c) => &c.tools,
        }
    }

    /// Check the invariants the builders enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_name(self.name())?;
        match self {
            Self::Parallel(c) if c.task_timeout.is_zero() => Err(ConfigError::InvalidTimeout),
            Self::Llm(c) if c.max_turns == 0 => Err(ConfigError::Invalid {
                reason: "max_turns must be at least 1".into(),
            }),
            _ => Ok(()),
        }
    }
}

impl From<SequentialConfig> for AgentConfig {
    fn from(config: SequentialConfig) -> Self {
        Self::Sequential(config)
    }
}

impl From<ParallelConfig> for AgentConfig {
    fn from(config: ParallelConfig) -> Self {
        Self::Parallel(config)
    }
}

impl From<LoopConfig> for AgentConfig {
    fn from(config: LoopConfig) -> Self {
        Self::Loop(config)
    }
}

impl From<LlmConfig> for AgentConfig {
    fn from(config: LlmConfig) -> Self {
        Self::Llm(config)
    }
}

fn check_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        Err(ConfigError::EmptyName)
    } else {
        Ok(())
    }
}

fn require<T>(value: Option<T>, field: &'static str) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::MissingField { field })
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

impl SequentialConfig {
    pub fn builder() -> SequentialConfigBuilder {
        SequentialConfigBuilder::default()
    }
}

impl ParallelConfig {
    pub fn builder() -> ParallelConfigBuilder {
        ParallelConfigBuilder::default()
    }
}

impl LoopConfig {
    pub fn builder() -> LoopConfigBuilder {
        LoopConfigBuilder::default()
    }
}

impl LlmConfig {
    pub fn builder() -> LlmConfigBuilder {
        LlmConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct SequentialConfigBuilder {
    name: Option<String>,
    steps: Option<Vec<Step>>,
    tools: Vec<String>,
}

impl SequentialConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Append one step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.get_or_insert_with(Vec::new).push(step);
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn build(self) -> Result<SequentialConfig, ConfigError> {
        let name = require(self.name, "name")?;
        check_name(&name)?;
        Ok(SequentialConfig {
            name,
            steps: require(self.steps, "steps")?,
            tools: self.tools,
        })
    }
}

#[derive(Debug)]
pub struct ParallelConfigBuilder {
    name: Option<String>,
    tasks: Option<Vec<Step>>,
    tools: Vec<String>,
    task_timeout: Duration,
    halt_on_error: bool,
}

impl Default for ParallelConfigBuilder {
    fn default() -> Self {
        Self {
            name: None,
            tasks: None,
            tools: Vec::new(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            halt_on_error: true,
        }
    }
}

impl ParallelConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tasks(mut self, tasks: Vec<Step>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Append one task.
    pub fn task(mut self, task: Step) -> Self {
        self.tasks.get_or_insert_with(Vec::new).push(task);
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn halt_on_error(mut self, halt: bool) -> Self {
        self.halt_on_error = halt;
        self
    }

    pub fn build(self) -> Result<ParallelConfig, ConfigError> {
        let name = require(self.name, "name")?;
        check_name(&name)?;
        if self.task_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(ParallelConfig {
            name,
            tasks: require(self.tasks, "tasks")?,
            tools: self.tools,
            task_timeout: self.task_timeout,
            halt_on_error: self.halt_on_error,
        })
    }
}

#[derive(Debug)]
pub struct LoopConfigBuilder {
    name: Option<String>,
    steps: Option<Vec<Step>>,
    condition: Option<Condition>,
    max_iterations: u32,
    tools: Vec<String>,
}

impl Default for LoopConfigBuilder {
    fn default() -> Self {
        Self {
            name: None,
            steps: None,
            condition: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tools: Vec::new(),
        }
    }
}

impl LoopConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.get_or_insert_with(Vec::new).push(step);
        self
    }

    pub fn condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &StateMap) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.condition = Some(Condition::new(f));
        self
    }

    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn build(self) -> Result<LoopConfig, ConfigError> {
        let name = require(self.name, "name")?;
        check_name(&name)?;
        Ok(LoopConfig {
            name,
            steps: require(self.steps, "steps")?,
            condition: require(self.condition, "condition")?,
            max_iterations: self.max_iterations,
            tools: self.tools,
        })
    }
}

pub struct LlmConfigBuilder {
    name: Option<String>,
    provider: Option<Arc<dyn LlmProvider>>,
    instruction: Option<String>,
    tools: Vec<String>,
    max_turns: u32,
    options: Map<String, Value>,
}

impl Default for LlmConfigBuilder {
    fn default() -> Self {
        Self {
            name: None,
            provider: None,
            instruction: None,
            tools: Vec::new(),
            max_turns: DEFAULT_MAX_TURNS,
            options: Map::new(),
        }
    }
}

impl LlmConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn max_turns(mut self, max: u32) -> Self {
        self.max_turns = max;
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<LlmConfig, ConfigError> {
        let name = require(self.name, "name")?;
        check_name(&name)?;
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_turns must be at least 1".into(),
            });
        }
        Ok(LlmConfig {
            name,
            provider: require(self.provider, "provider")?,
            instruction: self.instruction,
            tools: self.tools,
            max_turns: self.max_turns,
            options: self.options,
        })
    }
}
