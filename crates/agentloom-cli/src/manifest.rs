//! Agent manifests.
//!
//! A manifest is a TOML file with an optional `[runtime]` table (parsed as
//! [`RuntimeConfig`]) and a list of `[[agents]]`:
//!
//! ```toml
//! [runtime]
//! call_timeout_ms = 2000
//!
//! [[agents]]
//! name = "shout"
//! kind = "sequential"
//! steps = [
//!     { tool = "uppercase", params = { text = "hello" } },
//!     { function = "reverse" },
//! ]
//!
//! [[agents]]
//! name = "count"
//! kind = "loop"
//! max_iterations = 5
//! until = { output_at_least = 3 }
//! steps = [{ function = "increment" }]
//! ```
//!
//! Steps are `{ tool, params }`, `{ function }` or `{ transform }`.  Any other
//! shape is kept as an unknown step and fails when executed.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use agentloom_kernel::Fault;
use agentloom_runtime::RuntimeConfig;
use agentloom_workflow::{AgentConfig, LoopConfig, ParallelConfig, SequentialConfig, StateMap, Step};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

/// A parsed manifest file.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentSpec {
    Sequential {
        name: String,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        steps: Vec<Value>,
    },
    Parallel {
        name: String,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        tasks: Vec<Value>,
        task_timeout_ms: Option<u64>,
        halt_on_error: Option<bool>,
    },
    Loop {
        name: String,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        steps: Vec<Value>,
        until: Until,
        max_iterations: Option<u32>,
    },
}

/// Loop exit condition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Until {
    /// The running output equals this value.
    OutputEquals(Value),
    /// The session state holds `value` under `key`.
    StateEquals { key: String, value: Value },
    /// The running output is a number of at least this size.
    OutputAtLeast(f64),
}

impl Manifest {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content).context("invalid manifest")?;
        manifest.runtime.validate()?;

        let mut seen = HashSet::new();
        for agent in &manifest.agents {
            if !seen.insert(agent.name()) {
                bail!("duplicate agent name `{}`", agent.name());
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Build every agent's configuration.
    pub fn agent_configs(&self) -> Result<Vec<AgentConfig>> {
        self.agents.iter().map(AgentSpec::to_config).collect()
    }
}

impl AgentSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Sequential { name, .. } | Self::Parallel { name, .. } | Self::Loop { name, .. } => {
                name
            }
        }
    }

    pub fn to_config(&self) -> Result<AgentConfig> {
        let config: AgentConfig = match self {
            Self::Sequential { name, tools, steps } => {
                let mut builder = SequentialConfig::builder().name(name).steps(parse_steps(steps)?);
                for tool in tools {
                    builder = builder.tool(tool);
                }
                builder.build()?.into()
            }
            Self::Parallel {
                name,
                tools,
                tasks,
                task_timeout_ms,
                halt_on_error,
            } => {
                let mut builder = ParallelConfig::builder().name(name).tasks(parse_steps(tasks)?);
                if let Some(ms) = task_timeout_ms {
                    builder = builder.task_timeout(Duration::from_millis(*ms));
                }
                if let Some(halt) = halt_on_error {
                    builder = builder.halt_on_error(*halt);
                }
                for tool in tools {
                    builder = builder.tool(tool);
                }
                builder.build()?.into()
            }
            Self::Loop {
                name,
                tools,
                steps,
                until,
                max_iterations,
            } => {
                let mut builder = LoopConfig::builder().name(name).steps(parse_steps(steps)?);
                builder = match until.clone() {
                    Until::OutputEquals(expected) => {
                        builder.condition(move |output, _| Ok(*output == expected))
                    }
                    Until::StateEquals { key, value } => {
                        builder.condition(move |_, state| Ok(state.get(&key) == Some(&value)))
                    }
                    Until::OutputAtLeast(min) => builder
                        .condition(move |output, _| Ok(output.as_f64().is_some_and(|n| n >= min))),
                };
                if let Some(max) = max_iterations {
                    builder = builder.max_iterations(*max);
                }
                for tool in tools {
                    builder = builder.tool(tool);
                }
                builder.build()?.into()
            }
        };
        Ok(config)
    }

    /// Number of steps (or tasks) declared.
    pub fn step_count(&self) -> usize {
        match self {
            Self::Sequential { steps, .. } | Self::Loop { steps, .. } => steps.len(),
            Self::Parallel { tasks, .. } => tasks.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

fn parse_steps(raw: &[Value]) -> Result<Vec<Step>> {
    raw.iter()
        .enumerate()
        .map(|(i, value)| parse_step(value).with_context(|| format!("step {i}")))
        .collect()
}

fn parse_step(raw: &Value) -> Result<Step> {
    let Some(table) = raw.as_object() else {
        return Ok(Step::unknown(raw.clone()));
    };

    if let Some(Value::String(tool)) = table.get("tool") {
        let params = table.get("params").cloned().unwrap_or(Value::Null);
        return Ok(Step::tool(tool.as_str(), params));
    }
    if let Some(Value::String(function)) = table.get("function") {
        return function_step(function);
    }
    if let Some(Value::String(transform)) = table.get("transform") {
        return transform_step(transform);
    }
    Ok(Step::unknown(raw.clone()))
}

fn function_step(name: &str) -> Result<Step> {
    let step = match name {
        "upper" => Step::function(|v| map_str(&v, str::to_uppercase)),
        "lower" => Step::function(|v| map_str(&v, str::to_lowercase)),
        "trim" => Step::function(|v| map_str(&v, |s| s.trim().to_string())),
        "reverse" => Step::function(|v| map_str(&v, |s| s.chars().rev().collect())),
        "increment" => Step::function(increment),
        other => bail!("unknown function `{other}`"),
    };
    Ok(step.named(name))
}

fn transform_step(name: &str) -> Result<Step> {
    let step = match name {
        "merge_state" => Step::transform(merge_state),
        other => bail!("unknown transform `{other}`"),
    };
    Ok(step.named(name))
}

fn map_str(value: &Value, f: impl Fn(&str) -> String) -> Result<Value, Fault> {
    value
        .as_str()
        .map(|s| Value::from(f(s)))
        .ok_or_else(|| Fault::new(format!("expected a string, got {value}")))
}

/// `null` counts as zero.
fn increment(value: Value) -> Result<Value, Fault> {
    match value {
        Value::Null => Ok(Value::from(1)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i + 1))
            } else {
                n.as_f64()
                    .map(|f| Value::from(f + 1.0))
                    .ok_or_else(|| Fault::new(format!("cannot increment {n}")))
            }
        }
        other => Err(Fault::new(format!("expected a number, got {other}"))),
    }
}

/// Session state overlaid with the input's fields.  A non-object input is
/// kept under `input`.
fn merge_state(input: Value, state: &StateMap) -> Result<Value, Fault> {
    let mut merged = state.clone();
    match input {
        Value::Object(fields) => merged.extend(fields),
        other => {
            merged.insert("input".into(), other);
        }
    }
    Ok(Value::Object(merged))
}
