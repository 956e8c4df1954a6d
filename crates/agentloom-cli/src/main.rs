//! CLI entry point for agentloom.
//!
//! The `agentloom` binary loads an agent manifest, starts every agent under
//! a supervisor and runs one of them.

mod builtins;
mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentloom_runtime::{AgentSupervisor, Services};
use agentloom_store::SqliteMemory;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::manifest::Manifest;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// agentloom: supervised agent workflows.
#[derive(Parser)]
#[command(
    name = "agentloom",
    version,
    about = "Run supervised agent workflows from a TOML manifest"
)]
struct Cli {
    /// Emit logs as JSON instead of the compact format.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the manifest's agents and run one of them.
    Run {
        /// Path to the agent manifest.
        #[arg(short, long)]
        manifest: PathBuf,

        /// Name of the agent to run.
        #[arg(short, long)]
        agent: String,

        /// Input value; parsed as JSON when possible, otherwise a string.
        #[arg(short, long)]
        input: Option<String>,

        /// Override the manifest's call timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Keep session memory in this SQLite file.
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Validate a manifest and list its agents.
    Check {
        #[arg(short, long)]
        manifest: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing("info", cli.json);

    match cli.command {
        Commands::Run {
            manifest,
            agent,
            input,
            timeout_ms,
            db,
        } => cmd_run(&manifest, &agent, input.as_deref(), timeout_ms, db).await,
        Commands::Check { manifest } => cmd_check(&manifest),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(
    manifest_path: &Path,
    agent: &str,
    input: Option<&str>,
    timeout_ms: Option<u64>,
    db: Option<PathBuf>,
) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let mut runtime = manifest.runtime.clone();
    if let Some(ms) = timeout_ms {
        runtime.call_timeout_ms = ms;
    }
    runtime.validate()?;

    let mut services = Services::new(&runtime).context("failed to create runtime services")?;
    if let Some(path) = db {
        let memory = SqliteMemory::open(path.clone())
            .await
            .with_context(|| format!("failed to open session database {}", path.display()))?;
        services = services.with_memory(Arc::new(memory));
        info!(path = %path.display(), "session memory on disk");
    }
    builtins::register(&services.tools, Arc::clone(&services.memory))
        .context("failed to register builtin tools")?;

    let supervisor = AgentSupervisor::new(services, runtime);
    for config in manifest.agent_configs()? {
        supervisor.start_agent(config)?;
    }
    info!(agents = supervisor.names().len(), "manifest loaded");

    let result = supervisor.run(agent, parse_input(input)).await;
    supervisor.shutdown();

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(agent, error = %e, "run failed");
            eprintln!("{}", serde_json::to_string_pretty(&e.to_value())?);
            std::process::exit(1);
        }
    }
}

/// JSON when the text parses as JSON, otherwise the raw string.
fn parse_input(input: Option<&str>) -> Value {
    match input {
        None => Value::Null,
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::from(text)),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: check
// ---------------------------------------------------------------------------

fn cmd_check(manifest_path: &Path) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let configs = manifest.agent_configs()?;

    println!();
    println!("  {} agent(s) in {}", configs.len(), manifest_path.display());
    println!();
    for (entry, config) in manifest.agents.iter().zip(&configs) {
        let tools = if config.tools().is_empty() {
            "-".to_string()
        } else {
            config.tools().join(", ")
        };
        println!(
            "  {:<20} {:<11} steps: {:<3} tools: {}",
            config.name(),
            config.kind().as_str(),
            entry.step_count(),
            tools
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_is_json_when_it_parses() {
        assert_eq!(parse_input(None), Value::Null);
        assert_eq!(parse_input(Some("42")), json!(42));
        assert_eq!(parse_input(Some(r#"{"a": [1]}"#)), json!({"a": [1]}));
        assert_eq!(parse_input(Some("hello world")), json!("hello world"));
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "agentloom", "run", "-m", "agents.toml", "-a", "shout", "--input", "hi", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run { agent, input, .. } => {
                assert_eq!(agent, "shout");
                assert_eq!(input.as_deref(), Some("hi"));
            }
            Commands::Check { .. } => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn sample_manifest_runs_end_to_end() {
        let manifest = Manifest::from_toml_str(
            r#"
            [[agents]]
            name = "shout"
            kind = "sequential"
            steps = [
                { tool = "uppercase", params = { text = "hello" } },
                { function = "reverse" },
            ]

            [[agents]]
            name = "count"
            kind = "loop"
            until = { output_at_least = 3 }
            steps = [{ function = "increment" }]
            "#,
        )
        .unwrap();

        let services = Services::new(&manifest.runtime).unwrap();
        builtins::register(&services.tools, Arc::clone(&services.memory)).unwrap();
        let supervisor = AgentSupervisor::new(services, manifest.runtime.clone());
        for config in manifest.agent_configs().unwrap() {
            supervisor.start_agent(config).unwrap();
        }

        let out = supervisor.run("shout", Value::Null).await.unwrap();
        assert_eq!(out, json!({"output": "OLLEH"}));

        let out = supervisor.run("count", json!(0)).await.unwrap();
        assert_eq!(out, json!({"output": 3, "status": "condition_met", "iterations": 3}));
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn run_with_db_persists_session_state() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("agents.toml");
        std::fs::write(
            &manifest_path,
            r#"
            [[agents]]
            name = "remember"
            kind = "sequential"
            steps = [{ tool = "state_set", params = { key = "mood", value = "calm" } }]
            "#,
        )
        .unwrap();
        let db_path = dir.path().join("sessions.db");

        cmd_run(&manifest_path, "remember", None, Some(2_000), Some(db_path.clone()))
            .await
            .unwrap();

        let memory = SqliteMemory::open(db_path).await.unwrap();
        let sessions = memory.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        let state = memory.state(&sessions[0].id).await.unwrap();
        assert_eq!(state["mood"], json!("calm"));
    }
}
