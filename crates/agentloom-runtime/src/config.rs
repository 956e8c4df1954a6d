//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration.  Durations are written in milliseconds.
//!
//! ```toml
//! call_timeout_ms = 5000
//! inbox_capacity = 64
//!
//! [worker_pool]
//! max_concurrency = 8
//!
//! [telemetry]
//! capacity = 256
//!
//! [supervisor]
//! max_restarts = 3
//! restart_window_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default time a caller waits for an agent's reply.
    pub call_timeout_ms: u64,
    /// Invocations an agent may have queued before senders wait.
    pub inbox_capacity: usize,
    pub worker_pool: WorkerPoolConfig,
    pub telemetry: TelemetryConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            inbox_capacity: 64,
            worker_pool: WorkerPoolConfig::default(),
            telemetry: TelemetryConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Parallel task concurrency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Slots in the shared worker pool; twice the CPU count when unset.
    pub max_concurrency: Option<usize>,
}

/// Telemetry bus sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Events a slow subscriber may fall behind before it lags.
    pub capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Restart intensity for the one-for-one supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restarts allowed within `restart_window_ms`.
    pub max_restarts: u32,
    pub restart_window_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

impl RuntimeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| RuntimeError::RuntimeConfig {
            reason: format!("failed to parse TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| RuntimeError::RuntimeConfig {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(RuntimeError::RuntimeConfig {
                reason: reason.to_string(),
            })
        };
        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms must be greater than zero");
        }
        if self.inbox_capacity == 0 {
            return invalid("inbox_capacity must be greater than zero");
        }
        if self.worker_pool.max_concurrency == Some(0) {
            return invalid("worker_pool.max_concurrency must be greater than zero");
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
