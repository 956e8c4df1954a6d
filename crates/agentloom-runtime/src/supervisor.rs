//! One-for-one supervision of agent actors.
//!
//! The supervisor owns a name-keyed table of agents.  Every actor instance
//! gets a monitor task that waits on its join handle; when an instance that
//! is still current dies abnormally (panic or kill), the monitor restarts it
//! from the stored config with the same session id.  Only that agent is
//! affected.
//!
//! Restart intensity: more than `max_restarts` crashes within
//! `restart_window_ms` and the agent is removed instead of restarted.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use agentloom_workflow::AgentConfig;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use agentloom_kernel::TelemetryEvent;

use crate::actor::{AgentHandle, AgentRuntime, RunningAgent};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::services::Services;

struct SupervisedAgent {
    config: AgentConfig,
    session_id: String,
    handle: AgentHandle,
    /// Crash times inside the current restart window.
    crashes: VecDeque<Instant>,
}

struct SupervisorInner {
    services: Services,
    config: RuntimeConfig,
    agents: DashMap<String, SupervisedAgent>,
}

/// Starts, restarts and stops named agents.
#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for AgentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSupervisor")
            .field("agents", &self.names())
            .finish_non_exhaustive()
    }
}

impl AgentSupervisor {
    pub fn new(services: Services, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                services,
                config,
                agents: DashMap::new(),
            }),
        }
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Start a supervised agent.  Names are unique among running agents.
    pub fn start_agent(&self, config: AgentConfig) -> Result<AgentHandle> {
        let name = config.name().to_string();
        let (handle, task) = match self.inner.agents.entry(name.clone()) {
            Entry::Occupied(_) => return Err(RuntimeError::AgentAlreadyRunning { name }),
            Entry::Vacant(slot) => {
                let RunningAgent { handle, task } =
                    AgentRuntime::spawn(config.clone(), &self.inner.services, &self.inner.config, None)?;
                slot.insert(SupervisedAgent {
                    config,
                    session_id: handle.info().session_id.clone(),
                    handle: handle.clone(),
                    crashes: VecDeque::new(),
                });
                (handle, task)
            }
        };
        self.inner.monitor(name, handle.info().agent_id, task);
        tracing::info!(agent = %handle.name(), agent_id = %handle.info().agent_id, "agent supervised");
        Ok(handle)
    }

    /// Return the running agent with this config's name, starting it first
    /// if needed.
    pub fn ensure_agent(&self, config: AgentConfig) -> Result<AgentHandle> {
        if let Ok(handle) = self.handle(config.name()) {
            return Ok(handle);
        }
        let name = config.name().to_string();
        match self.start_agent(config) {
            Err(RuntimeError::AgentAlreadyRunning { .. }) => self.handle(&name),
            other => other,
        }
    }

    /// The current handle for `name`.  Handles obtained before a restart are
    /// stale and report [`RuntimeError::NotRunning`].
    pub fn handle(&self, name: &str) -> Result<AgentHandle> {
        self.inner
            .agents
            .get(name)
            .map(|agent| agent.handle.clone())
            .ok_or_else(|| RuntimeError::AgentNotFound { name: name.to_string() })
    }

    /// Run `name` with the default call timeout.
    pub async fn run(&self, name: &str, input: Value) -> Result<Value> {
        self.handle(name)?.run(input).await
    }

    /// Replace the actor behind `name` with a fresh instance.
    ///
    /// The old instance is aborted; its queued and in-flight calls fail with
    /// [`RuntimeError::NotRunning`].  Manual restarts do not count toward
    /// restart intensity.
    pub fn restart(&self, name: &str) -> Result<AgentHandle> {
        let not_found = || RuntimeError::AgentNotFound { name: name.to_string() };
        let (config, session_id) = self
            .inner
            .agents
            .get(name)
            .map(|agent| (agent.config.clone(), agent.session_id.clone()))
            .ok_or_else(not_found)?;

        // Spawn outside any shard guard on `agents`.
        let RunningAgent { handle, task } = AgentRuntime::spawn(
            config,
            &self.inner.services,
            &self.inner.config,
            Some(session_id),
        )?;

        let old = match self.inner.agents.get_mut(name) {
            Some(mut agent) => std::mem::replace(&mut agent.handle, handle.clone()),
            None => {
                // Stopped while the new instance was starting.
                handle.kill();
                return Err(not_found());
            }
        };
        old.kill();
        self.inner.monitor(name.to_string(), handle.info().agent_id, task);
        tracing::info!(agent = %name, agent_id = %handle.info().agent_id, "agent restarted");
        Ok(handle)
    }

    /// Stop and forget `name`.
    pub fn stop(&self, name: &str) -> Result<()> {
        let (_, agent) = self
            .inner
            .agents
            .remove(name)
            .ok_or_else(|| RuntimeError::AgentNotFound { name: name.to_string() })?;
        agent.handle.kill();
        self.inner.stopped(name);
        Ok(())
    }

    /// Stop every agent.
    pub fn shutdown(&self) {
        for name in self.names() {
            // A concurrent stop may already have removed it.
            let _ = self.stop(&name);
        }
    }

    /// Names of the supervised agents, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl SupervisorInner {
    fn monitor(self: &Arc<Self>, name: String, agent_id: Uuid, task: JoinHandle<()>) {
        let inner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = task.await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match exit {
                Ok(()) => tracing::debug!(agent = %name, %agent_id, "agent exited"),
                Err(e) => {
                    let reason = if e.is_panic() { "panicked" } else { "was aborted" };
                    inner.crashed(&name, agent_id, reason);
                }
            }
        });
    }

    /// Handle the abnormal exit of instance `agent_id`.  Exits of instances
    /// that were already replaced or stopped are ignored.
    fn crashed(self: &Arc<Self>, name: &str, agent_id: Uuid, reason: &str) {
        let window = self.config.supervisor.restart_window();
        let max_restarts = self.config.supervisor.max_restarts;

        let retry = {
            let Some(mut agent) = self.agents.get_mut(name) else {
                return;
            };
            if agent.handle.info().agent_id != agent_id {
                return;
            }
            tracing::warn!(agent = %name, %agent_id, reason, "agent crashed");

            let now = Instant::now();
            while agent
                .crashes
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                agent.crashes.pop_front();
            }

            if agent.crashes.len() >= max_restarts as usize {
                None
            } else {
                agent.crashes.push_back(now);
                Some((
                    agent.config.clone(),
                    agent.session_id.clone(),
                    agent.crashes.len() as u32,
                ))
            }
        };

        let Some((config, session_id, restarts)) = retry else {
            let e = RuntimeError::RestartLimitExceeded {
                name: name.to_string(),
                max_restarts,
            };
            tracing::error!(agent = %name, error = %e, "removing agent");
            self.remove_instance(name, agent_id);
            return;
        };

        // Spawn outside any shard guard on `agents`.
        let RunningAgent { handle, task } =
            match AgentRuntime::spawn(config, &self.services, &self.config, Some(session_id)) {
                Ok(running) => running,
                Err(e) => {
                    tracing::error!(agent = %name, error = %e, "agent restart failed; removing");
                    self.remove_instance(name, agent_id);
                    return;
                }
            };

        let swapped = match self.agents.get_mut(name) {
            Some(mut agent) if agent.handle.info().agent_id == agent_id => {
                agent.handle = handle.clone();
                true
            }
            _ => false,
        };
        if !swapped {
            // Stopped or manually restarted while the replacement was starting.
            handle.kill();
            return;
        }

        tracing::info!(agent = %name, agent_id = %handle.info().agent_id, restarts, "agent restarted");
        self.services.telemetry.publish(TelemetryEvent::AgentRestarted {
            agent_name: name.to_string(),
            restarts,
            timestamp: Utc::now(),
        });
        self.monitor(name.to_string(), handle.info().agent_id, task);
    }

    /// Forget `name` if instance `agent_id` is still the one registered.
    fn remove_instance(&self, name: &str, agent_id: Uuid) {
        let removed = self
            .agents
            .remove_if(name, |_, agent| agent.handle.info().agent_id == agent_id);
        if removed.is_some() {
            self.stopped(name);
        }
    }

    fn stopped(&self, name: &str) {
        tracing::info!(agent = %name, "agent stopped");
        self.services.telemetry.publish(TelemetryEvent::AgentStopped {
            agent_name: name.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use agentloom_workflow::{SequentialConfig, Step};
    use serde_json::json;

    fn supervisor(max_restarts: u32) -> AgentSupervisor {
        let mut config = RuntimeConfig::default();
        config.supervisor.max_restarts = max_restarts;
        config.supervisor.restart_window_ms = 60_000;
        let services = Services::new(&config).unwrap();
        AgentSupervisor::new(services, config)
    }

    fn echo(name: &str) -> AgentConfig {
        SequentialConfig::builder()
            .name(name)
            .step(Step::function(|v| Ok(v)))
            .build()
            .unwrap()
            .into()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn names_are_unique() {
        let sup = supervisor(3);
        sup.start_agent(echo("a")).unwrap();
        let err = sup.start_agent(echo("a")).unwrap_err();
        assert!(matches!(err, RuntimeError::AgentAlreadyRunning { .. }));
        assert_eq!(sup.names(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn ensure_agent_reuses_the_running_instance() {
        let sup = supervisor(3);
        let first = sup.ensure_agent(echo("a")).unwrap();
        let second = sup.ensure_agent(echo("a")).unwrap();
        assert_eq!(first.info().agent_id, second.info().agent_id);
    }

    #[tokio::test]
    async fn run_by_name() {
        let sup = supervisor(3);
        sup.start_agent(echo("a")).unwrap();
        assert_eq!(sup.run("a", json!(5)).await.unwrap(), json!({"output": 5}));
        assert!(matches!(
            sup.run("b", json!(5)).await.unwrap_err(),
            RuntimeError::AgentNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn manual_restart_keeps_the_session() {
        let sup = supervisor(3);
        let old = sup.start_agent(echo("a")).unwrap();
        let new = sup.restart("a").unwrap();
        settle().await;

        assert_ne!(old.info().agent_id, new.info().agent_id);
        assert_eq!(old.info().session_id, new.info().session_id);
        assert!(matches!(
            old.run(json!(1)).await.unwrap_err(),
            RuntimeError::NotRunning { .. }
        ));
        assert_eq!(new.run(json!(1)).await.unwrap(), json!({"output": 1}));
    }

    #[tokio::test]
    async fn manual_restart_racing_a_crash_leaves_one_instance() {
        let sup = supervisor(3);
        let mut events = sup.services().telemetry.subscribe();
        let old = sup.start_agent(echo("a")).unwrap();
        old.kill();
        // The monitor has not observed the crash yet.
        let replacement = sup.restart("a").unwrap();
        settle().await;

        let current = sup.handle("a").unwrap();
        assert_eq!(current.info().agent_id, replacement.info().agent_id);
        assert_eq!(sup.run("a", json!(2)).await.unwrap(), json!({"output": 2}));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(*event, TelemetryEvent::AgentRestarted { .. }));
        }
    }

    #[tokio::test]
    async fn restart_of_a_stopped_agent_fails() {
        let sup = supervisor(3);
        sup.start_agent(echo("a")).unwrap();
        sup.stop("a").unwrap();
        assert!(matches!(
            sup.restart("a").unwrap_err(),
            RuntimeError::AgentNotFound { .. }
        ));
        assert!(sup.names().is_empty());
    }

    #[tokio::test]
    async fn crashed_agent_is_restarted() {
        let sup = supervisor(3);
        let old = sup.start_agent(echo("a")).unwrap();
        old.kill();
        settle().await;

        let current = sup.handle("a").unwrap();
        assert_ne!(current.info().agent_id, old.info().agent_id);
        assert_eq!(current.info().session_id, old.info().session_id);
        assert_eq!(sup.run("a", json!("x")).await.unwrap(), json!({"output": "x"}));
    }

    #[tokio::test]
    async fn restart_intensity_gives_up() {
        let sup = supervisor(2);
        sup.start_agent(echo("a")).unwrap();
        for _ in 0..3 {
            sup.handle("a").unwrap().kill();
            settle().await;
        }
        assert!(sup.names().is_empty());
        assert!(matches!(
            sup.handle("a").unwrap_err(),
            RuntimeError::AgentNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn stop_removes_without_restart() {
        let sup = supervisor(3);
        let handle = sup.start_agent(echo("a")).unwrap();
        sup.stop("a").unwrap();
        settle().await;

        assert!(sup.names().is_empty());
        assert!(handle.run(json!(1)).await.is_err());
        assert!(matches!(sup.stop("a").unwrap_err(), RuntimeError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn crash_of_one_agent_leaves_others_alone() {
        let sup = supervisor(3);
        let a = sup.start_agent(echo("a")).unwrap();
        let b = sup.start_agent(echo("b")).unwrap();
        a.kill();
        settle().await;

        assert_eq!(sup.handle("b").unwrap().info().agent_id, b.info().agent_id);
        assert_eq!(b.run(json!(2)).await.unwrap(), json!({"output": 2}));
    }
}
