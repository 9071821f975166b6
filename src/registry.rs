use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::bus::types::{Agent, RegisterAgent};
use crate::bus::BusApi;
use crate::discovery::LocalSession;

/// Registers local sessions as bus-visible agents and keeps them alive.
pub struct AgentRegistry {
    bus: Arc<dyn BusApi>,
}

/// Cancels its heartbeat loop when dropped; at most one of these exists per
/// live agent id.
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl AgentRegistry {
    pub fn new(bus: Arc<dyn BusApi>) -> Self {
        Self { bus }
    }

    /// Register one session. The server is idempotent per
    /// `(machine_id, session_id)`, so re-registering an already-known
    /// session returns the same agent.
    pub async fn register(
        &self,
        machine_id: &str,
        session: &LocalSession,
        capabilities: Vec<String>,
    ) -> Result<Agent> {
        let agent = self
            .bus
            .register_agent(RegisterAgent {
                machine_id: machine_id.to_string(),
                session_id: session.session_id.clone(),
                session_name: session.session_name.clone(),
                project_path: session.project_path.to_string_lossy().into_owned(),
                capabilities,
            })
            .await?;
        tracing::info!(
            agent_id = %agent.id,
            session_id = %session.session_id,
            "registered agent"
        );
        Ok(agent)
    }

    /// Best-effort: a failure is logged and never blocks shutdown.
    pub async fn deregister(&self, agent_id: &str) {
        match self.bus.deregister_agent(agent_id).await {
            Ok(()) => tracing::info!(agent_id, "deregistered agent"),
            Err(e) => tracing::warn!(agent_id, error = %e, "failed to deregister agent"),
        }
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.bus.heartbeat(agent_id).await
    }

    /// Spawn a loop that beats every `interval`. Beat errors are logged and
    /// swallowed; the loop only stops when the handle is cancelled or
    /// dropped.
    pub fn start_heartbeat_loop(&self, agent_id: &str, interval: Duration) -> HeartbeatHandle {
        let bus = self.bus.clone();
        let agent_id = agent_id.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; skip it so the
            // first beat lands one full interval after registration.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = bus.heartbeat(&agent_id).await {
                    tracing::warn!(agent_id = %agent_id, error = %e, "heartbeat failed");
                }
            }
        });
        HeartbeatHandle { task }
    }
}
