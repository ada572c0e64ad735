//! Agent Spawner — lifecycle manager for a set of runtimes.
//!
//! The spawner starts, supervises, and stops [`AgentRuntime`]s by id. It
//! owns no bus connections of its own; the bus and sentinel handles it was
//! constructed with are only passed through to the runtimes it spawns.

use crate::evoloop::bus::MessageBus;
use crate::evoloop::runtime::{
    AgentRuntime, EvolutionAgent, RuntimeConfig, RuntimeError, RuntimeHealth,
};
use crate::evoloop::sentinel::CreditSentinel;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Spawns and manages multiple agent runtimes.
pub struct AgentSpawner {
    bus: Arc<MessageBus>,
    sentinel: Arc<CreditSentinel>,
    agents: Mutex<HashMap<String, Arc<AgentRuntime>>>,
}

impl AgentSpawner {
    /// Create a spawner that hands the given bus and sentinel to every
    /// runtime it spawns.
    pub fn new(bus: Arc<MessageBus>, sentinel: Arc<CreditSentinel>) -> Self {
        Self {
            bus,
            sentinel,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn and start a runtime for `agent_id`.
    ///
    /// Idempotent by id: a second spawn of the same id returns the existing
    /// runtime untouched.
    pub async fn spawn_agent(
        &self,
        agent_id: impl Into<String>,
        agent: Arc<dyn EvolutionAgent>,
        config: RuntimeConfig,
    ) -> Result<Arc<AgentRuntime>, RuntimeError> {
        let agent_id = agent_id.into();
        let mut agents = self.agents.lock().await;
        if let Some(existing) = agents.get(&agent_id) {
            log::warn!("agent {} already exists", agent_id);
            return Ok(Arc::clone(existing));
        }

        let runtime = AgentRuntime::new(
            agent_id.clone(),
            agent,
            Arc::clone(&self.bus),
            Arc::clone(&self.sentinel),
            config,
        );
        runtime.start().await?;
        agents.insert(agent_id.clone(), Arc::clone(&runtime));
        log::info!("spawned agent: {}", agent_id);
        Ok(runtime)
    }

    /// Cleanly stop and deregister one agent. Unknown ids are a no-op.
    pub async fn stop_agent(&self, agent_id: &str) {
        let runtime = self.agents.lock().await.remove(agent_id);
        if let Some(runtime) = runtime {
            runtime.stop().await;
            log::info!("stopped agent: {}", agent_id);
        }
    }

    /// Best-effort parallel shutdown of every managed runtime.
    pub async fn stop_all(&self) {
        let runtimes: Vec<Arc<AgentRuntime>> =
            self.agents.lock().await.drain().map(|(_, rt)| rt).collect();
        join_all(runtimes.iter().map(|runtime| runtime.stop())).await;
    }

    /// Health snapshots for every managed runtime, keyed by agent id.
    pub async fn get_all_health(&self) -> HashMap<String, RuntimeHealth> {
        let agents = self.agents.lock().await;
        agents
            .iter()
            .map(|(id, runtime)| (id.clone(), runtime.get_health()))
            .collect()
    }

    /// Ids of the currently managed agents.
    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents.lock().await.keys().cloned().collect()
    }

    /// Fetch a managed runtime by id.
    pub async fn get(&self, agent_id: &str) -> Option<Arc<AgentRuntime>> {
        self.agents.lock().await.get(agent_id).map(Arc::clone)
    }
}
