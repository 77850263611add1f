use crate::metrics::AgentCounts;
use crate::types::{Agent, AgentStatus, AgentType};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// Holds agent descriptors together with their live status and health.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace an agent by identifier. Returns the replaced entry.
    pub async fn register(&self, agent: Agent) -> Option<Agent> {
        let mut agents = self.agents.write().await;
        info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            status = %agent.status,
            "Registered agent"
        );
        agents.insert(agent.id.clone(), agent)
    }

    /// Look up an agent.
    pub async fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().await.get(id).cloned()
    }

    /// Whether an agent is registered under `id`.
    pub async fn contains(&self, id: &str) -> bool {
        self.agents.read().await.contains_key(id)
    }

    /// All agents, ordered by identifier.
    pub async fn list(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Agents of one type, ordered by identifier.
    pub async fn list_by_type(&self, agent_type: AgentType) -> Vec<Agent> {
        let mut list = self.list().await;
        list.retain(|a| a.agent_type == agent_type);
        list
    }

    /// Agents whose status is `online`.
    pub async fn list_available(&self) -> Vec<Agent> {
        let mut list = self.list().await;
        list.retain(Agent::is_available);
        list
    }

    /// Agents offering `capability`.
    pub async fn list_by_capability(&self, capability: &str) -> Vec<Agent> {
        let mut list = self.list().await;
        list.retain(|a| a.has_capability(capability));
        list
    }

    /// Agents carrying a discovery tag.
    pub async fn list_by_tag(&self, tag: &str) -> Vec<Agent> {
        let mut list = self.list().await;
        list.retain(|a| a.config.discovery.tags.iter().any(|t| t == tag));
        list
    }

    /// Clone of the whole registry keyed by identifier.
    pub async fn snapshot(&self) -> HashMap<String, Agent> {
        self.agents.read().await.clone()
    }

    /// Set an agent's status. Any transition is allowed.
    /// Returns `false` if the agent does not exist.
    pub async fn update_status(&self, id: &str, status: AgentStatus) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(id) {
            Some(agent) => {
                if agent.status != status {
                    info!(agent_id = %id, from = %agent.status, to = %status, "Agent status changed");
                }
                agent.status = status;
                true
            }
            None => false,
        }
    }

    /// Apply `f` to the agent under the write lock.
    pub async fn update<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Agent) -> R,
    {
        let mut agents = self.agents.write().await;
        agents.get_mut(id).map(f)
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// True when no agent is registered.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Tallies by status.
    pub async fn counts(&self) -> AgentCounts {
        let agents = self.agents.read().await;
        let mut counts = AgentCounts {
            total: agents.len(),
            ..AgentCounts::default()
        };
        for agent in agents.values() {
            match agent.status {
                AgentStatus::Online => counts.active += 1,
                AgentStatus::Offline => counts.offline += 1,
                AgentStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
