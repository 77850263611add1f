use crate::bootstrap::default_agents;
use crate::config::CoordinatorConfig;
use crate::endpoint::AgentEndpoint;
use crate::health::HealthMonitor;
use crate::metrics::{MetricsAggregator, MetricsSink, MetricsSnapshot};
use crate::policy::{Policy, PolicyEngine, AGENT_REGISTER, AGENT_STATUS};
use crate::registry::AgentRegistry;
use crate::scheduler::{TaskScheduler, TaskSpec};
use crate::triggers::TriggerRunner;
use crate::types::{Agent, AgentStatus, Task};
use crate::workflow::{Workflow, WorkflowEngine, WorkflowExecution};
use maestro_core::{MaestroError, MaestroResult};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

/// Owns every coordinator component and runs the background loops.
///
/// All state-changing operations go through here so that metrics sinks see
/// a fresh snapshot after each change.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<AgentRegistry>,
    policies: Arc<PolicyEngine>,
    scheduler: Arc<TaskScheduler>,
    workflows: Arc<WorkflowEngine>,
    health: Arc<HealthMonitor>,
    metrics: MetricsAggregator,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl Coordinator {
    /// Build every component around `endpoint`. Fails on an invalid config.
    pub fn new(config: CoordinatorConfig, endpoint: Arc<dyn AgentEndpoint>) -> MaestroResult<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::new());
        let policies = Arc::new(PolicyEngine::new());
        let scheduler = Arc::new(TaskScheduler::new(
            registry.clone(),
            endpoint.clone(),
            policies.clone(),
            config.clone(),
        ));
        let workflows = Arc::new(WorkflowEngine::new(registry.clone(), scheduler.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            endpoint,
            policies.clone(),
            config.probe_timeout(),
            config.max_health_errors,
        ));
        let metrics = MetricsAggregator::new(registry.clone(), scheduler.clone(), workflows.clone());

        Ok(Self {
            config,
            registry,
            policies,
            scheduler,
            workflows,
            health,
            metrics,
            sinks: Vec::new(),
        })
    }

    /// Add a destination for metrics snapshots.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Settings the coordinator was built with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The policy engine.
    pub fn policies(&self) -> &Arc<PolicyEngine> {
        &self.policies
    }

    /// The task scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// The workflow engine.
    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    /// The health monitor.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Register the built-in agent set if enabled. Returns how many were registered.
    pub async fn bootstrap(&self) -> usize {
        if !self.config.bootstrap_agents {
            return 0;
        }
        let agents = default_agents();
        let count = agents.len();
        for agent in agents {
            self.register_agent(agent).await;
        }
        info!(count, "Bootstrap agents registered");
        count
    }

    /// Insert or replace an agent. Returns the replaced entry.
    pub async fn register_agent(&self, agent: Agent) -> Option<Agent> {
        self.policies.apply_policies(&agent, AGENT_REGISTER);
        let previous = self.registry.register(agent).await;
        self.publish_metrics().await;
        previous
    }

    /// Override an agent's status.
    pub async fn update_agent_status(&self, id: &str, status: AgentStatus) -> MaestroResult<()> {
        if !self.registry.update_status(id, status).await {
            return Err(MaestroError::AgentNotFound(id.to_string()));
        }
        if let Some(agent) = self.registry.get(id).await {
            self.policies.apply_policies(&agent, AGENT_STATUS);
        }
        self.publish_metrics().await;
        Ok(())
    }

    /// Create a task. See [`TaskScheduler::create_task`].
    pub async fn create_task(&self, spec: TaskSpec) -> MaestroResult<Task> {
        let task = self.scheduler.create_task(spec).await?;
        self.publish_metrics().await;
        Ok(task)
    }

    /// Cancel a pending task. Returns `false` if it was not pending.
    pub async fn cancel_task(&self, id: Uuid) -> bool {
        let cancelled = self.scheduler.cancel_task(id);
        if cancelled {
            self.publish_metrics().await;
        }
        cancelled
    }

    /// Look up a task.
    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.scheduler.get(id)
    }

    /// Define or replace a workflow. See [`WorkflowEngine::define`].
    pub async fn define_workflow(&self, workflow: Workflow) -> MaestroResult<WorkflowExecution> {
        let execution = self.workflows.define(workflow).await?;
        self.publish_metrics().await;
        Ok(execution)
    }

    /// Run a workflow to completion. See [`WorkflowEngine::execute`].
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Value,
    ) -> MaestroResult<WorkflowExecution> {
        let execution = self.workflows.execute(workflow_id, input).await?;
        self.publish_metrics().await;
        Ok(execution)
    }

    /// Install or replace a policy.
    pub fn add_policy(&self, policy: Policy) {
        self.policies.add_policy(policy);
    }

    /// Current snapshot, without publishing it.
    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    /// Recompute the snapshot and hand it to every sink.
    pub async fn publish_metrics(&self) -> MetricsSnapshot {
        let snapshot = self.metrics.snapshot().await;
        for sink in &self.sinks {
            sink.publish(&snapshot);
        }
        snapshot
    }

    /// Start the dispatch, health and trigger loops.
    ///
    /// Each loop runs on its own task and timer, so a slow probe pass never
    /// delays dispatch.
    pub fn start(self: &Arc<Self>) -> CoordinatorHandle {
        let dispatch = {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(coordinator.config.dispatch_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut published = None;
                loop {
                    ticker.tick().await;
                    let started = coordinator.scheduler.tick().await;
                    if started > 0 {
                        debug!(started, "Dispatch tick");
                    }
                    let revision = coordinator.scheduler.revision();
                    if published != Some(revision) {
                        coordinator.publish_metrics().await;
                        published = Some(revision);
                    }
                }
            })
        };

        let health = {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(coordinator.config.health_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    coordinator.health.check_all().await;
                    coordinator.publish_metrics().await;
                }
            })
        };

        let triggers = TriggerRunner::new(self.workflows.clone()).spawn();

        info!(
            dispatch_interval_ms = self.config.dispatch_interval_ms,
            health_interval_secs = self.config.health_interval_secs,
            "Coordinator loops started"
        );
        CoordinatorHandle {
            dispatch,
            health,
            triggers,
        }
    }
}

/// Handles of the background loops started by [`Coordinator::start`].
pub struct CoordinatorHandle {
    dispatch: JoinHandle<()>,
    health: JoinHandle<()>,
    triggers: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Stop all loops. In-flight agent calls are left to finish on their own.
    pub fn shutdown(self) {
        self.dispatch.abort();
        self.health.abort();
        self.triggers.abort();
        info!("Coordinator loops stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::endpoint::HttpAgentEndpoint;
    use crate::types::AgentType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        snapshots: Mutex<Vec<MetricsSnapshot>>,
    }

    impl MetricsSink for RecordingSink {
        fn publish(&self, snapshot: &MetricsSnapshot) {
            self.snapshots.lock().push(*snapshot);
        }
    }

    fn coordinator(config: CoordinatorConfig) -> Coordinator {
        Coordinator::new(config, Arc::new(HttpAgentEndpoint::new())).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_registers_default_set() {
        let c = coordinator(CoordinatorConfig::default());
        assert_eq!(c.bootstrap().await, 4);
        let metrics = c.metrics().await;
        assert_eq!(metrics.agents.total, 4);
        assert_eq!(metrics.agents.active, 4);
    }

    #[tokio::test]
    async fn test_bootstrap_disabled() {
        let c = coordinator(CoordinatorConfig {
            bootstrap_agents: false,
            ..CoordinatorConfig::default()
        });
        assert_eq!(c.bootstrap().await, 0);
        assert!(c.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_state_changes_publish_metrics() {
        let sink = Arc::new(RecordingSink::default());
        let c = coordinator(CoordinatorConfig::default()).with_sink(sink.clone());
        c.register_agent(Agent::new("a1", "A1", AgentType::Analytics))
            .await;
        c.create_task(TaskSpec::new("a1", "analysis", serde_json::json!({})))
            .await
            .unwrap();

        let snapshots = sink.snapshots.lock();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].tasks.pending, 1);
    }

    #[tokio::test]
    async fn test_update_status_unknown_agent() {
        let c = coordinator(CoordinatorConfig::default());
        let err = c
            .update_agent_status("ghost", AgentStatus::Offline)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Coordinator::new(
            CoordinatorConfig {
                dispatch_interval_ms: 0,
                ..CoordinatorConfig::default()
            },
            Arc::new(HttpAgentEndpoint::new()),
        );
        assert!(result.is_err());
    }
}
