use crate::config::CoordinatorConfig;
use crate::endpoint::{AgentEndpoint, TaskRequest};
use crate::metrics::TaskCounts;
use crate::policy::{Admission, DispatchReservation, PolicyEngine, TASK_CREATE, TASK_DISPATCH};
use crate::registry::AgentRegistry;
use crate::types::{Agent, Task, TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request to create a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Agent that will run the task.
    pub agent_id: String,
    /// Operation name passed to the agent.
    pub task_type: String,
    /// Input passed to the agent.
    pub payload: Value,
    /// Backlog position relative to other tasks.
    pub priority: TaskPriority,
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
    /// Overrides the configured default retry count.
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    /// Normal-priority request using the configured timeout and retries.
    pub fn new(agent_id: impl Into<String>, task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::Normal,
            timeout: None,
            max_retries: None,
        }
    }

    /// Set the priority.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Bound each dispatched attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many failed attempts are retried.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<Uuid, Task>,
    /// Pending task ids, highest priority first, FIFO within a priority.
    backlog: Vec<(TaskPriority, Uuid)>,
    /// Tasks currently running per agent.
    running: HashMap<String, usize>,
    /// Terminal task ids, oldest first.
    history: VecDeque<Uuid>,
    /// Terminal outcomes recorded in the running mean.
    finished: u64,
    avg_duration_ms: f64,
}

impl QueueState {
    fn enqueue(&mut self, priority: TaskPriority, id: Uuid) {
        self.backlog.push((priority, id));
        // Stable: keeps FIFO order within a priority tier.
        self.backlog.sort_by_key(|(priority, _)| Reverse(*priority));
    }

    fn record_duration(&mut self, duration: Duration) {
        self.finished += 1;
        let sample = duration.as_secs_f64() * 1000.0;
        self.avg_duration_ms += (sample - self.avg_duration_ms) / self.finished as f64;
    }

    /// Remember a task that reached a terminal status, dropping the oldest
    /// finished tasks beyond `limit`.
    fn retire(&mut self, id: Uuid, limit: usize) {
        self.history.push_back(id);
        while self.history.len() > limit {
            if let Some(oldest) = self.history.pop_front() {
                self.tasks.remove(&oldest);
            }
        }
    }

    fn release(&mut self, agent_id: &str) {
        if let Some(count) = self.running.get_mut(agent_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.running.remove(agent_id);
            }
        }
    }
}

enum Eligibility {
    Wait,
    Dispatch(Box<Agent>, DispatchReservation),
    Reject(String),
}

/// Priority backlog of tasks with a periodic dispatch step.
///
/// Each call to [`TaskScheduler::tick`] scans the backlog from the head and
/// starts the first eligible tasks, up to `max_dispatch_per_tick`. A task is
/// eligible when its agent exists and is online, its retry backoff has
/// elapsed, the agent has spare capacity and no policy defers or denies the
/// dispatch. Ineligible tasks keep their place.
///
/// Only the newest `task_history_limit` finished tasks stay queryable.
pub struct TaskScheduler {
    registry: Arc<AgentRegistry>,
    endpoint: Arc<dyn AgentEndpoint>,
    policies: Arc<PolicyEngine>,
    config: CoordinatorConfig,
    state: Mutex<QueueState>,
    /// Fires on dispatch and on every terminal transition.
    changed: Notify,
    revision: AtomicU64,
}

impl TaskScheduler {
    /// Scheduler with an empty backlog.
    pub fn new(
        registry: Arc<AgentRegistry>,
        endpoint: Arc<dyn AgentEndpoint>,
        policies: Arc<PolicyEngine>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            endpoint,
            policies,
            config,
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
            revision: AtomicU64::new(0),
        }
    }

    /// Settings the scheduler was built with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Create a pending task and queue it.
    ///
    /// Fails if the agent is unknown or a policy denies task creation for it.
    /// Agent availability is checked at dispatch, not here.
    pub async fn create_task(&self, spec: TaskSpec) -> MaestroResult<Task> {
        let agent = self
            .registry
            .get(&spec.agent_id)
            .await
            .ok_or_else(|| MaestroError::AgentNotFound(spec.agent_id.clone()))?;

        if let Admission::Deny { policy, reason } =
            self.policies.apply_policies(&agent, TASK_CREATE).admission
        {
            return Err(MaestroError::PolicyDenied { policy, reason });
        }

        let task = Task::new(spec.agent_id, spec.task_type, spec.payload, spec.priority)
            .with_timeout(spec.timeout.unwrap_or_else(|| self.config.default_task_timeout()))
            .with_max_retries(spec.max_retries.unwrap_or(self.config.default_max_retries));

        {
            let mut state = self.state.lock();
            state.tasks.insert(task.id, task.clone());
            state.enqueue(task.priority, task.id);
        }
        self.touch();

        info!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            task_type = %task.task_type,
            priority = ?task.priority,
            "Task created"
        );
        Ok(task)
    }

    /// Cancel a pending task. Returns `false` if it is unknown or not pending.
    pub fn cancel_task(&self, id: Uuid) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            let cancelled = state.tasks.get_mut(&id).is_some_and(Task::cancel);
            if cancelled {
                state.backlog.retain(|(_, queued)| *queued != id);
                state.retire(id, self.config.task_history_limit);
            }
            cancelled
        };
        if cancelled {
            info!(task_id = %id, "Task cancelled");
            self.touch();
            self.changed.notify_waiters();
        }
        cancelled
    }

    /// Look up a task that is queued, running or among the retained finished ones.
    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.state.lock().tasks.get(&id).cloned()
    }

    /// All retained tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Ids of pending tasks in dispatch order.
    pub fn backlog(&self) -> Vec<Uuid> {
        self.state.lock().backlog.iter().map(|(_, id)| *id).collect()
    }

    /// Tallies over the retained tasks, plus the running mean duration.
    pub fn counts(&self) -> TaskCounts {
        let state = self.state.lock();
        let mut counts = TaskCounts {
            total: state.tasks.len(),
            avg_duration_ms: state.avg_duration_ms,
            ..TaskCounts::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Increases on every state change.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    /// Wait until the task reaches a terminal status or `timeout` elapses.
    pub async fn wait_for(&self, id: Uuid, timeout: Duration) -> MaestroResult<Task> {
        self.wait_until(id, Some(timeout), Task::is_terminal).await
    }

    /// Wait until the task leaves the backlog, either dispatched or finished
    /// without running, or `timeout` elapses.
    pub async fn wait_dispatched(&self, id: Uuid, timeout: Duration) -> MaestroResult<Task> {
        self.wait_until(id, Some(timeout), |task| task.status != TaskStatus::Pending)
            .await
    }

    /// Wait with no deadline until the task reaches a terminal status.
    ///
    /// Each dispatched attempt is bounded by the task timeout, so this only
    /// hangs for a task that never leaves the backlog.
    pub async fn wait_terminal(&self, id: Uuid) -> MaestroResult<Task> {
        self.wait_until(id, None, Task::is_terminal).await
    }

    async fn wait_until(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
        done: impl Fn(&Task) -> bool,
    ) -> MaestroResult<Task> {
        let deadline = timeout.map(|limit| (limit, tokio::time::Instant::now() + limit));
        loop {
            // Registered before the check so a change in between is not missed.
            let notified = self.changed.notified();
            match self.get(id) {
                None => return Err(MaestroError::TaskNotFound(id.to_string())),
                Some(task) if done(&task) => return Ok(task),
                Some(_) => {}
            }
            match deadline {
                Some((limit, at)) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return Err(MaestroError::Timeout(limit));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Run one dispatch step. Returns the number of tasks started.
    pub async fn tick(self: &Arc<Self>) -> usize {
        let agents = self.registry.snapshot().await;
        let now = Utc::now();
        let mut launches = Vec::new();
        let mut rejected = false;

        {
            let mut state = self.state.lock();
            let mut index = 0;
            while index < state.backlog.len() && launches.len() < self.config.max_dispatch_per_tick
            {
                let (_, id) = state.backlog[index];
                match self.eligibility(&state, id, &agents, now) {
                    Eligibility::Wait => index += 1,
                    Eligibility::Reject(reason) => {
                        state.backlog.remove(index);
                        if let Some(task) = state.tasks.get_mut(&id) {
                            task.fail(reason);
                            state.retire(id, self.config.task_history_limit);
                        }
                        rejected = true;
                    }
                    Eligibility::Dispatch(agent, reservation) => {
                        state.backlog.remove(index);
                        let Some(task) = state.tasks.get_mut(&id) else {
                            continue;
                        };
                        self.policies.commit(&reservation);
                        task.mark_running();
                        let request = TaskRequest::from(&*task);
                        let timeout = task.timeout();
                        *state.running.entry(agent.id.clone()).or_insert(0) += 1;
                        launches.push((agent, request, timeout));
                    }
                }
            }
        }

        if rejected || !launches.is_empty() {
            self.touch();
            self.changed.notify_waiters();
        }

        let started = launches.len();
        for (agent, request, timeout) in launches {
            info!(task_id = %request.task_id, agent_id = %agent.id, "Dispatching task");
            self.touch();
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let begin = Instant::now();
                let outcome =
                    match tokio::time::timeout(timeout, scheduler.endpoint.execute(&agent, &request))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(MaestroError::Timeout(timeout)),
                    };
                scheduler.finish(request.task_id, &agent.id, begin.elapsed(), outcome);
            });
        }
        started
    }

    fn eligibility(
        &self,
        state: &QueueState,
        id: Uuid,
        agents: &HashMap<String, Agent>,
        now: DateTime<Utc>,
    ) -> Eligibility {
        let Some(task) = state.tasks.get(&id) else {
            return Eligibility::Reject(format!("task {id} missing from the task table"));
        };
        if matches!(task.not_before, Some(at) if at > now) {
            return Eligibility::Wait;
        }
        let Some(agent) = agents.get(&task.agent_id) else {
            debug!(task_id = %id, agent_id = %task.agent_id, "Agent not registered, task waits");
            return Eligibility::Wait;
        };
        if !agent.is_available() {
            debug!(task_id = %id, agent_id = %agent.id, status = %agent.status, "Agent unavailable, task waits");
            return Eligibility::Wait;
        }
        if let Some(limit) = agent.config.scaling.max_concurrent_tasks {
            if state.running.get(&agent.id).copied().unwrap_or(0) >= limit {
                return Eligibility::Wait;
            }
        }
        let outcome = self.policies.apply_policies(agent, TASK_DISPATCH);
        match outcome.admission {
            Admission::Allow => Eligibility::Dispatch(Box::new(agent.clone()), outcome.reservation),
            Admission::Defer { policy, reason } => {
                debug!(task_id = %id, agent_id = %agent.id, %policy, %reason, "Dispatch deferred");
                Eligibility::Wait
            }
            Admission::Deny { policy, reason } => {
                Eligibility::Reject(format!("Denied by policy '{policy}': {reason}"))
            }
        }
    }

    fn finish(
        &self,
        id: Uuid,
        agent_id: &str,
        duration: Duration,
        outcome: MaestroResult<Value>,
    ) {
        {
            let mut state = self.state.lock();
            state.release(agent_id);
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            match outcome {
                Ok(result) => {
                    task.complete(result);
                    info!(task_id = %id, agent_id, duration_ms = duration.as_millis() as u64, "Task completed");
                    state.record_duration(duration);
                }
                Err(err) if err.is_retryable() && task.can_retry() => {
                    let backoff = self.config.retry_backoff(task.retries);
                    let not_before = Utc::now()
                        + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
                    task.requeue_for_retry(err.to_string(), not_before);
                    warn!(
                        task_id = %id,
                        agent_id,
                        attempt = task.retries,
                        max_retries = task.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Task attempt failed, retrying"
                    );
                    let priority = task.priority;
                    state.enqueue(priority, id);
                }
                Err(err) => {
                    task.fail(err.to_string());
                    warn!(task_id = %id, agent_id, error = %err, "Task failed");
                    state.record_duration(duration);
                }
            }
            if state.tasks.get(&id).is_some_and(Task::is_terminal) {
                state.retire(id, self.config.task_history_limit);
            }
        }
        self.touch();
        self.changed.notify_waiters();
    }

    fn touch(&self) {
        self.revision.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::endpoint::ProbeReport;
    use crate::policy::{ActionType, Policy, PolicyAction};
    use crate::types::{AgentStatus, AgentType};
    use async_trait::async_trait;
    use serde_json::json;

    /// Answers every task with its own payload, or with scripted failures.
    #[derive(Default)]
    struct EchoEndpoint {
        failures: Mutex<u32>,
        calls: Mutex<Vec<String>>,
        hang: bool,
    }

    #[async_trait]
    impl AgentEndpoint for EchoEndpoint {
        async fn probe(&self, _agent: &Agent) -> MaestroResult<ProbeReport> {
            Ok(ProbeReport::default())
        }

        async fn execute(&self, agent: &Agent, request: &TaskRequest) -> MaestroResult<Value> {
            self.calls.lock().push(format!("{}:{}", agent.id, request.task_type));
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(MaestroError::Endpoint("connection refused".into()));
            }
            Ok(request.payload.clone())
        }
    }

    async fn setup(
        endpoint: EchoEndpoint,
        config: CoordinatorConfig,
    ) -> (Arc<TaskScheduler>, Arc<AgentRegistry>, Arc<PolicyEngine>) {
        let registry = Arc::new(AgentRegistry::new());
        registry
            .register(Agent::new("a1", "A1", AgentType::Analytics))
            .await;
        registry
            .register(Agent::new("a2", "A2", AgentType::Analytics))
            .await;
        let policies = Arc::new(PolicyEngine::new());
        let scheduler = Arc::new(TaskScheduler::new(
            registry.clone(),
            Arc::new(endpoint),
            policies.clone(),
            config,
        ));
        (scheduler, registry, policies)
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            retry_backoff_base_ms: 0,
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_unknown_agent() {
        let (scheduler, _, _) = setup(EchoEndpoint::default(), fast_config()).await;
        let err = scheduler
            .create_task(TaskSpec::new("ghost", "analysis", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(scheduler.counts().total, 0);
    }

    #[tokio::test]
    async fn test_backlog_priority_then_fifo() {
        let (scheduler, _, _) = setup(EchoEndpoint::default(), fast_config()).await;
        let n1 = scheduler
            .create_task(TaskSpec::new("a1", "n1", json!({})))
            .await
            .unwrap();
        let low = scheduler
            .create_task(TaskSpec::new("a1", "low", json!({})).priority(TaskPriority::Low))
            .await
            .unwrap();
        let n2 = scheduler
            .create_task(TaskSpec::new("a1", "n2", json!({})))
            .await
            .unwrap();
        let urgent = scheduler
            .create_task(TaskSpec::new("a1", "u", json!({})).priority(TaskPriority::Urgent))
            .await
            .unwrap();
        assert_eq!(scheduler.backlog(), vec![urgent.id, n1.id, n2.id, low.id]);
    }

    #[tokio::test]
    async fn test_one_dispatch_per_tick() {
        let (scheduler, _, _) = setup(EchoEndpoint::default(), fast_config()).await;
        let urgent = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})).priority(TaskPriority::Urgent))
            .await
            .unwrap();
        let normal = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await, 1);
        assert_ne!(scheduler.get(urgent.id).unwrap().status, TaskStatus::Pending);
        assert_eq!(scheduler.get(normal.id).unwrap().status, TaskStatus::Pending);

        let done = scheduler
            .wait_for(urgent.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_agent_does_not_block_others() {
        let (scheduler, registry, _) = setup(EchoEndpoint::default(), fast_config()).await;
        registry.update_status("a1", AgentStatus::Offline).await;
        let blocked = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})).priority(TaskPriority::Urgent))
            .await
            .unwrap();
        let other = scheduler
            .create_task(TaskSpec::new("a2", "analysis", json!({})).priority(TaskPriority::Low))
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(scheduler.get(blocked.id).unwrap().status, TaskStatus::Pending);
        assert_eq!(scheduler.backlog(), vec![blocked.id]);
        scheduler
            .wait_for(other.id, Duration::from_secs(5))
            .await
            .unwrap();

        registry.update_status("a1", AgentStatus::Online).await;
        assert_eq!(scheduler.tick().await, 1);
        let done = scheduler
            .wait_for(blocked.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let (scheduler, _, _) = setup(EchoEndpoint::default(), fast_config()).await;
        let first = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();
        let second = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();

        scheduler.tick().await;
        assert!(!scheduler.cancel_task(first.id));
        assert!(scheduler.cancel_task(second.id));
        assert!(!scheduler.cancel_task(second.id));
        assert!(scheduler.backlog().is_empty());
        assert_eq!(
            scheduler.get(second.id).unwrap().status,
            TaskStatus::Cancelled
        );
        assert!(!scheduler.cancel_task(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let endpoint = EchoEndpoint {
            failures: Mutex::new(2),
            ..EchoEndpoint::default()
        };
        let (scheduler, _, _) = setup(endpoint, fast_config()).await;
        let task = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({"n": 1})))
            .await
            .unwrap();

        for _ in 0..3 {
            scheduler.tick().await;
            // Let the spawned attempt finish before the next tick.
            for _ in 0..50 {
                if scheduler.get(task.id).unwrap().status != TaskStatus::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        let done = scheduler.get(task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retries, 2);
        assert_eq!(done.result, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let endpoint = EchoEndpoint {
            failures: Mutex::new(10),
            ..EchoEndpoint::default()
        };
        let (scheduler, _, _) = setup(endpoint, fast_config()).await;
        let task = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})).max_retries(0))
            .await
            .unwrap();
        scheduler.tick().await;
        let done = scheduler
            .wait_for(task.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("connection refused"));
        assert_eq!(scheduler.counts().failed, 1);
    }

    #[tokio::test]
    async fn test_timeout_watchdog() {
        let endpoint = EchoEndpoint {
            hang: true,
            ..EchoEndpoint::default()
        };
        let (scheduler, _, _) = setup(endpoint, fast_config()).await;
        let task = scheduler
            .create_task(
                TaskSpec::new("a1", "analysis", json!({}))
                    .timeout(Duration::from_secs(1))
                    .max_retries(0),
            )
            .await
            .unwrap();
        scheduler.tick().await;
        let done = scheduler
            .wait_for(task.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_policy_deny_rejects_creation() {
        let (scheduler, _, policies) = setup(EchoEndpoint::default(), fast_config()).await;
        policies.add_policy(
            Policy::new("drain-a1", 1)
                .with_rule(maestro_core::Comparison::new(
                    "id",
                    maestro_core::Operator::Equals,
                    "a1",
                ))
                .with_action(PolicyAction::new(ActionType::Deny).with_param("reason", "draining")),
        );
        let err = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::PolicyDenied { .. }));
        assert!(scheduler
            .create_task(TaskSpec::new("a2", "analysis", json!({})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_policy_throttle_defers_dispatch() {
        let config = CoordinatorConfig {
            max_dispatch_per_tick: 5,
            ..fast_config()
        };
        let (scheduler, _, policies) = setup(EchoEndpoint::default(), config).await;
        policies.add_policy(Policy::new("slow", 1).with_action(
            PolicyAction::new(ActionType::Throttle)
                .with_target("task.dispatch")
                .with_param("delay_ms", 60_000),
        ));
        for _ in 0..3 {
            scheduler
                .create_task(TaskSpec::new("a1", "analysis", json!({})))
                .await
                .unwrap();
        }
        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(scheduler.backlog().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let endpoint = EchoEndpoint {
            hang: true,
            ..EchoEndpoint::default()
        };
        let config = CoordinatorConfig {
            max_dispatch_per_tick: 10,
            ..fast_config()
        };
        let (scheduler, registry, _) = setup(endpoint, config).await;
        registry
            .update("a1", |a| a.config.scaling.max_concurrent_tasks = Some(2))
            .await;
        for _ in 0..4 {
            scheduler
                .create_task(TaskSpec::new("a1", "analysis", json!({})))
                .await
                .unwrap();
        }
        assert_eq!(scheduler.tick().await, 2);
        assert_eq!(scheduler.counts().running, 2);
        assert_eq!(scheduler.counts().pending, 2);
    }

    #[tokio::test]
    async fn test_wait_for_unknown_and_timeout() {
        let (scheduler, registry, _) = setup(EchoEndpoint::default(), fast_config()).await;
        assert!(scheduler
            .wait_for(Uuid::new_v4(), Duration::from_millis(10))
            .await
            .unwrap_err()
            .is_not_found());

        registry.update_status("a1", AgentStatus::Offline).await;
        let task = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();
        let err = scheduler
            .wait_for(task.id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Timeout(_)));
    }

    /// Poll until the task is no longer running.
    async fn settle(scheduler: &TaskScheduler, id: Uuid) -> Task {
        for _ in 0..200 {
            let task = scheduler.get(id).unwrap();
            if task.status != TaskStatus::Running {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.get(id).unwrap()
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let endpoint = EchoEndpoint {
            failures: Mutex::new(1),
            ..EchoEndpoint::default()
        };
        let config = CoordinatorConfig {
            retry_backoff_base_ms: 300,
            ..CoordinatorConfig::default()
        };
        let (scheduler, _, _) = setup(endpoint, config).await;
        let task = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await, 1);
        let failed_once = settle(&scheduler, task.id).await;
        assert_eq!(failed_once.status, TaskStatus::Pending);
        assert_eq!(failed_once.retries, 1);
        assert!(failed_once.not_before.is_some());

        // Still inside the backoff window.
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(scheduler.get(task.id).unwrap().status, TaskStatus::Pending);
        assert_eq!(scheduler.backlog(), vec![task.id]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(scheduler.tick().await, 1);
        let done = scheduler
            .wait_for(task.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.not_before.is_none());
    }

    #[tokio::test]
    async fn test_finished_tasks_are_capped() {
        let config = CoordinatorConfig {
            task_history_limit: 2,
            max_dispatch_per_tick: 10,
            ..fast_config()
        };
        let (scheduler, _, _) = setup(EchoEndpoint::default(), config).await;
        for _ in 0..3 {
            scheduler
                .create_task(TaskSpec::new("a1", "analysis", json!({})))
                .await
                .unwrap();
        }
        let queued = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();
        assert!(scheduler.cancel_task(queued.id));
        // The cancelled task fills one slot; three completions push out two tasks.
        assert_eq!(scheduler.tick().await, 3);
        for _ in 0..200 {
            if scheduler.counts().running == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let counts = scheduler.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.completed, 2);
        assert!(scheduler.get(queued.id).is_none());
        assert_eq!(scheduler.list().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_dispatched_returns_on_start() {
        let endpoint = EchoEndpoint {
            hang: true,
            ..EchoEndpoint::default()
        };
        let (scheduler, _, _) = setup(endpoint, fast_config()).await;
        let task = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();
        let err = scheduler
            .wait_dispatched(task.id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Timeout(_)));

        let ticking = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ticking.tick().await;
        });
        let started = scheduler
            .wait_dispatched(task.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(started.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_deferred_dispatch_keeps_rate_budget() {
        let config = CoordinatorConfig {
            max_dispatch_per_tick: 10,
            ..fast_config()
        };
        let (scheduler, _, policies) = setup(EchoEndpoint::default(), config).await;
        policies.add_policy(Policy::new("slow", 10).with_action(
            PolicyAction::new(ActionType::Throttle)
                .with_target("task.dispatch")
                .with_param("delay_ms", 60_000),
        ));
        policies.add_policy(Policy::new("cap", 1).with_action(
            PolicyAction::new(ActionType::RateLimit)
                .with_target("task.dispatch")
                .with_param("max_per_second", 0.0001)
                .with_param("burst", 2),
        ));
        let first = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();
        let second = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(scheduler.tick().await, 0);
        scheduler
            .wait_for(first.id, Duration::from_secs(5))
            .await
            .unwrap();

        // Throttled ticks did not spend the second burst token.
        policies.remove_policy("slow");
        assert_eq!(scheduler.tick().await, 1);
        let done = scheduler
            .wait_for(second.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_average_duration_tracks_finished() {
        let (scheduler, _, _) = setup(EchoEndpoint::default(), fast_config()).await;
        let task = scheduler
            .create_task(TaskSpec::new("a1", "analysis", json!({})))
            .await
            .unwrap();
        let before = scheduler.revision();
        scheduler.tick().await;
        scheduler
            .wait_for(task.id, Duration::from_secs(5))
            .await
            .unwrap();
        let counts = scheduler.counts();
        assert_eq!(counts.completed, 1);
        assert!(counts.avg_duration_ms >= 0.0);
        assert!(scheduler.revision() > before);
    }
}
