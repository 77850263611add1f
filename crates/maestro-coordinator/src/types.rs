use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// Kind of worker an agent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Chat-style tutoring and question answering.
    Conversational,
    /// Grade prediction, performance analysis and reporting.
    Analytics,
    /// Generates quizzes, summaries and course material.
    ContentGeneration,
    /// Recommends resources and learning paths.
    Recommendation,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Conversational => write!(f, "conversational"),
            AgentType::Analytics => write!(f, "analytics"),
            AgentType::ContentGeneration => write!(f, "content_generation"),
            AgentType::Recommendation => write!(f, "recommendation"),
        }
    }
}

/// Operational status of an agent.
///
/// Only health probes and explicit status updates change it; task outcomes never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Accepts tasks.
    Online,
    /// Taken out of service.
    Offline,
    /// Failing health probes.
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Performance summary reported for a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSummary {
    /// Mean latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Fraction of calls that succeeded.
    pub success_rate: f64,
    /// Calls per second.
    pub throughput: f64,
    /// Fraction of calls that failed.
    pub error_rate: f64,
}

/// A named, versioned capability an agent offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability name, unique per agent.
    pub name: String,
    /// Semantic version of the capability.
    #[serde(default = "default_version")]
    pub version: String,
    /// Reported performance.
    #[serde(default)]
    pub performance: PerformanceSummary,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Capability {
    /// Version `1.0.0` capability with empty performance figures.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            performance: PerformanceSummary::default(),
        }
    }
}

/// Result of the most recent health probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not probed yet.
    #[default]
    Unknown,
    /// Last probe succeeded.
    Healthy,
    /// Last probe failed.
    Unhealthy,
}

/// A timestamped probe failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// What went wrong.
    pub message: String,
}

/// Live health record maintained by the health monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthRecord {
    /// Outcome of the last probe.
    pub status: HealthStatus,
    /// Time of the last probe.
    pub last_check: Option<DateTime<Utc>>,
    /// Latency of the last successful probe.
    pub response_time_ms: Option<u64>,
    /// Seconds accumulated between consecutive healthy probes.
    pub uptime_secs: u64,
    /// Recent probe failures, oldest first. Cleared on a successful probe.
    pub errors: Vec<HealthEvent>,
    /// Free-form metrics reported by the agent's health endpoint.
    pub metrics: Map<String, Value>,
}

/// Discovery settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Free-form labels for lookup.
    pub tags: Vec<String>,
}

/// Per-agent health probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Probe this agent at all.
    pub enabled: bool,
    /// Path appended to the agent address for the probe.
    pub path: String,
    /// Overrides the coordinator-wide probe timeout.
    pub timeout_secs: Option<u64>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
            timeout_secs: None,
        }
    }
}

/// Capacity settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSettings {
    /// Maximum tasks running on this agent at once. `None` means unbounded.
    pub max_concurrent_tasks: Option<usize>,
}

/// Policy settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Skip enforcing actions (`deny`, `rate_limit`, `throttle`) for this agent.
    /// `log` and `alert` still fire.
    pub exempt: bool,
}

/// Configuration block carried by every agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Lookup labels.
    pub discovery: DiscoverySettings,
    /// Probe settings.
    pub health: HealthSettings,
    /// Capacity limits.
    pub scaling: ScalingSettings,
    /// Policy enforcement settings.
    pub policy: PolicySettings,
}

/// Free-form agent metadata. `address` is the endpoint base URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Base URL of the agent endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Any other metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Kind of worker.
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Capabilities offered.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Operational status.
    #[serde(default = "default_status")]
    pub status: AgentStatus,
    /// Live health record.
    #[serde(default)]
    pub health: HealthRecord,
    /// Per-agent settings.
    #[serde(default)]
    pub config: AgentSettings,
    /// Address and free-form metadata.
    #[serde(default)]
    pub metadata: AgentMetadata,
    /// Registration time.
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

fn default_status() -> AgentStatus {
    AgentStatus::Online
}

impl Agent {
    /// Online agent with default settings and no address.
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type,
            capabilities: Vec::new(),
            status: AgentStatus::Online,
            health: HealthRecord::default(),
            config: AgentSettings::default(),
            metadata: AgentMetadata::default(),
            registered_at: Utc::now(),
        }
    }

    /// Set the endpoint base URL.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.metadata.address = Some(address.into());
        self
    }

    /// Add a capability unless one with the same name exists.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.has_capability(&capability.name) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether a capability named `name` is offered.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    /// Whether the agent accepts tasks (status `online`).
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Online
    }

    /// JSON view used for policy rule evaluation.
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Task priority. Declaration order is ascending urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Ahead of everything else.
    Urgent,
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the backlog.
    Pending,
    /// Agent call in flight.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Withdrawn before dispatch.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Default task timeout budget.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One unit of work bound to a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Agent the task is bound to.
    pub agent_id: String,
    /// Operation name passed to the agent.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Backlog position relative to other tasks.
    pub priority: TaskPriority,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Input passed to the agent.
    pub payload: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time a terminal status was reached.
    pub completed_at: Option<DateTime<Utc>>,
    /// Bound on a single dispatched attempt.
    pub timeout_ms: u64,
    /// Failed attempts that were retried.
    pub retries: u32,
    /// Failed attempts that may be retried.
    pub max_retries: u32,
    /// Result of a completed task.
    pub result: Option<Value>,
    /// Last error, kept across retries.
    pub error: Option<String>,
    /// Earliest instant the task may be dispatched again after a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl Task {
    /// Pending task with the default timeout and retry count.
    pub fn new(
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: Value,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            priority,
            status: TaskStatus::Pending,
            payload,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_ms: DEFAULT_TASK_TIMEOUT.as_millis() as u64,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            result: None,
            error: None,
            not_before: None,
        }
    }

    /// Set the per-attempt timeout, at least one millisecond.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Set how many failed attempts are retried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether the task reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a failed attempt may be retried.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Transition into `running`. `started_at` is only set on the first attempt.
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.not_before = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Finish with a result.
    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.finish();
    }

    /// Finish with an error.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.finish();
    }

    /// Cancel a pending task. Returns `false` in any other state.
    pub fn cancel(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.finish();
        true
    }

    /// Put a failed attempt back into `pending`, eligible again at `not_before`.
    pub fn requeue_for_retry(&mut self, error: impl Into<String>, not_before: DateTime<Utc>) {
        self.retries += 1;
        self.status = TaskStatus::Pending;
        self.error = Some(error.into());
        self.not_before = Some(not_before);
    }

    fn finish(&mut self) {
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}
