use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the coordinator loops and task defaults.
///
/// Every field has a default, so an empty `[coordinator]` table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the dispatch loop.
    pub dispatch_interval_ms: u64,
    /// Tasks started per dispatch tick.
    pub max_dispatch_per_tick: usize,
    /// Period of the health probe loop.
    pub health_interval_secs: u64,
    /// Default bound on a single health probe.
    pub probe_timeout_secs: u64,
    /// Size of the per-agent recent-error list.
    pub max_health_errors: usize,
    /// Timeout budget of tasks created without one.
    pub default_task_timeout_secs: u64,
    /// Retries of tasks created without an explicit count.
    pub default_max_retries: u32,
    /// Base of the exponential backoff between task and step attempts.
    pub retry_backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub retry_backoff_max_ms: u64,
    /// Finished tasks kept for lookup; the oldest are dropped first.
    pub task_history_limit: usize,
    /// Finished executions kept per workflow; the oldest are dropped first.
    pub execution_history_limit: usize,
    /// Register the built-in agent set at start-up.
    pub bootstrap_agents: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 1000,
            max_dispatch_per_tick: 1,
            health_interval_secs: 30,
            probe_timeout_secs: 5,
            max_health_errors: 10,
            default_task_timeout_secs: 300,
            default_max_retries: 3,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 30_000,
            task_history_limit: 1000,
            execution_history_limit: 50,
            bootstrap_agents: true,
        }
    }
}

impl CoordinatorConfig {
    /// [`Self::dispatch_interval_ms`] as a duration.
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// [`Self::health_interval_secs`] as a duration.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// [`Self::probe_timeout_secs`] as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// [`Self::default_task_timeout_secs`] as a duration.
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    /// Delay before retry number `attempt` (0-based), capped at the maximum.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .retry_backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.retry_backoff_max_ms))
    }

    /// Reject values that would stall or spin the loops.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.dispatch_interval_ms == 0 {
            return Err(MaestroError::Config(
                "dispatch_interval_ms must be greater than zero".into(),
            ));
        }
        if self.health_interval_secs == 0 {
            return Err(MaestroError::Config(
                "health_interval_secs must be greater than zero".into(),
            ));
        }
        if self.max_dispatch_per_tick == 0 {
            return Err(MaestroError::Config(
                "max_dispatch_per_tick must be at least 1".into(),
            ));
        }
        if self.default_task_timeout_secs == 0 {
            return Err(MaestroError::Config(
                "default_task_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.task_history_limit == 0 || self.execution_history_limit == 0 {
            return Err(MaestroError::Config(
                "task_history_limit and execution_history_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
