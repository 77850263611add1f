//! Rollup counts derived from the registry, scheduler and workflow engine.
//!
//! Snapshots carry no timestamps, so two snapshots taken without an
//! intervening state change compare equal.

use crate::registry::AgentRegistry;
use crate::scheduler::TaskScheduler;
use crate::workflow::WorkflowEngine;
use maestro_core::{MaestroError, MaestroResult};
use prometheus::{Encoder, Gauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Agent tallies by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCounts {
    /// Registered agents.
    pub total: usize,
    /// Agents with status `online`.
    pub active: usize,
    /// Agents with status `offline`.
    pub offline: usize,
    /// Agents with status `error`.
    pub error: usize,
}

/// Task tallies by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Retained tasks.
    pub total: usize,
    /// Tasks waiting in the backlog.
    pub pending: usize,
    /// Tasks with an agent call in flight.
    pub running: usize,
    /// Tasks that completed.
    pub completed: usize,
    /// Tasks that failed terminally.
    pub failed: usize,
    /// Tasks cancelled before dispatch.
    pub cancelled: usize,
    /// Running mean duration of finished tasks in milliseconds.
    pub avg_duration_ms: f64,
}

/// Workflow and execution tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCounts {
    /// Defined workflows.
    pub total: usize,
    /// Workflows whose definition status is `active`.
    pub active: usize,
    /// Started executions.
    pub executions: usize,
    /// Executions still walking their steps.
    pub running: usize,
    /// Executions that completed.
    pub completed: usize,
    /// Executions that failed.
    pub failed: usize,
}

/// Read-only point-in-time view of the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Agent tallies.
    pub agents: AgentCounts,
    /// Task tallies.
    pub tasks: TaskCounts,
    /// Workflow tallies.
    pub workflows: WorkflowCounts,
}

/// Recomputes [`MetricsSnapshot`]s from the live collections. Holds no state of its own.
pub struct MetricsAggregator {
    registry: Arc<AgentRegistry>,
    scheduler: Arc<TaskScheduler>,
    workflows: Arc<WorkflowEngine>,
}

impl MetricsAggregator {
    /// Aggregator over the three live collections.
    pub fn new(
        registry: Arc<AgentRegistry>,
        scheduler: Arc<TaskScheduler>,
        workflows: Arc<WorkflowEngine>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            workflows,
        }
    }

    /// Recompute counts from the live collections.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            agents: self.registry.counts().await,
            tasks: self.scheduler.counts(),
            workflows: self.workflows.counts().await,
        }
    }
}

/// Destination for metrics snapshots.
pub trait MetricsSink: Send + Sync {
    /// Receive a freshly computed snapshot.
    fn publish(&self, snapshot: &MetricsSnapshot);
}

/// Writes each snapshot as a structured debug event.
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn publish(&self, snapshot: &MetricsSnapshot) {
        debug!(
            agents_total = snapshot.agents.total,
            agents_active = snapshot.agents.active,
            tasks_total = snapshot.tasks.total,
            tasks_pending = snapshot.tasks.pending,
            tasks_completed = snapshot.tasks.completed,
            tasks_failed = snapshot.tasks.failed,
            task_avg_duration_ms = snapshot.tasks.avg_duration_ms,
            workflows_total = snapshot.workflows.total,
            executions_running = snapshot.workflows.running,
            executions_failed = snapshot.workflows.failed,
            "Metrics snapshot"
        );
    }
}

/// Mirrors snapshots into Prometheus gauges for pull-based scraping.
pub struct PrometheusSink {
    registry: Registry,
    agents: IntGaugeVec,
    tasks: IntGaugeVec,
    workflows: IntGaugeVec,
    executions: IntGaugeVec,
    task_avg_duration: Gauge,
}

fn prom_err(e: prometheus::Error) -> MaestroError {
    MaestroError::Config(format!("prometheus: {e}"))
}

impl PrometheusSink {
    /// Sink with its own Prometheus registry.
    pub fn new() -> MaestroResult<Self> {
        let registry = Registry::new();
        let agents = IntGaugeVec::new(
            Opts::new("maestro_agents", "Registered agents by status"),
            &["status"],
        )
        .map_err(prom_err)?;
        let tasks = IntGaugeVec::new(
            Opts::new("maestro_tasks", "Tasks by status"),
            &["status"],
        )
        .map_err(prom_err)?;
        let workflows = IntGaugeVec::new(
            Opts::new("maestro_workflows", "Defined workflows by status"),
            &["status"],
        )
        .map_err(prom_err)?;
        let executions = IntGaugeVec::new(
            Opts::new("maestro_workflow_executions", "Workflow executions by status"),
            &["status"],
        )
        .map_err(prom_err)?;
        let task_avg_duration = Gauge::new(
            "maestro_task_avg_duration_ms",
            "Running mean task duration in milliseconds",
        )
        .map_err(prom_err)?;

        registry.register(Box::new(agents.clone())).map_err(prom_err)?;
        registry.register(Box::new(tasks.clone())).map_err(prom_err)?;
        registry.register(Box::new(workflows.clone())).map_err(prom_err)?;
        registry.register(Box::new(executions.clone())).map_err(prom_err)?;
        registry
            .register(Box::new(task_avg_duration.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            agents,
            tasks,
            workflows,
            executions,
            task_avg_duration,
        })
    }

    /// Text exposition of the current gauge values.
    pub fn render(&self) -> MaestroResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| MaestroError::Config(e.to_string()))
    }
}

impl MetricsSink for PrometheusSink {
    fn publish(&self, s: &MetricsSnapshot) {
        let set = |vec: &IntGaugeVec, label: &str, value: usize| {
            vec.with_label_values(&[label]).set(value as i64);
        };
        set(&self.agents, "online", s.agents.active);
        set(&self.agents, "offline", s.agents.offline);
        set(&self.agents, "error", s.agents.error);

        set(&self.tasks, "pending", s.tasks.pending);
        set(&self.tasks, "running", s.tasks.running);
        set(&self.tasks, "completed", s.tasks.completed);
        set(&self.tasks, "failed", s.tasks.failed);
        set(&self.tasks, "cancelled", s.tasks.cancelled);

        set(&self.workflows, "active", s.workflows.active);
        set(
            &self.workflows,
            "inactive",
            s.workflows.total.saturating_sub(s.workflows.active),
        );

        set(&self.executions, "running", s.workflows.running);
        set(&self.executions, "completed", s.workflows.completed);
        set(&self.executions, "failed", s.workflows.failed);

        self.task_avg_duration.set(s.tasks.avg_duration_ms);
    }
}
