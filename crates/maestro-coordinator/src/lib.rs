//! Agent, task and workflow coordination for the learning platform.
//!
//! A single [`Coordinator`] registers heterogeneous worker agents, schedules
//! tasks onto them by priority and availability, runs multi-step workflows,
//! enforces operational policies against live agent health and publishes
//! rollup metrics.
//!
//! # Main types
//!
//! - [`Coordinator`]: Owns the components and runs the dispatch, health and trigger loops.
//! - [`AgentRegistry`]: Agent descriptors with live status and health.
//! - [`TaskScheduler`]: Priority backlog and dispatch to agent endpoints.
//! - [`WorkflowEngine`]: Ordered step execution with dependencies and retries.
//! - [`PolicyEngine`]: Declarative rules with enforcing and signalling actions.
//! - [`HealthMonitor`]: Periodic endpoint probes driving agent status.
//! - [`MetricsAggregator`]: Read-only snapshots for [`MetricsSink`]s.

/// Built-in agent set.
pub mod bootstrap;
/// Coordinator tunables.
pub mod config;
/// Agent endpoint collaborator trait and HTTP implementation.
pub mod endpoint;
/// Coordinator facade and background loops.
pub mod engine;
/// Health probing.
pub mod health;
/// Metrics snapshots and sinks.
pub mod metrics;
/// Policy rules and actions.
pub mod policy;
mod rate_limit;
/// Agent registry.
pub mod registry;
/// Task backlog and dispatch.
pub mod scheduler;
/// Condition, transform and validation step functions.
pub mod steps;
/// Cron schedule triggers for workflows.
pub mod triggers;
/// Agent and task data model.
pub mod types;
/// Workflow definitions and execution.
pub mod workflow;

pub use bootstrap::default_agents;
pub use config::CoordinatorConfig;
pub use endpoint::{AgentEndpoint, HttpAgentEndpoint, ProbeReport, TaskRequest};
pub use engine::{Coordinator, CoordinatorHandle};
pub use health::{HealthMonitor, HealthReport};
pub use metrics::{
    AgentCounts, MetricsAggregator, MetricsSink, MetricsSnapshot, PrometheusSink, TaskCounts,
    TracingMetricsSink, WorkflowCounts,
};
pub use policy::{
    ActionType, Admission, DispatchReservation, Policy, PolicyAction, PolicyEngine, PolicyOutcome,
};
pub use registry::AgentRegistry;
pub use scheduler::{TaskScheduler, TaskSpec};
pub use steps::{TransformOp, ValidationRule};
pub use triggers::{ScheduledRun, TriggerRunner};
pub use types::{
    Agent, AgentSettings, AgentStatus, AgentType, Capability, HealthRecord, HealthStatus, Task,
    TaskPriority, TaskStatus,
};
pub use workflow::{
    ExecutionStatus, ExecutionStep, StepKind, StepStatus, Workflow, WorkflowEngine,
    WorkflowExecution, WorkflowStatus, WorkflowStep, WorkflowTrigger,
};
