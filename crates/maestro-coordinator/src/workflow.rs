//! Workflow definitions and the engine that runs them.
//!
//! A workflow is an ordered list of steps. Steps run in list order; a step
//! whose prerequisites did not all complete is skipped. A prerequisite that
//! is a `condition` step evaluating to false also counts as unmet, which is
//! how workflows branch.

use crate::config::CoordinatorConfig;
use crate::metrics::WorkflowCounts;
use crate::registry::AgentRegistry;
use crate::scheduler::{TaskScheduler, TaskSpec};
use crate::steps::{self, TransformOp, ValidationRule};
use crate::triggers::{self, ScheduledRun};
use crate::types::{TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use maestro_core::{Comparison, MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a workflow definition may be executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// May be executed.
    #[default]
    Active,
    /// Rejects execute calls and schedule triggers.
    Inactive,
}

/// What starts a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowTrigger {
    /// Started by an explicit execute call.
    Manual,
    /// Started on a 7-field cron schedule with a fixed input.
    Schedule {
        /// 7-field cron expression.
        cron: String,
        /// Input passed to every scheduled run.
        #[serde(default)]
        input: Value,
    },
}

/// The work a step performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Create a task for an agent and wait for its outcome.
    AgentTask {
        /// Agent that runs the task; must be online when the step starts.
        agent_id: String,
        /// Operation name passed to the agent.
        task_type: String,
        /// Merged over the data bag to form the task payload.
        #[serde(default)]
        parameters: Map<String, Value>,
        /// Backlog priority of the task.
        #[serde(default)]
        priority: TaskPriority,
        /// Bounds the wait for dispatch and, separately, the agent call.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Conjunction of comparisons against the data bag.
    Condition {
        /// All must hold for the result to be true.
        conditions: Vec<Comparison>,
    },
    /// Pause the walk.
    Delay {
        /// Pause length in milliseconds.
        duration_ms: u64,
    },
    /// Convert one value of the data bag.
    Transform {
        /// Dotted path into the data bag.
        field: String,
        /// Conversion to apply.
        operation: TransformOp,
    },
    /// Check one value of the data bag; fails the step when a rule does not hold.
    Validate {
        /// Dotted path into the data bag.
        field: String,
        /// Rules checked in order.
        rules: Vec<ValidationRule>,
    },
}

/// One node of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow; the step's result is stored under it.
    pub id: String,
    /// What the step does.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Steps that must have completed before this one runs.
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
    /// Re-attempts after the first failure.
    #[serde(default)]
    pub retries: u32,
}

impl WorkflowStep {
    /// Step with no prerequisites and no retries.
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            retries: 0,
        }
    }

    /// Add a prerequisite step.
    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Set how many failed attempts are re-run.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// A named, reusable step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free text for operators.
    #[serde(default)]
    pub description: String,
    /// Steps, run in list order.
    pub steps: Vec<WorkflowStep>,
    /// What starts the workflow besides execute calls.
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
    /// Whether the workflow may run.
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    /// Active workflow with no steps or triggers.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            triggers: Vec::new(),
            status: WorkflowStatus::Active,
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a trigger.
    pub fn with_trigger(mut self, trigger: WorkflowTrigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Reject duplicate step ids, unknown or forward dependencies and bad cron expressions.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.id.trim().is_empty() {
            return Err(MaestroError::Validation("workflow id must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(MaestroError::Validation(format!(
                        "step '{}' depends on '{dep}', which is not an earlier step",
                        step.id
                    )));
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(MaestroError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        for trigger in &self.triggers {
            if let WorkflowTrigger::Schedule { cron, .. } = trigger {
                triggers::parse_cron(cron)?;
            }
        }
        Ok(())
    }
}

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Walking its steps, or not yet started.
    Running,
    /// Every step completed or was skipped.
    Completed,
    /// A step failed after its retries.
    Failed,
}

/// Outcome of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// In progress.
    Running,
    /// Finished; the result is in the data bag.
    Completed,
    /// Failed after its retries.
    Failed,
    /// A prerequisite did not complete or was a false condition.
    Skipped,
}

/// Record of one step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Step this record belongs to.
    pub step_id: String,
    /// Outcome so far.
    pub status: StepStatus,
    /// When the first attempt began.
    pub started_at: DateTime<Utc>,
    /// When the step finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time across all attempts, backoff included.
    pub duration_ms: Option<u64>,
    /// Attempts made.
    pub attempts: u32,
    /// Result of a completed step.
    pub result: Option<Value>,
    /// Error of the last failed attempt.
    pub error: Option<String>,
}

impl ExecutionStep {
    fn start(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            attempts: 0,
            result: None,
            error: None,
        }
    }

    fn skipped(step_id: &str) -> Self {
        let now = Utc::now();
        Self {
            status: StepStatus::Skipped,
            completed_at: Some(now),
            duration_ms: Some(0),
            ..Self::start(step_id)
        }
    }

    fn finish(&mut self, status: StepStatus, began: Instant) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(began.elapsed().as_millis() as u64);
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique identifier.
    pub id: Uuid,
    /// Workflow this is a run of.
    pub workflow_id: String,
    /// Lifecycle status.
    pub status: ExecutionStatus,
    /// Step currently executing, or the first step before the run starts.
    pub current_step: Option<String>,
    /// Input merged with each completed step's result under the step id.
    pub data: Map<String, Value>,
    /// Step records in the order the steps ran.
    pub steps: Vec<ExecutionStep>,
    /// `None` until the execution is claimed by an execute call.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the run failed.
    pub error: Option<String>,
}

impl WorkflowExecution {
    fn new(workflow: &Workflow) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            status: ExecutionStatus::Running,
            current_step: workflow.steps.first().map(|s| s.id.clone()),
            data: Map::new(),
            steps: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    fn record(&self, step_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// First prerequisite of `step` that did not complete, or that is a false condition.
    fn unmet_dependency<'a>(&self, workflow: &Workflow, step: &'a WorkflowStep) -> Option<&'a str> {
        let is_condition = |id: &str| {
            workflow
                .steps
                .iter()
                .any(|s| s.id == id && matches!(s.kind, StepKind::Condition { .. }))
        };
        step.depends_on
            .iter()
            .find(|dep| match self.record(dep.as_str()) {
                Some(record) if record.status == StepStatus::Completed => {
                    is_condition(dep.as_str())
                        && record
                            .result
                            .as_ref()
                            .is_some_and(steps::is_false_condition)
                }
                _ => true,
            })
            .map(String::as_str)
    }
}

/// Stores workflow definitions and runs executions.
///
/// Executions are kept per workflow, oldest first. Each workflow has at most
/// one unstarted execution, and only the newest `execution_history_limit`
/// finished ones are retained.
pub struct WorkflowEngine {
    registry: Arc<AgentRegistry>,
    scheduler: Arc<TaskScheduler>,
    config: CoordinatorConfig,
    workflows: RwLock<HashMap<String, Workflow>>,
    executions: RwLock<HashMap<String, VecDeque<WorkflowExecution>>>,
}

impl WorkflowEngine {
    /// Engine sharing the scheduler's settings for retries and history.
    pub fn new(registry: Arc<AgentRegistry>, scheduler: Arc<TaskScheduler>) -> Self {
        let config = scheduler.config().clone();
        Self {
            registry,
            scheduler,
            config,
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
        }
    }

    /// Store a workflow (replacing any with the same id) along with a fresh,
    /// not yet started execution. A previous unstarted execution of the same
    /// workflow is discarded.
    pub async fn define(&self, workflow: Workflow) -> MaestroResult<WorkflowExecution> {
        workflow.validate()?;
        let execution = WorkflowExecution::new(&workflow);
        info!(
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            execution_id = %execution.id,
            "Workflow defined"
        );
        {
            let mut executions = self.executions.write().await;
            let history = executions.entry(workflow.id.clone()).or_default();
            history.retain(|e| e.started_at.is_some());
            history.push_back(execution.clone());
        }
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow);
        Ok(execution)
    }

    /// Definition of a workflow.
    pub async fn get(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(id).cloned()
    }

    /// All workflows, ordered by id.
    pub async fn list(&self) -> Vec<Workflow> {
        let mut list: Vec<Workflow> = self.workflows.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Activate or deactivate a workflow. Running executions are unaffected.
    pub async fn set_status(&self, id: &str, status: WorkflowStatus) -> MaestroResult<()> {
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| MaestroError::WorkflowNotFound(id.to_string()))?;
        workflow.status = status;
        Ok(())
    }

    /// Look up a retained execution by id.
    pub async fn execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.executions
            .read()
            .await
            .values()
            .flatten()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Most recent execution of a workflow.
    pub async fn current_execution(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.executions
            .read()
            .await
            .get(workflow_id)
            .and_then(|history| history.back())
            .cloned()
    }

    /// Retained executions of a workflow, oldest first.
    pub async fn executions(&self, workflow_id: &str) -> Vec<WorkflowExecution> {
        self.executions
            .read()
            .await
            .get(workflow_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Schedule triggers of every active workflow.
    pub async fn schedules(&self) -> Vec<ScheduledRun> {
        let workflows = self.workflows.read().await;
        let mut runs: Vec<ScheduledRun> = workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Active)
            .flat_map(|w| {
                w.triggers.iter().filter_map(|t| match t {
                    WorkflowTrigger::Schedule { cron, input } => Some(ScheduledRun {
                        workflow_id: w.id.clone(),
                        cron: cron.clone(),
                        input: input.clone(),
                    }),
                    WorkflowTrigger::Manual => None,
                })
            })
            .collect();
        runs.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        runs
    }

    /// Counts over definitions and started executions.
    pub async fn counts(&self) -> WorkflowCounts {
        let mut counts = {
            let workflows = self.workflows.read().await;
            WorkflowCounts {
                total: workflows.len(),
                active: workflows
                    .values()
                    .filter(|w| w.status == WorkflowStatus::Active)
                    .count(),
                ..WorkflowCounts::default()
            }
        };
        let executions = self.executions.read().await;
        for execution in executions.values().flatten().filter(|e| e.started_at.is_some()) {
            counts.executions += 1;
            match execution.status {
                ExecutionStatus::Running => counts.running += 1,
                ExecutionStatus::Completed => counts.completed += 1,
                ExecutionStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Run a workflow to completion or first unrecoverable step failure.
    ///
    /// Errors only for a missing or inactive workflow. Step failures are
    /// reported through the returned execution's status.
    pub async fn execute(&self, workflow_id: &str, input: Value) -> MaestroResult<WorkflowExecution> {
        let workflow = self
            .get(workflow_id)
            .await
            .ok_or_else(|| MaestroError::WorkflowNotFound(workflow_id.to_string()))?;
        if workflow.status != WorkflowStatus::Active {
            return Err(MaestroError::InvalidState(format!(
                "workflow '{workflow_id}' is inactive"
            )));
        }

        let mut execution = self.claim_execution(&workflow).await;
        match input {
            Value::Object(map) => execution.data.extend(map),
            Value::Null => {}
            other => {
                execution.data.insert("input".to_string(), other);
            }
        }
        info!(workflow_id, execution_id = %execution.id, "Workflow execution started");

        for step in &workflow.steps {
            execution.current_step = Some(step.id.clone());

            if let Some(dep) = execution.unmet_dependency(&workflow, step) {
                debug!(
                    execution_id = %execution.id,
                    step_id = %step.id,
                    dependency = dep,
                    "Step skipped"
                );
                execution.steps.push(ExecutionStep::skipped(&step.id));
                self.save(&execution).await;
                continue;
            }

            execution.steps.push(ExecutionStep::start(&step.id));
            self.save(&execution).await;

            let began = Instant::now();
            let mut attempts = 0;
            let outcome = loop {
                attempts += 1;
                match self.run_step(step, &execution.data).await {
                    Err(e) if attempts <= step.retries => {
                        let backoff = self.config.retry_backoff(attempts - 1);
                        warn!(
                            execution_id = %execution.id,
                            step_id = %step.id,
                            attempt = attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Step attempt failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    other => break other,
                }
            };

            let Some(record) = execution.steps.last_mut() else {
                break;
            };
            record.attempts = attempts;
            match outcome {
                Ok(result) => {
                    record.result = Some(result.clone());
                    record.finish(StepStatus::Completed, began);
                    execution.data.insert(step.id.clone(), result);
                    info!(execution_id = %execution.id, step_id = %step.id, "Step completed");
                }
                Err(err) => {
                    record.error = Some(err.to_string());
                    record.finish(StepStatus::Failed, began);
                    warn!(execution_id = %execution.id, step_id = %step.id, error = %err, "Step failed");
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some(format!("step '{}' failed: {err}", step.id));
                    execution.completed_at = Some(Utc::now());
                    self.save(&execution).await;
                    return Ok(execution);
                }
            }
            self.save(&execution).await;
        }

        execution.status = ExecutionStatus::Completed;
        execution.current_step = None;
        execution.completed_at = Some(Utc::now());
        info!(workflow_id, execution_id = %execution.id, "Workflow execution completed");
        self.save(&execution).await;
        Ok(execution)
    }

    /// Take the untouched execution created by `define`, or start a new one.
    async fn claim_execution(&self, workflow: &Workflow) -> WorkflowExecution {
        let mut executions = self.executions.write().await;
        let history = executions.entry(workflow.id.clone()).or_default();
        let now = Some(Utc::now());
        if let Some(existing) = history.iter_mut().find(|e| e.started_at.is_none()) {
            existing.started_at = now;
            return existing.clone();
        }
        let mut execution = WorkflowExecution::new(workflow);
        execution.started_at = now;
        history.push_back(execution.clone());
        execution
    }

    async fn save(&self, execution: &WorkflowExecution) {
        let mut executions = self.executions.write().await;
        let Some(history) = executions.get_mut(&execution.workflow_id) else {
            return;
        };
        if let Some(slot) = history.iter_mut().find(|e| e.id == execution.id) {
            *slot = execution.clone();
        }
        if execution.status != ExecutionStatus::Running {
            prune_finished(history, self.config.execution_history_limit);
        }
    }

    async fn run_step(&self, step: &WorkflowStep, data: &Map<String, Value>) -> MaestroResult<Value> {
        match &step.kind {
            StepKind::AgentTask {
                agent_id,
                task_type,
                parameters,
                priority,
                timeout_secs,
            } => {
                self.run_agent_task(agent_id, task_type, parameters, *priority, *timeout_secs, data)
                    .await
            }
            StepKind::Condition { conditions } => {
                Ok(steps::evaluate_condition(conditions, &Value::Object(data.clone())))
            }
            StepKind::Delay { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                Ok(json!({ "delayed_ms": duration_ms }))
            }
            StepKind::Transform { field, operation } => {
                steps::apply_transform(field, *operation, &Value::Object(data.clone()))
            }
            StepKind::Validate { field, rules } => {
                steps::validate(field, rules, &Value::Object(data.clone()))
            }
        }
    }

    async fn run_agent_task(
        &self,
        agent_id: &str,
        task_type: &str,
        parameters: &Map<String, Value>,
        priority: TaskPriority,
        timeout_secs: Option<u64>,
        data: &Map<String, Value>,
    ) -> MaestroResult<Value> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| MaestroError::AgentNotFound(agent_id.to_string()))?;
        if !agent.is_available() {
            return Err(MaestroError::AgentUnavailable(format!(
                "{agent_id} is {}",
                agent.status
            )));
        }

        let mut payload = data.clone();
        payload.extend(parameters.clone());

        // Step retries replace task-level retries.
        let mut spec = TaskSpec::new(agent_id, task_type, Value::Object(payload))
            .priority(priority)
            .max_retries(0);
        if let Some(secs) = timeout_secs {
            spec = spec.timeout(Duration::from_secs(secs));
        }
        let task = self.scheduler.create_task(spec).await?;

        // The step timeout bounds the time in the backlog. Once dispatched,
        // the scheduler's watchdog bounds the agent call with the same budget.
        if let Err(err) = self.scheduler.wait_dispatched(task.id, task.timeout()).await {
            if self.scheduler.cancel_task(task.id) {
                return Err(err);
            }
            debug!(task_id = %task.id, "Task dispatched as its queue wait expired");
        }
        let task = self.scheduler.wait_terminal(task.id).await?;
        match task.status {
            TaskStatus::Completed => Ok(task.result.unwrap_or(Value::Null)),
            TaskStatus::Cancelled => Err(MaestroError::Execution(format!(
                "task {} was cancelled",
                task.id
            ))),
            _ => Err(MaestroError::Execution(
                task.error.unwrap_or_else(|| format!("task {} failed", task.id)),
            )),
        }
    }
}

/// Drop the oldest finished executions beyond `limit`. Unstarted and running
/// executions are never dropped.
fn prune_finished(history: &mut VecDeque<WorkflowExecution>, limit: usize) {
    let finished = history
        .iter()
        .filter(|e| e.started_at.is_some() && e.status != ExecutionStatus::Running)
        .count();
    let mut excess = finished.saturating_sub(limit);
    history.retain(|e| {
        let droppable = excess > 0 && e.started_at.is_some() && e.status != ExecutionStatus::Running;
        if droppable {
            excess -= 1;
        }
        !droppable
    });
}
