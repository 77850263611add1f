use crate::workflow::WorkflowEngine;
use chrono::{DateTime, Utc};
use cron::Schedule;
use maestro_core::{MaestroError, MaestroResult};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A schedule trigger resolved from a workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRun {
    /// Workflow to execute.
    pub workflow_id: String,
    /// 7-field cron expression.
    pub cron: String,
    /// Input passed to every run.
    pub input: Value,
}

/// Parse a cron expression into a [`cron::Schedule`].
///
/// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
pub fn parse_cron(cron_expr: &str) -> MaestroResult<Schedule> {
    Schedule::from_str(cron_expr)
        .map_err(|e| MaestroError::Config(format!("Invalid cron expression '{cron_expr}': {e}")))
}

/// First fire time of `cron_expr` strictly after `after`.
pub fn next_fire_time(cron_expr: &str, after: DateTime<Utc>) -> MaestroResult<DateTime<Utc>> {
    let schedule = parse_cron(cron_expr)?;
    schedule.after(&after).next().ok_or_else(|| {
        MaestroError::Config(format!(
            "Cron expression '{cron_expr}' has no upcoming fire times"
        ))
    })
}

/// Fires workflow executions from schedule triggers.
///
/// The trigger set is re-read from the engine on every pass, so workflows
/// defined after start-up are picked up. A schedule seen for the first time
/// fires at its next occurrence, never retroactively.
pub struct TriggerRunner {
    workflows: Arc<WorkflowEngine>,
    last_fired: HashMap<(String, String), DateTime<Utc>>,
    max_sleep: Duration,
}

impl TriggerRunner {
    /// Runner over the engine's active workflows.
    pub fn new(workflows: Arc<WorkflowEngine>) -> Self {
        Self {
            workflows,
            last_fired: HashMap::new(),
            max_sleep: Duration::from_secs(60),
        }
    }

    /// Start every run whose next fire time is at or before `now`.
    /// Returns the ids of the workflows started.
    pub async fn fire_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut fired = Vec::new();
        for run in self.workflows.schedules().await {
            let key = (run.workflow_id.clone(), run.cron.clone());
            let last = *self.last_fired.entry(key.clone()).or_insert(now);
            let next = match next_fire_time(&run.cron, last) {
                Ok(next) => next,
                Err(e) => {
                    warn!(workflow_id = %run.workflow_id, error = %e, "Skipping schedule trigger");
                    continue;
                }
            };
            if next > now {
                continue;
            }

            self.last_fired.insert(key, now);
            info!(workflow_id = %run.workflow_id, cron = %run.cron, "Schedule trigger fired");
            let engine = Arc::clone(&self.workflows);
            let workflow_id = run.workflow_id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.execute(&workflow_id, run.input).await {
                    warn!(workflow_id = %workflow_id, error = %e, "Scheduled execution rejected");
                }
            });
            fired.push(run.workflow_id);
        }
        fired
    }

    /// Time until the nearest upcoming fire, capped so new triggers are noticed.
    pub async fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        let nearest = self
            .workflows
            .schedules()
            .await
            .iter()
            .filter_map(|run| {
                let key = (run.workflow_id.clone(), run.cron.clone());
                let last = self.last_fired.get(&key).copied().unwrap_or(now);
                next_fire_time(&run.cron, last).ok()
            })
            .min();
        match nearest {
            Some(at) if at > now => (at - now).to_std().unwrap_or_default().min(self.max_sleep),
            Some(_) => Duration::ZERO,
            None => self.max_sleep,
        }
    }

    /// Run the trigger loop in the background.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.fire_due(Utc::now()).await;
                let wait = self.next_wait(Utc::now()).await;
                tokio::time::sleep(wait.max(Duration::from_millis(200))).await;
            }
        })
    }
}
