use crate::endpoint::{AgentEndpoint, ProbeReport};
use crate::policy::{PolicyEngine, AGENT_HEALTH};
use crate::registry::AgentRegistry;
use crate::types::{AgentStatus, HealthEvent, HealthStatus};
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Summary of one probe pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Agents probed in this pass.
    pub probed: usize,
    /// Probes that succeeded.
    pub healthy: usize,
    /// Probes that failed or timed out.
    pub unhealthy: usize,
    /// Agents without an address or with probing disabled.
    pub skipped: usize,
    /// Agents promoted from `error` to `online`.
    pub recovered: Vec<String>,
    /// Agents demoted from `online` to `error`.
    pub degraded: Vec<String>,
}

/// Probes agent endpoints and folds the outcomes into the registry.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    endpoint: Arc<dyn AgentEndpoint>,
    policies: Arc<PolicyEngine>,
    probe_timeout: Duration,
    max_errors: usize,
}

impl HealthMonitor {
    /// Monitor bounding each probe by `probe_timeout` unless the agent overrides it.
    pub fn new(
        registry: Arc<AgentRegistry>,
        endpoint: Arc<dyn AgentEndpoint>,
        policies: Arc<PolicyEngine>,
        probe_timeout: Duration,
        max_errors: usize,
    ) -> Self {
        Self {
            registry,
            endpoint,
            policies,
            probe_timeout,
            max_errors: max_errors.max(1),
        }
    }

    /// Probe every eligible agent concurrently. One agent's failure or hang
    /// never affects the others.
    pub async fn check_all(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let mut probes = JoinSet::new();

        for agent in self.registry.list().await {
            if agent.metadata.address.is_none() || !agent.config.health.enabled {
                report.skipped += 1;
                continue;
            }
            let endpoint = Arc::clone(&self.endpoint);
            let timeout = agent
                .config
                .health
                .timeout_secs
                .map_or(self.probe_timeout, Duration::from_secs);
            probes.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, endpoint.probe(&agent)).await {
                    Ok(result) => result,
                    Err(_) => Err(MaestroError::Timeout(timeout)),
                };
                (agent.id, outcome)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (agent_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Health probe task aborted");
                    continue;
                }
            };
            report.probed += 1;
            let healthy = outcome.is_ok();
            if let Some(change) = self.record(&agent_id, outcome).await {
                match change {
                    AgentStatus::Online => report.recovered.push(agent_id),
                    _ => report.degraded.push(agent_id),
                }
            }
            if healthy {
                report.healthy += 1;
            } else {
                report.unhealthy += 1;
            }
        }

        report.recovered.sort();
        report.degraded.sort();
        debug!(
            probed = report.probed,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            skipped = report.skipped,
            "Health pass finished"
        );
        report
    }

    /// Apply one probe outcome. Returns the new status if it changed.
    pub async fn record(
        &self,
        agent_id: &str,
        outcome: MaestroResult<ProbeReport>,
    ) -> Option<AgentStatus> {
        let max_errors = self.max_errors;
        let now = Utc::now();
        let updated = self
            .registry
            .update(agent_id, |agent| {
                let before = agent.status;
                let health = &mut agent.health;
                match &outcome {
                    Ok(probe) => {
                        if health.status == HealthStatus::Healthy {
                            if let Some(last) = health.last_check {
                                let elapsed = (now - last).num_seconds().max(0) as u64;
                                health.uptime_secs += elapsed;
                            }
                        }
                        health.status = HealthStatus::Healthy;
                        health.response_time_ms = Some(probe.response_time.as_millis() as u64);
                        health.errors.clear();
                        health
                            .metrics
                            .extend(probe.metrics.iter().map(|(k, v)| (k.clone(), v.clone())));
                        if agent.status == AgentStatus::Error {
                            agent.status = AgentStatus::Online;
                        }
                    }
                    Err(e) => {
                        health.status = HealthStatus::Unhealthy;
                        health.response_time_ms = None;
                        health.errors.push(HealthEvent {
                            timestamp: now,
                            message: e.to_string(),
                        });
                        let overflow = health.errors.len().saturating_sub(max_errors);
                        health.errors.drain(..overflow);
                        if agent.status == AgentStatus::Online {
                            agent.status = AgentStatus::Error;
                        }
                    }
                }
                agent.health.last_check = Some(now);
                (before, agent.clone())
            })
            .await;

        let (before, agent) = updated?;
        match &outcome {
            Ok(_) => debug!(agent_id, "Health probe succeeded"),
            Err(e) => warn!(agent_id, error = %e, "Health probe failed"),
        }
        self.policies.apply_policies(&agent, AGENT_HEALTH);

        if before == agent.status {
            return None;
        }
        info!(agent_id, from = %before, to = %agent.status, "Agent status changed by health probe");
        Some(agent.status)
    }
}
