//! `maestro.toml` loading.
//!
//! Every section carries serde defaults, so an absent file and a file with
//! only the sections an operator cares about are both valid.

use maestro_coordinator::{Agent, CoordinatorConfig, Policy, Workflow};
use maestro_core::{MaestroError, MaestroResult};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MaestroConfig {
    pub coordinator: CoordinatorConfig,
    pub server: ServerConfig,
    /// Registered after the bootstrap set; same ids replace bootstrap entries.
    pub agents: Vec<Agent>,
    pub policies: Vec<Policy>,
    pub workflows: Vec<Workflow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7400,
            json_logs: false,
        }
    }
}

impl MaestroConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> MaestroResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            MaestroError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::parse(&content).map_err(|e| match e {
            MaestroError::Config(msg) => {
                MaestroError::Config(format!("Failed to parse config '{}': {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> MaestroResult<Self> {
        toml::from_str(content).map_err(|e| MaestroError::Config(e.to_string()))
    }

    /// Everything `maestro check` verifies without starting anything.
    pub fn validate(&self) -> MaestroResult<()> {
        self.coordinator.validate()?;

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(MaestroError::Validation("agent id must not be empty".into()));
            }
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(MaestroError::Validation(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
        }

        let mut policy_names = HashSet::new();
        for policy in &self.policies {
            if !policy_names.insert(policy.name.as_str()) {
                return Err(MaestroError::Validation(format!(
                    "duplicate policy name '{}'",
                    policy.name
                )));
            }
        }

        let mut workflow_ids = HashSet::new();
        for workflow in &self.workflows {
            workflow.validate()?;
            if !workflow_ids.insert(workflow.id.as_str()) {
                return Err(MaestroError::Validation(format!(
                    "duplicate workflow id '{}'",
                    workflow.id
                )));
            }
        }
        Ok(())
    }
}
