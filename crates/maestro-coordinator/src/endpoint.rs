use crate::types::{Agent, Task};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Outcome of a successful health probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    /// Round-trip time of the probe request.
    pub response_time: Duration,
    /// Metrics the agent reported alongside its health, if any.
    pub metrics: Map<String, Value>,
}

/// Body sent to an agent to execute a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Identifier of the task being executed.
    pub task_id: Uuid,
    /// Operation the agent should perform.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Task input, already merged with workflow data where applicable.
    pub payload: Value,
}

impl From<&Task> for TaskRequest {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
        }
    }
}

/// The network-facing side of an agent: a health probe and task execution.
///
/// Callers bound both calls with their own timeouts.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Probe the agent's health. Any error means unhealthy.
    async fn probe(&self, agent: &Agent) -> MaestroResult<ProbeReport>;

    /// Execute a task and return its result payload.
    async fn execute(&self, agent: &Agent, request: &TaskRequest) -> MaestroResult<Value>;
}

/// HTTP implementation: `GET {address}{health.path}` and `POST {address}/tasks`.
pub struct HttpAgentEndpoint {
    http: reqwest::Client,
    tasks_path: String,
}

impl HttpAgentEndpoint {
    /// Client posting tasks to `/tasks`.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            tasks_path: "/tasks".to_string(),
        }
    }

    /// Post tasks to `path` instead of `/tasks`.
    pub fn with_tasks_path(mut self, path: impl Into<String>) -> Self {
        self.tasks_path = path.into();
        self
    }

    fn url(agent: &Agent, path: &str) -> MaestroResult<String> {
        let address = agent.metadata.address.as_deref().ok_or_else(|| {
            MaestroError::Endpoint(format!("agent '{}' has no address", agent.id))
        })?;
        Ok(format!("{}{}", address.trim_end_matches('/'), path))
    }
}

impl Default for HttpAgentEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentEndpoint for HttpAgentEndpoint {
    async fn probe(&self, agent: &Agent) -> MaestroResult<ProbeReport> {
        let url = Self::url(agent, &agent.config.health.path)?;
        let start = Instant::now();
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| MaestroError::Endpoint(e.to_string()))?;
        let response_time = start.elapsed();

        let status = resp.status();
        if !status.is_success() {
            return Err(MaestroError::Endpoint(format!(
                "health probe returned {status}"
            )));
        }

        // Health bodies are optional; only a JSON object with `metrics` is used.
        let metrics = match resp.json::<Value>().await {
            Ok(Value::Object(mut body)) => match body.remove("metrics") {
                Some(Value::Object(metrics)) => metrics,
                _ => Map::new(),
            },
            _ => Map::new(),
        };

        Ok(ProbeReport {
            response_time,
            metrics,
        })
    }

    async fn execute(&self, agent: &Agent, request: &TaskRequest) -> MaestroResult<Value> {
        let url = Self::url(agent, &self.tasks_path)?;
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| MaestroError::Endpoint(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| MaestroError::Endpoint(e.to_string()))?;

        if !status.is_success() {
            return Err(MaestroError::Endpoint(format!(
                "agent '{}' returned {status}: {text}",
                agent.id
            )));
        }

        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(MaestroError::Execution(error.to_string()));
        }

        Ok(match body {
            Value::Object(mut map) if map.contains_key("result") => {
                map.remove("result").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}
