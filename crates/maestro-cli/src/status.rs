//! Read-only HTTP status surface over a running coordinator.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use maestro_coordinator::{
    Agent, Coordinator, MetricsSink, MetricsSnapshot, PrometheusSink, Task, WorkflowExecution,
};
use maestro_core::MaestroError;
use std::sync::Arc;
use uuid::Uuid;

/// Shared handler state.
pub struct StatusState {
    pub coordinator: Arc<Coordinator>,
    pub prometheus: Arc<PrometheusSink>,
}

/// Error body returned by the JSON routes.
struct ApiError(MaestroError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

pub struct StatusServer;

impl StatusServer {
    pub fn build(coordinator: Arc<Coordinator>, prometheus: Arc<PrometheusSink>) -> Router {
        let state = Arc::new(StatusState {
            coordinator,
            prometheus,
        });
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(prometheus_handler))
            .route("/api/metrics", get(metrics_handler))
            .route("/api/agents", get(agents_handler))
            .route("/api/tasks/{id}", get(task_handler))
            .route("/api/workflows/{id}/execution", get(execution_handler))
            .with_state(state)
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "maestro"}))
}

async fn prometheus_handler(State(state): State<Arc<StatusState>>) -> Response {
    let snapshot = state.coordinator.metrics().await;
    state.prometheus.publish(&snapshot);
    match state.prometheus.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<StatusState>>) -> Json<MetricsSnapshot> {
    Json(state.coordinator.metrics().await)
}

async fn agents_handler(State(state): State<Arc<StatusState>>) -> Json<Vec<Agent>> {
    Json(state.coordinator.registry().list().await)
}

async fn task_handler(
    State(state): State<Arc<StatusState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    state
        .coordinator
        .task(id)
        .map(Json)
        .ok_or_else(|| ApiError(MaestroError::TaskNotFound(id.to_string())))
}

async fn execution_handler(
    State(state): State<Arc<StatusState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    state
        .coordinator
        .workflows()
        .current_execution(&id)
        .await
        .map(Json)
        .ok_or(ApiError(MaestroError::WorkflowNotFound(id)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use maestro_coordinator::{
        AgentType, CoordinatorConfig, HttpAgentEndpoint, StepKind, TaskSpec, Workflow,
        WorkflowStep,
    };
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn start_test_server() -> (String, Arc<Coordinator>) {
        let config = CoordinatorConfig {
            bootstrap_agents: false,
            ..CoordinatorConfig::default()
        };
        let coordinator =
            Arc::new(Coordinator::new(config, Arc::new(HttpAgentEndpoint::new())).unwrap());
        let prometheus = Arc::new(PrometheusSink::new().unwrap());
        let app = StatusServer::build(coordinator.clone(), prometheus);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://127.0.0.1:{}", addr.port()), coordinator)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (base, _) = start_test_server().await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "maestro");
    }

    #[tokio::test]
    async fn test_agents_and_metrics() {
        let (base, coordinator) = start_test_server().await;
        coordinator
            .register_agent(maestro_coordinator::Agent::new(
                "analytics",
                "Analytics",
                AgentType::Analytics,
            ))
            .await;

        let agents: Value = reqwest::get(format!("{base}/api/agents"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(agents[0]["id"], "analytics");
        assert_eq!(agents[0]["type"], "analytics");

        let metrics: Value = reqwest::get(format!("{base}/api/metrics"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["agents"]["total"], 1);
        assert_eq!(metrics["agents"]["active"], 1);
    }

    #[tokio::test]
    async fn test_prometheus_text() {
        let (base, coordinator) = start_test_server().await;
        coordinator
            .register_agent(maestro_coordinator::Agent::new("a1", "A1", AgentType::Analytics))
            .await;
        let response = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(response.status(), 200);
        let text = response.text().await.unwrap();
        assert!(text.contains("maestro_agents{status=\"online\"} 1"));
        assert!(text.contains("maestro_task_avg_duration_ms"));
    }

    #[tokio::test]
    async fn test_task_lookup() {
        let (base, coordinator) = start_test_server().await;
        coordinator
            .register_agent(maestro_coordinator::Agent::new("a1", "A1", AgentType::Analytics))
            .await;
        let task = coordinator
            .create_task(TaskSpec::new("a1", "report", json!({"course": "c-9"})))
            .await
            .unwrap();

        let body: Value = reqwest::get(format!("{base}/api/tasks/{}", task.id))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "pending");
        assert_eq!(body["payload"]["course"], "c-9");

        let missing = reqwest::get(format!("{base}/api/tasks/{}", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_workflow_execution_lookup() {
        let (base, coordinator) = start_test_server().await;
        let workflow = Workflow::new("w1", "W1")
            .with_step(WorkflowStep::new("pause", StepKind::Delay { duration_ms: 1 }));
        coordinator.define_workflow(workflow).await.unwrap();
        coordinator.execute_workflow("w1", Value::Null).await.unwrap();

        let body: Value = reqwest::get(format!("{base}/api/workflows/w1/execution"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["workflow_id"], "w1");
        assert_eq!(body["status"], "completed");

        let missing = reqwest::get(format!("{base}/api/workflows/nope/execution"))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        let body: Value = missing.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }
}
