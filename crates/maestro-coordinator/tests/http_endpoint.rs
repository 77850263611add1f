//! HTTP agent endpoint against mock agent servers.

#![allow(clippy::unwrap_used)]

use maestro_coordinator::*;
use maestro_core::MaestroError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn agent_at(server: &MockServer) -> Agent {
    Agent::new("analytics", "Analytics", AgentType::Analytics).with_address(server.uri())
}

#[tokio::test]
async fn probe_reads_reported_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "metrics": {"requestsPerSecond": 14, "queueDepth": 2}
        })))
        .mount(&server)
        .await;

    let report = HttpAgentEndpoint::new()
        .probe(&agent_at(&server))
        .await
        .unwrap();
    assert_eq!(report.metrics["requestsPerSecond"], 14);
    assert_eq!(report.metrics["queueDepth"], 2);
}

#[tokio::test]
async fn probe_accepts_empty_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut agent = agent_at(&server);
    agent.config.health.path = "/healthz".into();
    let report = HttpAgentEndpoint::new().probe(&agent).await.unwrap();
    assert!(report.metrics.is_empty());
}

#[tokio::test]
async fn probe_non_success_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = HttpAgentEndpoint::new()
        .probe(&agent_at(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::Endpoint(_)));
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn execute_posts_task_and_unwraps_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tasks"))
        .and(body_partial_json(json!({
            "type": "grade_prediction",
            "payload": {"student": "s-7"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": {"predicted_grade": 78}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let task = Task::new(
        "analytics",
        "grade_prediction",
        json!({"student": "s-7"}),
        TaskPriority::High,
    );
    let result = HttpAgentEndpoint::new()
        .execute(&agent_at(&server), &TaskRequest::from(&task))
        .await
        .unwrap();
    assert_eq!(result, json!({"predicted_grade": 78}));
}

#[tokio::test]
async fn execute_reports_agent_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "model quota exceeded"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/tasks"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let task = Task::new("analytics", "report", json!({}), TaskPriority::Normal);
    let request = TaskRequest::from(&task);
    let agent = agent_at(&server);

    let err = HttpAgentEndpoint::new()
        .with_tasks_path("/jobs")
        .execute(&agent, &request)
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::Execution(ref m) if m == "model quota exceeded"));

    let err = HttpAgentEndpoint::new()
        .execute(&agent, &request)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("500"));
    assert!(message.contains("boom"));
}

#[tokio::test]
async fn health_monitor_times_out_slow_agents() {
    let slow = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&slow)
        .await;
    let fast = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&fast)
        .await;

    let registry = Arc::new(AgentRegistry::new());
    registry
        .register(Agent::new("slow", "Slow", AgentType::Analytics).with_address(slow.uri()))
        .await;
    registry
        .register(
            Agent::new("fast", "Fast", AgentType::Recommendation)
                .with_address(fast.uri())
                .with_status(AgentStatus::Error),
        )
        .await;

    let monitor = HealthMonitor::new(
        registry.clone(),
        Arc::new(HttpAgentEndpoint::new()),
        Arc::new(PolicyEngine::new()),
        Duration::from_millis(200),
        10,
    );
    let report = monitor.check_all().await;
    assert_eq!(report.recovered, vec!["fast"]);
    assert_eq!(report.degraded, vec!["slow"]);
    assert_eq!(
        registry.get("slow").await.unwrap().health.status,
        HealthStatus::Unhealthy
    );
}

#[tokio::test]
async fn coordinator_dispatches_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "done"})))
        .mount(&server)
        .await;

    let config = CoordinatorConfig {
        dispatch_interval_ms: 10,
        health_interval_secs: 3600,
        bootstrap_agents: false,
        ..CoordinatorConfig::default()
    };
    let coordinator =
        Arc::new(Coordinator::new(config, Arc::new(HttpAgentEndpoint::new())).unwrap());
    let mut agent = agent_at(&server);
    agent.config.health.enabled = false;
    coordinator.register_agent(agent).await;
    let handle = coordinator.start();

    let task = coordinator
        .create_task(TaskSpec::new("analytics", "report", json!({"course": "c-1"})))
        .await
        .unwrap();
    let task = coordinator
        .scheduler()
        .wait_for(task.id, Duration::from_secs(5))
        .await
        .unwrap();
    handle.shutdown();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!("done")));
}
