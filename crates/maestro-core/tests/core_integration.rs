#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_core::*;
use serde_json::json;

// ---------------------------------------------------------------------------
// 1. Rules evaluated against a serialized agent document
// ---------------------------------------------------------------------------

#[test]
fn rule_matches_agent_health_metrics() {
    let busy = json!({
        "id": "tutor",
        "status": "online",
        "health": {"status": "healthy", "metrics": {"requestsPerSecond": 12}}
    });
    let quiet = json!({
        "id": "tutor",
        "status": "online",
        "health": {"status": "healthy", "metrics": {"requestsPerSecond": 8}}
    });

    let rule = Comparison::new("health.metrics.requestsPerSecond", Operator::GreaterThan, 10);
    assert!(rule.matches(&busy));
    assert!(!rule.matches(&quiet));
}

// ---------------------------------------------------------------------------
// 2. Rules parsed with operator and field aliases
// ---------------------------------------------------------------------------

#[test]
fn comparison_from_declarative_rules() {
    #[derive(serde::Deserialize)]
    struct Doc {
        rules: Vec<Comparison>,
    }

    let doc: Doc = serde_json::from_str(
        r#"{"rules": [
            {"field": "grade", "operator": ">=", "value": 60},
            {"path": "name", "operator": "contains", "value": "Ada"}
        ]}"#,
    )
    .unwrap();
    assert_eq!(doc.rules.len(), 2);
    assert_eq!(doc.rules[0].operator, Operator::GreaterOrEqual);

    let student = json!({"grade": 72, "name": "Ada Lovelace"});
    assert!(doc.rules.iter().all(|r| r.matches(&student)));
}

// ---------------------------------------------------------------------------
// 3. Error conversions
// ---------------------------------------------------------------------------

#[test]
fn json_error_converts() {
    fn parse(s: &str) -> MaestroResult<serde_json::Value> {
        Ok(serde_json::from_str(s)?)
    }
    let err = parse("{not json").unwrap_err();
    assert!(matches!(err, MaestroError::Json(_)));
    assert!(!err.is_not_found());
}
