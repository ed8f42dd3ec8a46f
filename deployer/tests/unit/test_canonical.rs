//! Container comparison tests

use ecs_deployer::deploy::canonical::{canonicalize, diff, same_spec};
use serde_json::{json, Value};

fn containers(environment: Value) -> Vec<Value> {
    vec![
        json!({
            "name": "web",
            "image": "nginx:1.25",
            "cpu": 256,
            "mountPoints": [],
            "environment": environment,
            "logConfiguration": {"logDriver": "awslogs", "options": {"awslogs-region": "ap-northeast-1"}}
        }),
        json!({"name": "sidecar", "image": "envoy:1", "links": [], "environment": []}),
    ]
}

fn environment() -> Value {
    json!([
        {"name": "ENVIRONMENT", "value": "production"},
        {"name": "CLUSTER_NAME", "value": "main"},
        {"name": "DESIRED_COUNT", "value": "2"},
        {"name": "APP_MODE", "value": "web"}
    ])
}

#[test]
fn test_canonicalize_is_idempotent() {
    let once = canonicalize(&containers(environment()));
    let twice = canonicalize(&once);
    assert_eq!(once, twice);
    assert!(once[1].get("links").is_none());
    assert!(once[1].get("environment").is_none());
}

#[test]
fn test_environment_order_is_ignored() {
    let shuffled = json!([
        {"name": "DESIRED_COUNT", "value": "2"},
        {"name": "APP_MODE", "value": "web"},
        {"name": "CLUSTER_NAME", "value": "main"},
        {"name": "ENVIRONMENT", "value": "production"}
    ]);
    let a = containers(environment());
    let b = containers(shuffled);

    assert!(same_spec(&a, &b));
    assert!(diff(&a, &b).is_empty());
}

#[test]
fn test_any_content_change_is_detected() {
    let origin = containers(environment());
    let changes: Vec<(&str, Value)> = vec![
        ("image", json!("nginx:1.26")),
        ("cpu", json!(512)),
        ("logConfiguration", json!({"logDriver": "awslogs", "options": {"awslogs-region": "us-east-1"}})),
        ("command", json!(["serve"])),
    ];

    for (key, value) in changes {
        let mut desired = origin.clone();
        desired[0][key] = value;
        assert!(!same_spec(&origin, &desired), "change of `{}` went unnoticed", key);
        assert!(!diff(&origin, &desired).is_empty());
    }
}

#[test]
fn test_container_order_matters() {
    let origin = containers(environment());
    let mut reversed = origin.clone();
    reversed.reverse();
    assert!(!same_spec(&origin, &reversed));
}

#[test]
fn test_environment_value_change_is_detected() {
    let origin = containers(environment());
    let mut desired = origin.clone();
    desired[0]["environment"][3]["value"] = json!("worker");

    assert!(!same_spec(&origin, &desired));
    let lines = diff(&origin, &desired);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("~ [0].environment"));
}
