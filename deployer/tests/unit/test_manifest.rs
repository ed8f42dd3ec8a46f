//! Target-list construction tests

use ecs_deployer::models::manifest::{TargetFilter, TargetSet};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{cloud, manifest, scheduled_entry, service_entry};

#[tokio::test]
async fn test_duplicate_identity_is_rejected_before_any_call() {
    let ecs = cloud();
    let manifest = manifest(
        vec![service_entry("worker", "app:1", 1, false, false)],
        vec![scheduled_entry("worker", "app:1", "rate(5 minutes)")],
    );

    let err = assert_err!(TargetSet::from_manifest(manifest, &TargetFilter::default()));

    assert!(err.is_fatal_config());
    assert!(err.to_string().contains("Duplicate family name `worker`"));
    assert!(ecs.calls().await.is_empty());
}

#[tokio::test]
async fn test_missing_parameter_names_key_and_family() {
    let manifest = serde_json::from_value(json!({
        "environment": "production",
        "services": [{
            "taskDefinition": {
                "family": "web",
                "containerDefinitions": [{
                    "name": "web",
                    "image": "nginx",
                    "environment": [{"name": "ENVIRONMENT", "value": "production"}]
                }]
            }
        }]
    }))
    .unwrap();

    let err = assert_err!(TargetSet::from_manifest(manifest, &TargetFilter::default()));
    let message = err.to_string();
    assert!(err.is_fatal_config());
    assert!(message.contains("CLUSTER_NAME"));
    assert!(message.contains("web"));
}

#[test]
fn test_group_filter_keeps_full_set() {
    let mut entry = service_entry("api", "api:1", 1, false, false);
    entry["taskDefinition"]["containerDefinitions"][0]["environment"]
        .as_array_mut()
        .unwrap()
        .push(json!({"name": "SERVICE_GROUP", "value": "backend"}));
    let manifest = manifest(
        vec![entry, service_entry("web", "web:1", 1, false, false)],
        vec![],
    );
    let filter = TargetFilter {
        service_group: Some("backend".to_string()),
        template_group: None,
    };

    let set = assert_ok!(TargetSet::from_manifest(manifest, &filter));
    assert_eq!(set.services.len(), 2);
    assert_eq!(set.deploy_services.len(), 1);
    assert_eq!(set.deploy_count(), 1);
}

#[test]
fn test_empty_selection_is_rejected() {
    let manifest = manifest(vec![service_entry("web", "web:1", 1, false, false)], vec![]);
    let filter = TargetFilter {
        service_group: Some("nothing".to_string()),
        template_group: None,
    };

    let err = assert_err!(TargetSet::from_manifest(manifest, &filter));
    assert!(err.to_string().contains("Deployment target not found."));
}
