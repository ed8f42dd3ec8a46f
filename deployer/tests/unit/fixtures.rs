//! Shared builders for the integration tests

use std::sync::Arc;
use std::time::Duration;

use ecs_deployer::cloud::InMemoryEcs;
use ecs_deployer::deploy::pipeline::{DeployManager, Options};
use ecs_deployer::deploy::retry::RetryPolicies;
use ecs_deployer::models::manifest::{DeployManifest, TargetFilter, TargetSet};
use ecs_deployer::models::target::{DeployTarget, RunState};
use ecs_deployer::report::Reporter;
use serde_json::{json, Value};

pub const ENVIRONMENT: &str = "production";
pub const CLUSTER: &str = "main";

/// Task definition carrying the parameter contract in its environment
pub fn document(family: &str, image: &str, count_key: &str, count: u32) -> Value {
    json!({
        "family": family,
        "containerDefinitions": [{
            "name": family,
            "image": image,
            "portMappings": [],
            "environment": [
                {"name": "ENVIRONMENT", "value": ENVIRONMENT},
                {"name": "CLUSTER_NAME", "value": CLUSTER},
                {"name": count_key, "value": count.to_string()}
            ]
        }]
    })
}

pub fn service_document(family: &str, image: &str, count: u32) -> Value {
    document(family, image, "DESIRED_COUNT", count)
}

pub fn task_document(family: &str, image: &str) -> Value {
    document(family, image, "TASK_COUNT", 1)
}

pub fn service_entry(family: &str, image: &str, count: u32, primary: bool, stop: bool) -> Value {
    json!({
        "taskDefinition": service_document(family, image, count),
        "primaryPlacement": primary,
        "stopBeforeDeploy": stop
    })
}

pub fn scheduled_entry(family: &str, image: &str, schedule: &str) -> Value {
    json!({
        "taskDefinition": task_document(family, image),
        "scheduleExpression": schedule
    })
}

pub fn manifest(services: Vec<Value>, scheduled_tasks: Vec<Value>) -> DeployManifest {
    serde_json::from_value(json!({
        "environment": ENVIRONMENT,
        "services": services,
        "scheduledTasks": scheduled_tasks
    }))
    .unwrap()
}

pub fn targets(services: Vec<Value>, scheduled_tasks: Vec<Value>) -> TargetSet {
    TargetSet::from_manifest(manifest(services, scheduled_tasks), &TargetFilter::default()).unwrap()
}

/// Pipeline options without any sleeping
pub fn options() -> Options {
    let mut options = Options {
        threads_count: 4,
        ..Default::default()
    };
    options.operator.retry = RetryPolicies::default().without_delay();
    options.operator.service_wait_delay = Duration::ZERO;
    options
}

pub fn cloud() -> Arc<InMemoryEcs> {
    Arc::new(InMemoryEcs::with_clusters(&[CLUSTER]))
}

pub fn manager(ecs: &Arc<InMemoryEcs>, reporter: &Reporter, options: Options) -> DeployManager {
    DeployManager::new(ecs.clone(), reporter.clone(), options)
}

/// Run state of the target with `identity`
pub async fn state_of(set: &TargetSet, identity: &str) -> RunState {
    for shared in set.services.iter().chain(set.scheduled_tasks.iter()) {
        let target = shared.lock().await;
        if target.identity() == identity {
            return target.state().clone();
        }
    }
    panic!("no target named {}", identity);
}

pub async fn target_of(set: &TargetSet, identity: &str) -> DeployTarget {
    for shared in set.services.iter().chain(set.scheduled_tasks.iter()) {
        let target = shared.lock().await;
        if target.identity() == identity {
            return target.clone();
        }
    }
    panic!("no target named {}", identity);
}
