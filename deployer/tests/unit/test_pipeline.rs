//! Deployment pipeline scenarios against the in-memory cloud

use std::sync::Arc;
use std::time::Duration;

use ecs_deployer::cloud::{CloudErrorKind, EcsClient, InMemoryEcs};
use ecs_deployer::deploy::reconcile::MANAGED_DESCRIPTION;
use ecs_deployer::report::Reporter;
use ecs_models::RuleState;
use serde_json::json;

use crate::fixtures::{
    cloud, manager, options, scheduled_entry, service_document, service_entry, state_of, targets,
    task_document, CLUSTER,
};

const READ_ONLY_CALLS: [&str; 6] = [
    "list_clusters",
    "list_services",
    "describe_services",
    "describe_task_definition",
    "list_scheduled_rules",
    "describe_rule",
];

async fn span(ecs: &InMemoryEcs, operation: &str, subject: &str) -> (u64, u64) {
    let calls: Vec<_> = ecs
        .calls_of(operation)
        .await
        .into_iter()
        .filter(|c| c.subject == subject)
        .collect();
    assert!(!calls.is_empty(), "no {} call on `{}`", operation, subject);
    let started = calls.iter().map(|c| c.started).min().unwrap_or_default();
    let finished = calls.iter().map(|c| c.finished).max().unwrap_or_default();
    (started, finished)
}

#[tokio::test]
async fn test_empty_cluster_end_to_end() {
    let ecs = cloud();
    let set = targets(
        vec![
            service_entry("a", "app:1", 2, true, false),
            service_entry("b", "app:1", 3, false, true),
        ],
        vec![],
    );

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 0);
    let a = ecs.service(CLUSTER, "a-service").await.unwrap();
    let b = ecs.service(CLUSTER, "b-service").await.unwrap();
    assert_eq!(a.desired_count, 2);
    assert_eq!(b.desired_count, 3);
    assert!(a.task_definition.ends_with("task-definition/a:1"));

    let (_, a_created) = span(&ecs, "create_service", "a-service").await;
    let (b_started, _) = span(&ecs, "create_service", "b-service").await;
    assert!(a_created < b_started);
    assert!(ecs.calls_of("deregister_task_definition").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_primary_group_is_stable_before_the_rest_deploys() {
    let ecs = Arc::new(InMemoryEcs::with_clusters(&[CLUSTER]).with_latency(Duration::from_millis(2)));
    let set = targets(
        vec![
            service_entry("b", "app:1", 1, false, false),
            service_entry("a", "app:1", 1, true, false),
            service_entry("c", "app:1", 1, false, false),
        ],
        vec![],
    );

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();
    assert!(report.succeeded());

    let (_, a_stable) = span(&ecs, "wait_for_service_stable", "a-service").await;
    for name in ["b-service", "c-service"] {
        let (started, _) = span(&ecs, "update_service", name).await;
        assert!(a_stable < started, "{} was deployed before a-service was stable", name);
    }

    // every check finished before the first deploy call
    let (_, checked) = span(&ecs, "describe_services", "b-service").await;
    let (deploy_started, _) = span(&ecs, "update_service", "a-service").await;
    assert!(checked < deploy_started);
}

#[tokio::test]
async fn test_unchanged_spec_reuses_revision() {
    let ecs = cloud();
    ecs.seed_service(CLUSTER, service_document("web", "nginx:1", 2), 2)
        .await
        .unwrap();
    let set = targets(vec![service_entry("web", "nginx:1", 2, false, false)], vec![]);
    let reporter = Reporter::capture();

    let report = manager(&ecs, &reporter, options()).run(&set).await.unwrap();

    assert!(report.succeeded());
    assert!(ecs.calls_of("register_task_definition").await.is_empty());
    assert!(ecs.calls_of("deregister_task_definition").await.is_empty());
    assert_eq!(ecs.revisions("web").await.len(), 1);
    let web = ecs.service(CLUSTER, "web-service").await.unwrap();
    assert!(web.task_definition.ends_with("task-definition/web:1"));
    assert!(reporter
        .lines()
        .contains(&"  - task definition is same. Did not register.".to_string()));
}

#[tokio::test]
async fn test_changed_spec_deregisters_previous_revision() {
    let ecs = cloud();
    ecs.seed_service(CLUSTER, service_document("web", "nginx:1", 2), 2)
        .await
        .unwrap();
    let set = targets(vec![service_entry("web", "nginx:2", 2, false, false)], vec![]);

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    let revisions = ecs.revisions("web").await;
    assert_eq!(revisions.len(), 2);
    assert!(!revisions[0].active);
    assert!(revisions[1].active);
    let web = ecs.service(CLUSTER, "web-service").await.unwrap();
    assert!(web.task_definition.ends_with("task-definition/web:2"));
    assert_eq!(ecs.calls_of("deregister_task_definition").await.len(), 1);
}

#[tokio::test]
async fn test_failing_target_does_not_stop_the_others() {
    let ecs = cloud();
    ecs.fail("update_service", "b-service", CloudErrorKind::Other, 1)
        .await;
    let set = targets(
        vec![
            service_entry("a", "app:1", 1, false, false),
            service_entry("b", "app:1", 1, false, false),
            service_entry("c", "app:1", 1, false, false),
        ],
        vec![],
    );
    let reporter = Reporter::capture();

    let report = manager(&ecs, &reporter, options()).run(&set).await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].label, "service `b-service`");
    assert!(report.failures[0].reason.contains("injected failure"));

    assert!(ecs.service(CLUSTER, "a-service").await.is_some());
    assert!(ecs.service(CLUSTER, "c-service").await.is_some());
    assert!(ecs.service(CLUSTER, "b-service").await.is_none());
    assert!(state_of(&set, "b-service").await.is_error());

    let lines = reporter.lines();
    assert!(lines
        .iter()
        .any(|l| l.starts_with("x Unexpected error in service `b-service`")));
    assert!(lines.contains(&"x service `b-service` previous process error. skipping.".to_string()));
}

#[tokio::test]
async fn test_register_retries_throttling() {
    let ecs = cloud();
    ecs.fail("register_task_definition", "web", CloudErrorKind::Throttling, 7)
        .await;
    let set = targets(vec![service_entry("web", "nginx:1", 1, false, false)], vec![]);

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(ecs.calls_of("register_task_definition").await.len(), 8);
    assert_eq!(ecs.revisions("web").await.len(), 1);
}

#[tokio::test]
async fn test_register_gives_up_after_retries() {
    let ecs = cloud();
    ecs.fail("register_task_definition", "web", CloudErrorKind::Throttling, 8)
        .await;
    let set = targets(vec![service_entry("web", "nginx:1", 1, false, false)], vec![]);

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(ecs.calls_of("register_task_definition").await.len(), 8);
    assert!(ecs.service(CLUSTER, "web-service").await.is_none());
}

#[tokio::test]
async fn test_wait_timeout_fails_the_service() {
    let ecs = cloud();
    ecs.fail("wait_for_service_stable", "web-service", CloudErrorKind::WaiterTimeout, 4)
        .await;
    let set = targets(vec![service_entry("web", "nginx:1", 1, false, false)], vec![]);

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(ecs.calls_of("wait_for_service_stable").await.len(), 4);
    assert!(report.failures[0]
        .reason
        .contains("service 'web-service' update wait timeout."));
}

#[tokio::test]
async fn test_wait_recovers_within_retries() {
    let ecs = cloud();
    ecs.fail("wait_for_service_stable", "web-service", CloudErrorKind::WaiterTimeout, 3)
        .await;
    let set = targets(vec![service_entry("web", "nginx:1", 1, false, false)], vec![]);

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
}

#[tokio::test]
async fn test_zero_keep_and_stop_before_deploy() {
    let ecs = cloud();
    ecs.seed_service(CLUSTER, service_document("idle", "app:1", 0), 0)
        .await
        .unwrap();
    ecs.seed_service(CLUSTER, service_document("batch", "app:1", 3), 3)
        .await
        .unwrap();
    let set = targets(
        vec![
            service_entry("idle", "app:2", 2, false, false),
            service_entry("batch", "app:2", 3, false, true),
        ],
        vec![],
    );

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();
    assert!(report.succeeded());

    let idle = ecs.service(CLUSTER, "idle-service").await.unwrap();
    assert_eq!(idle.desired_count, 0);
    assert!(idle.task_definition.ends_with("task-definition/idle:2"));

    // stopped with the old revision, restarted with the new one
    let batch = ecs.service(CLUSTER, "batch-service").await.unwrap();
    assert_eq!(batch.desired_count, 3);
    assert!(batch.task_definition.ends_with("task-definition/batch:2"));
    let updates: Vec<_> = ecs
        .calls_of("update_service")
        .await
        .into_iter()
        .filter(|c| c.subject == "batch-service")
        .collect();
    assert_eq!(updates.len(), 2);
    let (_, idle_deployed) = span(&ecs, "wait_for_service_stable", "idle-service").await;
    assert!(updates[0].finished < idle_deployed);
    assert!(updates[1].started > idle_deployed);
}

#[tokio::test]
async fn test_zero_keep_disabled_scales_up() {
    let ecs = cloud();
    ecs.seed_service(CLUSTER, service_document("idle", "app:1", 0), 0)
        .await
        .unwrap();
    let set = targets(vec![service_entry("idle", "app:1", 2, false, false)], vec![]);
    let mut options = options();
    options.operator.service_zero_keep = false;

    let report = manager(&ecs, &Reporter::silent(), options)
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(ecs.service(CLUSTER, "idle-service").await.unwrap().desired_count, 2);
}

fn staging_document(family: &str) -> serde_json::Value {
    let mut document = service_document(family, "app:1", 1);
    document["containerDefinitions"][0]["environment"][0] =
        json!({"name": "ENVIRONMENT", "value": "staging"});
    document
}

async fn seed_unused(ecs: &InMemoryEcs) {
    ecs.seed_service(CLUSTER, service_document("web", "nginx:1", 1), 1)
        .await
        .unwrap();
    ecs.seed_service(CLUSTER, service_document("legacy", "app:1", 1), 1)
        .await
        .unwrap();
    ecs.seed_service(CLUSTER, staging_document("preview"), 1)
        .await
        .unwrap();
    ecs.seed_rule(
        task_document("old-report", "app:1"),
        "rate(1 hour)",
        RuleState::Enabled,
        MANAGED_DESCRIPTION,
    )
    .await
    .unwrap();
    ecs.seed_rule(
        task_document("foreign", "app:1"),
        "rate(1 hour)",
        RuleState::Enabled,
        "created by hand",
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unused_services_and_rules_are_deleted() {
    let ecs = cloud();
    seed_unused(&ecs).await;
    let set = targets(
        vec![service_entry("web", "nginx:1", 1, false, false)],
        vec![scheduled_entry("report", "report:1", "rate(1 hour)")],
    );

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(ecs.service(CLUSTER, "legacy-service").await.is_none());
    assert!(ecs.rule("old-report").await.is_none());
    assert!(ecs.service(CLUSTER, "web-service").await.is_some());
    assert!(ecs.service(CLUSTER, "preview-service").await.is_some());
    assert!(ecs.rule("foreign").await.is_some());
    assert!(ecs.rule("report").await.is_some());
}

#[tokio::test]
async fn test_service_only_manifest_leaves_rules_alone() {
    let ecs = cloud();
    seed_unused(&ecs).await;
    let set = targets(vec![service_entry("web", "nginx:1", 1, false, false)], vec![]);

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(ecs.rule("old-report").await.is_some());
    assert!(ecs.calls_of("list_scheduled_rules").await.is_empty());
    assert!(ecs.calls_of("delete_scheduled_rule").await.is_empty());
    // services are still reconciled
    assert!(ecs.service(CLUSTER, "legacy-service").await.is_none());
}

#[tokio::test]
async fn test_scheduled_only_manifest_leaves_services_alone() {
    let ecs = cloud();
    seed_unused(&ecs).await;
    let set = targets(vec![], vec![scheduled_entry("nightly", "nightly:1", "rate(1 day)")]);

    let report = manager(&ecs, &Reporter::silent(), options())
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    for name in ["web-service", "legacy-service", "preview-service"] {
        assert!(ecs.service(CLUSTER, name).await.is_some(), "{} was deleted", name);
    }
    assert!(ecs.calls_of("list_clusters").await.is_empty());
    assert!(ecs.calls_of("delete_service").await.is_empty());
    // rules are still reconciled
    assert!(ecs.rule("old-report").await.is_none());
    assert!(ecs.rule("nightly").await.is_some());
}

#[tokio::test]
async fn test_unused_services_are_kept_when_deletion_is_off() {
    let ecs = cloud();
    seed_unused(&ecs).await;
    let set = targets(vec![service_entry("web", "nginx:1", 1, false, false)], vec![]);
    let mut options = options();
    options.delete_unused_service = false;

    let report = manager(&ecs, &Reporter::silent(), options)
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(ecs.service(CLUSTER, "legacy-service").await.is_some());
    assert!(ecs.rule("old-report").await.is_some());
    assert!(ecs.calls_of("delete_service").await.is_empty());
}

#[tokio::test]
async fn test_service_update_only() {
    let ecs = cloud();
    ecs.seed_service(CLUSTER, service_document("web", "nginx:1", 1), 1)
        .await
        .unwrap();
    ecs.register_task_definition(&service_document("web", "nginx:2", 1))
        .await
        .unwrap();
    let set = targets(vec![service_entry("web", "nginx:3", 2, false, false)], vec![]);
    let mut options = options();
    options.operator.service_update_only = true;

    let report = manager(&ecs, &Reporter::silent(), options)
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    // only the registration made while seeding
    assert_eq!(ecs.calls_of("register_task_definition").await.len(), 1);
    assert!(ecs.calls_of("list_clusters").await.is_empty());
    let web = ecs.service(CLUSTER, "web-service").await.unwrap();
    assert!(web.task_definition.ends_with("task-definition/web:2"));
    assert_eq!(web.desired_count, 2);
}

#[tokio::test]
async fn test_task_definition_update_only() {
    let ecs = cloud();
    seed_unused(&ecs).await;
    let set = targets(vec![service_entry("web", "nginx:2", 5, false, true)], vec![]);
    let mut options = options();
    options.operator.task_definition_update_only = true;

    let report = manager(&ecs, &Reporter::silent(), options)
        .run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    let revisions = ecs.revisions("web").await;
    assert_eq!(revisions.len(), 2);
    assert!(revisions[0].active);

    let web = ecs.service(CLUSTER, "web-service").await.unwrap();
    assert!(web.task_definition.ends_with("task-definition/web:1"));
    assert_eq!(web.desired_count, 1);
    for operation in ["update_service", "wait_for_service_stable", "delete_service"] {
        assert!(ecs.calls_of(operation).await.is_empty(), "unexpected {}", operation);
    }
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let ecs = cloud();
    seed_unused(&ecs).await;
    let set = targets(
        vec![
            service_entry("web", "nginx:2", 1, false, false),
            service_entry("api", "api:1", 1, true, false),
        ],
        vec![scheduled_entry("report", "report:1", "rate(1 hour)")],
    );
    let reporter = Reporter::capture();

    let report = manager(&ecs, &reporter, options())
        .dry_run(&set)
        .await
        .unwrap();

    assert!(report.succeeded());
    for call in ecs.calls().await {
        assert!(
            READ_ONLY_CALLS.contains(&call.operation),
            "dry run called {}",
            call.operation
        );
    }

    let lines = reporter.lines();
    assert!(lines.contains(&"  would delete service `legacy-service`".to_string()));
    assert!(lines.contains(&"  would delete scheduled task `old-report`".to_string()));
    assert!(lines.contains(&"  Service 'api-service' not Found. will be created.".to_string()));
    assert!(lines.iter().any(|l| l.starts_with("  ~ [0].image")));
    assert!(lines.contains(&"  primary deploy: api-service".to_string()));
}

#[tokio::test]
async fn test_delete_declined() {
    let ecs = cloud();
    seed_unused(&ecs).await;
    let mut offered = Vec::new();

    let report = manager(&ecs, &Reporter::silent(), options())
        .delete("production", false, |candidates: &[String]| {
            offered = candidates.to_vec();
            false
        })
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(offered.len(), 3);
    assert!(offered.contains(&"service `web-service`".to_string()));
    assert!(ecs.calls_of("delete_service").await.is_empty());
    assert!(ecs.calls_of("delete_scheduled_rule").await.is_empty());
}

#[tokio::test]
async fn test_delete_forced() {
    let ecs = cloud();
    seed_unused(&ecs).await;

    let report = manager(&ecs, &Reporter::silent(), options())
        .delete("production", true, |_: &[String]| -> bool { panic!("confirmation requested") })
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(ecs.service(CLUSTER, "web-service").await.is_none());
    assert!(ecs.service(CLUSTER, "legacy-service").await.is_none());
    assert!(ecs.rule("old-report").await.is_none());
    assert!(ecs.service(CLUSTER, "preview-service").await.is_some());
    assert!(ecs.rule("foreign").await.is_some());
}
