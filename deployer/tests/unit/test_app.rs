//! Command runs against a state file on disk

use std::path::{Path, PathBuf};

use ecs_deployer::app::options::{AppOptions, Command};
use ecs_deployer::app::run::run;
use ecs_deployer::cloud::InMemoryEcs;
use ecs_deployer::deploy::retry::RetryPolicies;
use ecs_deployer::filesys::file::File;
use ecs_deployer::report::Reporter;
use ecs_deployer::storage::settings::Settings;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{scheduled_entry, service_entry, CLUSTER, ENVIRONMENT};

struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    async fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("ecs-deployer-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        Self { dir }
    }

    fn manifest(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    fn state(&self) -> PathBuf {
        self.dir.join("state").join("state.json")
    }

    async fn write_manifest(&self, services: Vec<serde_json::Value>, tasks: Vec<serde_json::Value>) {
        let manifest = json!({
            "environment": ENVIRONMENT,
            "services": services,
            "scheduledTasks": tasks
        });
        File::new(self.manifest()).write_json(&manifest).await.unwrap();
    }

    async fn seed_cluster(&self) {
        InMemoryEcs::with_clusters(&[CLUSTER])
            .save(&File::new(self.state()))
            .await
            .unwrap();
    }

    async fn cloud(&self) -> InMemoryEcs {
        InMemoryEcs::load(&File::new(self.state())).await.unwrap()
    }

    fn options(&self, command: Command) -> AppOptions {
        let mut options = AppOptions::new(command, &Settings::default(), Some(self.state()));
        options.pipeline.operator.retry = RetryPolicies::default().without_delay();
        options
    }

    fn deploy(&self, dry_run: bool) -> AppOptions {
        self.options(Command::Service {
            manifest: self.manifest(),
            dry_run,
        })
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

async fn read(path: &Path) -> String {
    File::new(path).read_string().await.unwrap()
}

#[tokio::test]
async fn test_deploy_persists_state_and_is_idempotent() {
    let workspace = Workspace::new().await;
    workspace.seed_cluster().await;
    workspace
        .write_manifest(
            vec![service_entry("web", "nginx:1", 2, true, false)],
            vec![scheduled_entry("report", "report:1", "rate(1 hour)")],
        )
        .await;

    let code = assert_ok!(run(workspace.deploy(false), Reporter::silent()).await);
    assert_eq!(code, 0);

    let ecs = workspace.cloud().await;
    assert_eq!(ecs.service(CLUSTER, "web-service").await.unwrap().desired_count, 2);
    assert!(ecs.rule("report").await.is_some());

    let code = assert_ok!(run(workspace.deploy(false), Reporter::silent()).await);
    assert_eq!(code, 0);

    let ecs = workspace.cloud().await;
    assert_eq!(ecs.revisions("web").await.len(), 1);
    assert_eq!(ecs.revisions("report").await.len(), 1);
}

#[tokio::test]
async fn test_invalid_manifest_fails_before_touching_state() {
    let workspace = Workspace::new().await;
    workspace
        .write_manifest(
            vec![service_entry("worker", "app:1", 1, false, false)],
            vec![scheduled_entry("worker", "app:1", "rate(5 minutes)")],
        )
        .await;

    let err = assert_err!(run(workspace.deploy(false), Reporter::silent()).await);

    assert!(format!("{:#}", err).contains("Duplicate family name `worker`"));
    assert!(!File::new(workspace.state()).exists().await);
}

#[tokio::test]
async fn test_dry_run_leaves_state_file_alone() {
    let workspace = Workspace::new().await;
    workspace.seed_cluster().await;
    workspace
        .write_manifest(vec![service_entry("web", "nginx:1", 1, false, false)], vec![])
        .await;
    let before = read(&workspace.state()).await;

    let code = assert_ok!(run(workspace.deploy(true), Reporter::silent()).await);

    assert_eq!(code, 0);
    assert_eq!(read(&workspace.state()).await, before);
}

#[tokio::test]
async fn test_forced_delete_command() {
    let workspace = Workspace::new().await;
    workspace.seed_cluster().await;
    workspace
        .write_manifest(
            vec![service_entry("web", "nginx:1", 1, false, false)],
            vec![scheduled_entry("report", "report:1", "rate(1 hour)")],
        )
        .await;
    assert_eq!(run(workspace.deploy(false), Reporter::silent()).await.unwrap(), 0);

    let delete = workspace.options(Command::Delete {
        environment: ENVIRONMENT.to_string(),
        force: true,
    });
    let code = run(delete, Reporter::silent()).await.unwrap();

    assert_eq!(code, 0);
    let ecs = workspace.cloud().await;
    assert!(ecs.service(CLUSTER, "web-service").await.is_none());
    assert!(ecs.rule("report").await.is_none());
}
