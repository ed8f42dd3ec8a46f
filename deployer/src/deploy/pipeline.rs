//! Ordered deployment pipeline
//!
//! Every phase is one or more pool batches and each batch is drained before
//! the next one is submitted:
//!
//! fetch, delete unused, check, stop scheduled tasks, stop before deploy
//! (primary group then the rest, each followed by a stability wait), deploy
//! (same order), restart the stopped groups, deploy scheduled tasks, verify.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cloud::EcsClient;
use crate::deploy::operations::{self, Operator};
use crate::deploy::pool::{Operation, Tracked, Unit, WorkerPool};
use crate::deploy::reconcile::{fetch_observed_state, reconcile, Reconciliation};
use crate::errors::DeployError;
use crate::models::manifest::TargetSet;
use crate::models::snapshot::SharedSnapshot;
use crate::models::target::{DeployTarget, SharedTarget, Status};
use crate::report::Reporter;
use crate::storage::settings::DEFAULT_THREADS_COUNT;

#[derive(Debug, Clone)]
pub struct Options {
    pub threads_count: usize,
    /// When false every service goes to the deploy groups
    pub stop_before_deploy: bool,
    pub delete_unused_service: bool,
    pub template_group: Option<String>,
    pub operator: operations::Options,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threads_count: DEFAULT_THREADS_COUNT,
            stop_before_deploy: true,
            delete_unused_service: true,
            template_group: None,
            operator: operations::Options::default(),
        }
    }
}

/// A target or deleted entity that ended the run in error
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub label: String,
    pub reason: String,
}

/// Outcome of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failures: Vec<Failure>,
}

impl RunReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, label: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(Failure {
            label: label.into(),
            reason: reason.into(),
        });
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

/// Desired services split by `(stopBeforeDeploy, primaryPlacement)`
#[derive(Debug, Default)]
pub struct DeployGroups {
    pub primary_stop_before_deploy: Vec<SharedTarget>,
    pub stop_before_deploy: Vec<SharedTarget>,
    pub primary_deploy: Vec<SharedTarget>,
    pub remain_deploy: Vec<SharedTarget>,
}

impl DeployGroups {
    pub async fn partition(services: &[SharedTarget], honor_stop_before_deploy: bool) -> Self {
        let mut groups = Self::default();
        for shared in services {
            let (stop, primary) = match &*shared.lock().await {
                DeployTarget::Service(s) => {
                    (s.stop_before_deploy && honor_stop_before_deploy, s.primary_placement)
                }
                DeployTarget::ScheduledTask(_) => continue,
            };
            let group = match (stop, primary) {
                (true, true) => &mut groups.primary_stop_before_deploy,
                (true, false) => &mut groups.stop_before_deploy,
                (false, true) => &mut groups.primary_deploy,
                (false, false) => &mut groups.remain_deploy,
            };
            group.push(shared.clone());
        }
        groups
    }

    /// Stopped groups, primary first
    fn stopped(&self) -> [(&'static str, &[SharedTarget]); 2] {
        [
            ("Primary ", self.primary_stop_before_deploy.as_slice()),
            ("", self.stop_before_deploy.as_slice()),
        ]
    }

    /// Deploy groups, primary first
    fn deployed(&self) -> [(&'static str, &[SharedTarget]); 2] {
        [
            ("Primary ", self.primary_deploy.as_slice()),
            ("", self.remain_deploy.as_slice()),
        ]
    }
}

pub struct DeployManager {
    client: Arc<dyn EcsClient>,
    reporter: Reporter,
    options: Options,
}

impl DeployManager {
    pub fn new(client: Arc<dyn EcsClient>, reporter: Reporter, options: Options) -> Self {
        Self {
            client,
            reporter,
            options,
        }
    }

    fn start_pool(&self, size: usize) -> WorkerPool {
        let operator = Operator::new(
            self.client.clone(),
            self.reporter.clone(),
            self.options.operator.clone(),
        );
        WorkerPool::start(Arc::new(operator), self.reporter.clone(), size)
    }

    // ============================== DEPLOY ============================== //

    /// Deploy every selected target
    pub async fn run(&self, targets: &TargetSet) -> Result<RunReport, DeployError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("deploy", %run_id, environment = %targets.environment);
        async {
            let mut report = RunReport::new(run_id);
            info!("Deploying {} target(s)", targets.deploy_count());

            let size = self.options.threads_count.min(targets.deploy_count());
            let pool = self.start_pool(size);
            let result = self.deploy_phases(&pool, targets, &mut report).await;
            pool.shutdown().await;
            result?;

            self.verify(targets, &mut report).await;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn deploy_phases(
        &self,
        pool: &WorkerPool,
        targets: &TargetSet,
        report: &mut RunReport,
    ) -> Result<(), DeployError> {
        let service_update_only = self.options.operator.service_update_only;
        let task_definition_only = self.options.operator.task_definition_update_only;

        if !service_update_only {
            let reconciliation = self.fetch(pool, targets).await?;
            if !task_definition_only {
                self.delete_unused(pool, &reconciliation, report).await?;
            }
            self.check(pool, targets).await?;
        }

        let groups = DeployGroups::partition(
            &targets.deploy_services,
            self.options.stop_before_deploy && !task_definition_only,
        )
        .await;
        let scheduled = !service_update_only && !task_definition_only;

        if scheduled && !targets.deploy_scheduled_tasks.is_empty() {
            self.reporter.h1("Step: Stop Scheduled Tasks");
            pool.run_batch(units(&targets.deploy_scheduled_tasks, Operation::StopScheduledTask))
                .await?;
        }

        for (label, group) in groups.stopped() {
            if group.is_empty() {
                continue;
            }
            self.reporter
                .h1(&format!("Step: Stop {}ECS Service Before Deploy", label));
            pool.run_batch(units(group, Operation::StopBeforeDeploy)).await?;
            self.wait_for_stable(pool, group).await?;
        }

        for (label, group) in groups.deployed() {
            if group.is_empty() {
                continue;
            }
            self.reporter.h1(&format!("Step: Deploy {}ECS Service", label));
            pool.run_batch(units(group, Operation::Deploy)).await?;
            if !task_definition_only {
                self.wait_for_stable(pool, group).await?;
            }
        }

        for (label, group) in groups.stopped() {
            if group.is_empty() {
                continue;
            }
            self.reporter
                .h1(&format!("Step: Restart {}Stopped ECS Service", label));
            pool.run_batch(units(group, Operation::Deploy)).await?;
            self.wait_for_stable(pool, group).await?;
        }

        if scheduled && !targets.deploy_scheduled_tasks.is_empty() {
            self.reporter.h1("Step: Deploy Scheduled Tasks");
            pool.run_batch(units(&targets.deploy_scheduled_tasks, Operation::DeployScheduledTask))
                .await?;
        }
        Ok(())
    }

    async fn wait_for_stable(
        &self,
        pool: &WorkerPool,
        group: &[SharedTarget],
    ) -> Result<(), DeployError> {
        self.reporter.h2("Wait for Service Status 'Stable'");
        pool.run_batch(units(group, Operation::WaitForStable)).await
    }

    // ============================== DRY RUN ============================== //

    /// Fetch, list deletions and check without changing anything
    pub async fn dry_run(&self, targets: &TargetSet) -> Result<RunReport, DeployError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("dry_run", %run_id, environment = %targets.environment);
        async {
            let mut report = RunReport::new(run_id);
            let pool = self.start_pool(self.options.threads_count.min(targets.deploy_count()));

            let result = async {
                let reconciliation = self.fetch(&pool, targets).await?;
                if self.options.delete_unused_service && reconciliation.deletion_count() > 0 {
                    self.reporter.h1("Step: Delete Unused (dry run)");
                    for label in labels(reconciliation.deletions()).await {
                        self.reporter.info(&format!("would delete {}", label));
                    }
                }
                self.check(&pool, targets).await
            }
            .await;
            pool.shutdown().await;
            result?;

            let groups = DeployGroups::partition(
                &targets.deploy_services,
                self.options.stop_before_deploy,
            )
            .await;
            self.reporter.h1("Step: Deploy Order (dry run)");
            self.report_group("primary stop before deploy", &groups.primary_stop_before_deploy)
                .await;
            self.report_group("stop before deploy", &groups.stop_before_deploy)
                .await;
            self.report_group("primary deploy", &groups.primary_deploy).await;
            self.report_group("deploy", &groups.remain_deploy).await;
            self.report_group("scheduled tasks", &targets.deploy_scheduled_tasks)
                .await;

            self.verify(targets, &mut report).await;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn report_group(&self, name: &str, group: &[SharedTarget]) {
        if group.is_empty() {
            return;
        }
        let mut names = Vec::with_capacity(group.len());
        for shared in group {
            names.push(shared.lock().await.identity().to_string());
        }
        self.reporter
            .info(&format!("{}: {}", name, names.join(", ")));
    }

    // ============================== DELETE ============================== //

    /// Delete every managed service and rule of `environment`
    ///
    /// `confirm` receives the candidate labels and is skipped when `force` is
    /// set. A declined confirmation is a failed run.
    pub async fn delete<F>(
        &self,
        environment: &str,
        force: bool,
        confirm: F,
    ) -> Result<RunReport, DeployError>
    where
        F: FnOnce(&[String]) -> bool,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("delete", %run_id, environment = %environment);
        async {
            let mut report = RunReport::new(run_id);
            let pool = self.start_pool(self.options.threads_count);

            let result = async {
                self.reporter.h1("Step: Fetch ECS Services and Scheduled Tasks");
                let observed = fetch_observed_state(self.client.as_ref(), true, true).await?;
                pool.run_batch(
                    observed
                        .snapshots()
                        .map(|s| Unit::snapshot(s, Operation::FetchTaskDefinition))
                        .collect(),
                )
                .await?;
                let reconciliation = reconcile(
                    &observed,
                    &[],
                    &[],
                    environment,
                    self.options.template_group.as_deref(),
                )
                .await;

                if reconciliation.deletion_count() == 0 {
                    self.reporter
                        .success(&format!("Nothing to delete in `{}`.", environment));
                    return Ok(());
                }

                let candidates = labels(reconciliation.deletions()).await;
                self.reporter.h1("Step: Delete Candidates");
                for label in &candidates {
                    self.reporter.info(label);
                }
                if !force && !confirm(&candidates) {
                    warn!("Delete declined");
                    report.fail("delete", "declined by operator");
                    return Ok(());
                }
                self.delete_batch(&pool, &reconciliation, &mut report).await
            }
            .await;
            pool.shutdown().await;
            result?;

            report.finished_at = Some(Utc::now());
            self.summarize(&report);
            Ok(report)
        }
        .instrument(span)
        .await
    }

    // ============================== PHASES ============================== //

    async fn fetch(
        &self,
        pool: &WorkerPool,
        targets: &TargetSet,
    ) -> Result<Reconciliation, DeployError> {
        self.reporter.h1("Step: Fetch ECS Services and Scheduled Tasks");
        // a kind absent from the manifest is left alone, not deleted
        let observed = fetch_observed_state(
            self.client.as_ref(),
            !targets.services.is_empty(),
            !targets.scheduled_tasks.is_empty(),
        )
        .await?;
        pool.run_batch(
            observed
                .snapshots()
                .map(|s| Unit::snapshot(s, Operation::FetchTaskDefinition))
                .collect(),
        )
        .await?;

        let reconciliation = reconcile(
            &observed,
            &targets.services,
            &targets.scheduled_tasks,
            &targets.environment,
            self.options.template_group.as_deref(),
        )
        .await;
        self.reporter.success(&format!(
            "Fetch succeeded ({} matched, {} unused)",
            reconciliation.matched,
            reconciliation.deletion_count()
        ));
        Ok(reconciliation)
    }

    async fn delete_unused(
        &self,
        pool: &WorkerPool,
        reconciliation: &Reconciliation,
        report: &mut RunReport,
    ) -> Result<(), DeployError> {
        if !self.options.delete_unused_service || reconciliation.deletion_count() == 0 {
            return Ok(());
        }
        self.reporter
            .h1("Step: Delete Unused ECS Services and Scheduled Tasks");
        self.delete_batch(pool, reconciliation, report).await
    }

    async fn delete_batch(
        &self,
        pool: &WorkerPool,
        reconciliation: &Reconciliation,
        report: &mut RunReport,
    ) -> Result<(), DeployError> {
        pool.run_batch(
            reconciliation
                .deletions()
                .map(|s| Unit::snapshot(s, Operation::Delete))
                .collect(),
        )
        .await?;

        for shared in reconciliation.deletions() {
            let snapshot = shared.lock().await;
            if snapshot.status == Status::Error {
                report.fail(
                    snapshot.label(),
                    snapshot.failure.clone().unwrap_or_default(),
                );
            }
        }
        Ok(())
    }

    async fn check(&self, pool: &WorkerPool, targets: &TargetSet) -> Result<(), DeployError> {
        self.reporter
            .h1("Step: Check Deploy ECS Service and Scheduled tasks");
        let batch = targets
            .deploy_targets()
            .map(|t| Unit::target(t, Operation::CheckDeploy))
            .collect();
        pool.run_batch(batch).await
    }

    async fn verify(&self, targets: &TargetSet, report: &mut RunReport) {
        for shared in targets.deploy_targets() {
            let target = shared.lock().await;
            if target.status() == Status::Error {
                report.fail(
                    target.label(),
                    target.state().failure.clone().unwrap_or_default(),
                );
            }
        }
        report.finished_at = Some(Utc::now());
        self.summarize(report);
    }

    fn summarize(&self, report: &RunReport) {
        self.reporter.h1("Step: Result");
        self.reporter.info(&format!("run {}", report.run_id));
        self.reporter
            .info(&format!("started {}", report.started_at.to_rfc3339()));
        if let Some(finished_at) = report.finished_at {
            self.reporter
                .info(&format!("finished {}", finished_at.to_rfc3339()));
        }

        if report.succeeded() {
            info!("Run succeeded");
            self.reporter.success("Deploy succeeded.");
            return;
        }
        warn!("Run finished with {} failure(s)", report.failures.len());
        for failure in &report.failures {
            self.reporter
                .error(&format!("{}: {}", failure.label, failure.reason));
        }
    }
}

fn units(group: &[SharedTarget], operation: Operation) -> Vec<Unit> {
    group.iter().map(|t| Unit::target(t, operation)).collect()
}

async fn labels<'a>(snapshots: impl Iterator<Item = &'a SharedSnapshot>) -> Vec<String> {
    let mut labels = Vec::new();
    for shared in snapshots {
        labels.push(shared.lock().await.label());
    }
    labels
}
