//! Per-target cloud operations run by the worker pool

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ecs_models::{
    CreateServiceRequest, DeploymentConfiguration, RuleState, ScheduledRuleRequest,
    ServiceDescription, UpdateServiceRequest,
};
use tracing::{debug, info};

use crate::cloud::{CloudErrorKind, EcsClient};
use crate::deploy::canonical::diff;
use crate::deploy::pool::{Executor, Operation};
use crate::deploy::reconcile::{adopt_rule, adopt_service, rule_state_for, MANAGED_DESCRIPTION};
use crate::deploy::retry::RetryPolicies;
use crate::errors::DeployError;
use crate::models::params::DeployParameters;
use crate::models::snapshot::{Observed, Snapshot};
use crate::models::spec::WorkloadSpec;
use crate::models::target::{DeployTarget, RunState, ScheduledTaskTarget, ServiceTarget};
use crate::report::Reporter;
use crate::storage::settings::DEFAULT_SERVICE_WAIT_MAX_ATTEMPTS;

/// Knobs the operations read
#[derive(Debug, Clone)]
pub struct Options {
    /// Keep services observed at zero desired tasks at zero
    pub service_zero_keep: bool,
    /// Point services at the family's latest revision without registering
    pub service_update_only: bool,
    /// Register task definitions and leave services alone
    pub task_definition_update_only: bool,
    pub service_wait_max_attempts: u32,
    pub service_wait_delay: Duration,
    pub retry: RetryPolicies,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            service_zero_keep: true,
            service_update_only: false,
            task_definition_update_only: false,
            service_wait_max_attempts: DEFAULT_SERVICE_WAIT_MAX_ATTEMPTS,
            service_wait_delay: Duration::from_secs(5),
            retry: RetryPolicies::default(),
        }
    }
}

/// Executes pool units against an [`EcsClient`]
pub struct Operator {
    client: Arc<dyn EcsClient>,
    reporter: Reporter,
    options: Options,
}

#[async_trait]
impl Executor for Operator {
    async fn execute_target(
        &self,
        target: &mut DeployTarget,
        operation: Operation,
    ) -> Result<(), DeployError> {
        let kind = target.kind_label();
        match target {
            DeployTarget::Service(service) => match operation {
                Operation::CheckDeploy => self.check_service(service).await,
                Operation::StopBeforeDeploy => self.stop_service(service).await,
                Operation::Deploy => self.deploy_service(service).await,
                Operation::WaitForStable => self.wait_for_stable(service).await,
                other => Err(not_applicable(other, kind)),
            },
            DeployTarget::ScheduledTask(task) => match operation {
                Operation::CheckDeploy => self.check_scheduled_task(task).await,
                Operation::StopScheduledTask => self.stop_scheduled_task(task).await,
                Operation::DeployScheduledTask => self.deploy_scheduled_task(task).await,
                other => Err(not_applicable(other, kind)),
            },
        }
    }

    async fn execute_snapshot(
        &self,
        snapshot: &mut Snapshot,
        operation: Operation,
    ) -> Result<(), DeployError> {
        match operation {
            Operation::FetchTaskDefinition => self.fetch_task_definition(snapshot).await,
            Operation::Delete => self.delete(snapshot).await,
            other => Err(not_applicable(other, snapshot.kind_label())),
        }
    }
}

fn not_applicable(operation: Operation, kind: &str) -> DeployError {
    DeployError::Internal(format!("`{}` does not apply to a {}", operation, kind))
}

impl Operator {
    pub fn new(client: Arc<dyn EcsClient>, reporter: Reporter, options: Options) -> Self {
        Self {
            client,
            reporter,
            options,
        }
    }

    // ============================== SNAPSHOTS ============================== //

    async fn fetch_task_definition(&self, snapshot: &mut Snapshot) -> Result<(), DeployError> {
        let definition = self
            .client
            .describe_task_definition(snapshot.task_definition_ref())
            .await?;
        snapshot.set_from_task_definition(&definition)
    }

    async fn delete(&self, snapshot: &mut Snapshot) -> Result<(), DeployError> {
        match &snapshot.observed {
            Observed::Service(service) => {
                self.client
                    .delete_service(&service.cluster_name, &service.service_name)
                    .await?;
                info!("Deleted service `{}`", service.service_name);
                self.reporter
                    .success(&format!("Delete service '{}'", service.service_name));
            }
            Observed::Rule(rule) => {
                let target_arn = rule
                    .params
                    .as_ref()
                    .and_then(|p| p.target_lambda_arn.as_deref());
                self.client.delete_scheduled_rule(&rule.name, target_arn).await?;
                info!("Deleted scheduled rule `{}`", rule.name);
                self.reporter
                    .success(&format!("Delete scheduled task '{}'", rule.name));
            }
        }
        Ok(())
    }

    // ============================== CHECK ============================== //

    async fn check_service(&self, service: &mut ServiceTarget) -> Result<(), DeployError> {
        if service.state.origin_spec().is_none() {
            let description = match self
                .client
                .describe_service(&service.params.cluster_name, &service.service_name)
                .await
            {
                Ok(description) => description,
                Err(e) if e.is_not_found() => {
                    self.reporter.info(&format!(
                        "Service '{}' not Found. will be created.",
                        service.service_name
                    ));
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let mut snapshot = Snapshot::service(&description);
            let definition = self
                .client
                .describe_task_definition(snapshot.task_definition_ref())
                .await?;
            snapshot.set_from_task_definition(&definition)?;
            if let Observed::Service(observed) = &snapshot.observed {
                adopt_service(service, observed);
            }
        }

        if !service.state.exists {
            self.reporter.info(&format!(
                "Service '{}' status not Active. will be recreated.",
                service.service_name
            ));
            return Ok(());
        }

        self.reporter.success(&format!(
            "Checking service '{}' succeeded ({} / {})",
            service.service_name, service.state.running_count, service.state.desired_count
        ));
        self.report_diff(&service.state, &service.spec);
        Ok(())
    }

    async fn check_scheduled_task(&self, task: &mut ScheduledTaskTarget) -> Result<(), DeployError> {
        let family = task.spec.family().to_string();
        if task.state.origin_spec().is_none() {
            let rule = match self.client.describe_rule(&family).await {
                Ok(rule) => rule,
                Err(e) if e.is_not_found() => {
                    self.reporter.info(&format!(
                        "Scheduled Task '{}' not Found. will be created.",
                        family
                    ));
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let mut snapshot = Snapshot::rule(&rule);
            let definition = self.client.describe_task_definition(&family).await?;
            snapshot.set_from_task_definition(&definition)?;
            if let Observed::Rule(observed) = &snapshot.observed {
                adopt_rule(task, observed);
            }
        }

        self.reporter
            .success(&format!("Checking scheduled task '{}' succeeded.", family));
        self.report_diff(&task.state, &task.spec);
        Ok(())
    }

    fn report_diff(&self, state: &RunState, spec: &WorkloadSpec) {
        let Some(origin) = state.origin_spec() else {
            return;
        };
        let lines = diff(origin.containers(), spec.containers());
        if lines.is_empty() {
            self.reporter.info("no container changes");
        }
        for line in lines {
            self.reporter.info(&line);
        }
    }

    // ============================== SERVICES ============================== //

    async fn stop_service(&self, service: &mut ServiceTarget) -> Result<(), DeployError> {
        let task_definition = service
            .state
            .origin_arn
            .clone()
            .unwrap_or_else(|| service.spec.family().to_string());
        let request = update_request(service, task_definition, 0, false);

        match self.client.update_service(&request).await {
            Ok(description) => {
                record_counts(&mut service.state, &description);
                self.reporter.success(&format!(
                    "Stop Service '{}' succeeded.",
                    service.service_name
                ));
                self.reporter.info("- 0 task desired");
            }
            Err(e) if e.is_not_found() => {
                service.state.exists = false;
                self.reporter.info(&format!(
                    "Service '{}' not Found. nothing to stop.",
                    service.service_name
                ));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn deploy_service(&self, service: &mut ServiceTarget) -> Result<(), DeployError> {
        if !self.options.service_update_only {
            self.register(&service.spec, &mut service.state).await?;
        }
        if self.options.task_definition_update_only {
            self.reporter.success(&format!(
                "Register Task Definition '{}'.",
                service.service_name
            ));
            self.report_registration(&service.state);
            return Ok(());
        }

        let desired_count = self.desired_count(service);
        let task_definition = service
            .state
            .task_definition_arn
            .clone()
            .unwrap_or_else(|| service.spec.family().to_string());
        let request = update_request(service, task_definition, desired_count, true);

        let description = match self.client.update_service(&request).await {
            Ok(description) => description,
            Err(e) if e.is_not_found() => {
                self.reporter.info(&format!(
                    "Service '{}' not Found. will be created.",
                    service.service_name
                ));
                let task_definition = self.register(&service.spec, &mut service.state).await?;
                let request = create_request(service, task_definition, desired_count);
                self.client.create_service(&request).await?
            }
            Err(e) => return Err(e.into()),
        };
        record_counts(&mut service.state, &description);

        self.reporter.success(&format!(
            "Deploy Service '{}' succeeded.",
            service.service_name
        ));
        if !self.options.service_update_only {
            self.report_registration(&service.state);
        }
        self.reporter
            .info(&format!("- {} task desired", desired_count));
        Ok(())
    }

    /// Configured count, unless the service was observed scaled to zero
    fn desired_count(&self, service: &ServiceTarget) -> u32 {
        if self.options.service_zero_keep && service.state.origin_desired_count == Some(0) {
            debug!("Keeping `{}` at zero desired tasks", service.service_name);
            return 0;
        }
        service.params.count
    }

    async fn wait_for_stable(&self, service: &mut ServiceTarget) -> Result<(), DeployError> {
        if !service.state.exists {
            debug!("`{}` does not exist, not waiting", service.service_name);
            return Ok(());
        }

        let client = &self.client;
        let cluster = service.params.cluster_name.as_str();
        let name = service.service_name.as_str();
        let (max_attempts, delay) = (
            self.options.service_wait_max_attempts,
            self.options.service_wait_delay,
        );
        let description = self
            .options
            .retry
            .wait_stable
            .run(&format!("wait for `{}` to become stable", name), move || {
                client.wait_for_service_stable(cluster, name, max_attempts, delay)
            })
            .await
            .map_err(|e| match e.kind() {
                CloudErrorKind::WaiterTimeout => {
                    DeployError::DeployFailed(format!("service '{}' update wait timeout.", name))
                }
                _ => e.into(),
            })?;
        record_counts(&mut service.state, &description);

        self.deregister_previous(&mut service.state).await?;
        self.reporter.success(&format!(
            "service '{}' ({} / {}) update completed.",
            service.service_name, service.state.running_count, service.state.desired_count
        ));
        Ok(())
    }

    /// Drop the revision that ran before, when this run replaced it
    async fn deregister_previous(&self, state: &mut RunState) -> Result<(), DeployError> {
        if !state.registered {
            return Ok(());
        }
        let (Some(previous), Some(current)) = (&state.origin_arn, &state.task_definition_arn)
        else {
            return Ok(());
        };
        if previous == current {
            return Ok(());
        }

        let client = &self.client;
        let previous = previous.as_str();
        self.options
            .retry
            .deregister
            .run(&format!("deregister `{}`", previous), move || {
                client.deregister_task_definition(previous)
            })
            .await?;
        info!("Deregistered task definition `{}`", previous);
        Ok(())
    }

    // ============================== SCHEDULED TASKS ============================== //

    async fn stop_scheduled_task(&self, task: &mut ScheduledTaskTarget) -> Result<(), DeployError> {
        if !task.state.exists {
            return Ok(());
        }
        let family = task.spec.family();
        if task.rule_state == RuleState::Enabled {
            self.client.disable_rule(family).await?;
        }

        let cluster = task
            .origin_cluster
            .clone()
            .unwrap_or_else(|| task.params.cluster_name.clone());
        let running = self.client.list_running_tasks(&cluster, family).await?;
        if running.is_empty() {
            return Ok(());
        }

        self.reporter.info(&format!("Stopping Task `{}`.", family));
        for task_arn in &running {
            self.client.stop_task(&cluster, task_arn).await?;
        }

        let client = &self.client;
        let (cluster, running) = (cluster.as_str(), running.as_slice());
        self.options
            .retry
            .wait_stopped
            .run(&format!("wait for `{}` tasks to stop", family), move || {
                client.wait_for_tasks_stopped(cluster, running)
            })
            .await?;
        self.reporter.success(&format!(
            "Stopped {} task(s) of `{}`.",
            running.len(),
            family
        ));
        Ok(())
    }

    async fn deploy_scheduled_task(&self, task: &mut ScheduledTaskTarget) -> Result<(), DeployError> {
        let task_definition_arn = self.register(&task.spec, &mut task.state).await?;
        let state = rule_state_for(task);
        let request = ScheduledRuleRequest {
            name: task.spec.family().to_string(),
            schedule_expression: task.schedule_expression.clone(),
            description: MANAGED_DESCRIPTION.to_string(),
            state,
            target_arn: task.params.target_lambda_arn.clone(),
            cluster: task.params.cluster_name.clone(),
            task_definition_arn,
            task_count: task.params.count,
            placement_strategy: task.placement_strategy.clone(),
            placement_constraints: task.placement_constraints.clone(),
        };
        self.client.create_or_update_scheduled_rule(&request).await?;
        task.state.exists = true;

        self.reporter.success(&format!(
            "Deploy Scheduled Task '{}' succeeded.",
            request.name
        ));
        self.reporter
            .info(&format!("- Cloudwatch Event State: {}", state.as_str()));
        self.report_registration(&task.state);
        self.reporter
            .info(&format!("- schedule '{}'.", task.schedule_expression));
        self.reporter
            .info(&format!("- {} task count.", task.params.count));
        Ok(())
    }

    // ============================== REGISTRATION ============================== //

    /// Task definition arn to deploy, registering a revision only when the
    /// containers changed, at most once per run
    async fn register(&self, spec: &WorkloadSpec, state: &mut RunState) -> Result<String, DeployError> {
        if let Some(arn) = &state.task_definition_arn {
            return Ok(arn.clone());
        }
        if state.matches_origin(spec) {
            if let Some(arn) = state.origin_arn.clone() {
                debug!("`{}` is unchanged, reusing {}", spec.family(), arn);
                state.task_definition_arn = Some(arn.clone());
                return Ok(arn);
            }
        }

        let client = &self.client;
        let document = spec.document();
        let definition = self
            .options
            .retry
            .register
            .run(
                &format!("register task definition `{}`", spec.family()),
                move || client.register_task_definition(document),
            )
            .await?;
        info!("Registered {}", definition.task_definition_arn);

        state.registered = true;
        state.task_definition_arn = Some(definition.task_definition_arn.clone());
        Ok(definition.task_definition_arn)
    }

    fn report_registration(&self, state: &RunState) {
        match (&state.task_definition_arn, state.registered) {
            (Some(arn), true) => self
                .reporter
                .info(&format!("- Registering task definition arn: '{}'", arn)),
            _ => self
                .reporter
                .info("- task definition is same. Did not register."),
        }
    }
}

fn deployment_configuration(params: &DeployParameters) -> DeploymentConfiguration {
    DeploymentConfiguration {
        maximum_percent: params.maximum_percent,
        minimum_healthy_percent: params.minimum_healthy_percent,
    }
}

fn update_request(
    service: &ServiceTarget,
    task_definition: String,
    desired_count: u32,
    force_new_deployment: bool,
) -> UpdateServiceRequest {
    UpdateServiceRequest {
        cluster: service.params.cluster_name.clone(),
        service: service.service_name.clone(),
        task_definition,
        desired_count,
        deployment_configuration: deployment_configuration(&service.params),
        force_new_deployment,
        placement_strategy: service.placement_strategy.clone(),
        placement_constraints: service.resolved_placement_constraints(),
        load_balancers: service.load_balancers.clone(),
        network_configuration: service.network_configuration.clone(),
        service_registries: service.service_registries.clone(),
    }
}

fn create_request(
    service: &ServiceTarget,
    task_definition: String,
    desired_count: u32,
) -> CreateServiceRequest {
    CreateServiceRequest {
        cluster: service.params.cluster_name.clone(),
        service_name: service.service_name.clone(),
        task_definition,
        desired_count,
        deployment_configuration: deployment_configuration(&service.params),
        placement_strategy: service.placement_strategy.clone(),
        placement_constraints: service.resolved_placement_constraints(),
        load_balancers: service.load_balancers.clone(),
        network_configuration: service.network_configuration.clone(),
        service_registries: service.service_registries.clone(),
    }
}

fn record_counts(state: &mut RunState, description: &ServiceDescription) {
    state.running_count = description.running_count;
    state.desired_count = description.desired_count;
    state.exists = description.is_active();
}
