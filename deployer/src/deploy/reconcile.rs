//! Observed state fetching and matching against desired targets

use ecs_models::RuleState;
use tracing::{debug, info};

use crate::cloud::EcsClient;
use crate::errors::DeployError;
use crate::models::snapshot::{
    CloudwatchEventRule, DescribeService, Observed, SharedSnapshot, Snapshot,
};
use crate::models::target::{
    DeployTarget, ScheduledTaskTarget, ServiceTarget, SharedTarget, Status,
};

/// Description every rule created by the deployer carries; rules without it
/// are never fetched, matched or deleted
pub const MANAGED_DESCRIPTION: &str = "MANAGED BY TASK MANAGER";

/// `describe_services` accepts at most this many services per call
const DESCRIBE_SERVICES_CHUNK: usize = 10;

/// Services and managed rules found in the cloud
#[derive(Debug, Default)]
pub struct ObservedState {
    pub services: Vec<SharedSnapshot>,
    pub rules: Vec<SharedSnapshot>,
}

impl ObservedState {
    pub fn snapshots(&self) -> impl Iterator<Item = &SharedSnapshot> {
        self.services.iter().chain(self.rules.iter())
    }
}

/// List the services of every cluster and the managed rules
///
/// A kind that is not requested is never observed, so it can never become a
/// deletion candidate. Task definitions are not described here; that is a
/// pool batch of its own.
pub async fn fetch_observed_state(
    client: &dyn EcsClient,
    services: bool,
    rules: bool,
) -> Result<ObservedState, DeployError> {
    let mut observed = ObservedState::default();

    if services {
        for cluster in client.list_clusters().await? {
            let arns = client.list_services(&cluster).await?;
            debug!("Cluster `{}` has {} service(s)", cluster, arns.len());
            for chunk in arns.chunks(DESCRIBE_SERVICES_CHUNK) {
                for description in client.describe_services(&cluster, chunk).await? {
                    observed
                        .services
                        .push(Snapshot::service(&description).shared());
                }
            }
        }
    }

    if rules {
        for rule in client.list_scheduled_rules().await? {
            if rule.description.as_deref() != Some(MANAGED_DESCRIPTION) {
                continue;
            }
            observed.rules.push(Snapshot::rule(&rule).shared());
        }
    }

    info!(
        "Fetched {} service(s) and {} managed rule(s)",
        observed.services.len(),
        observed.rules.len()
    );
    Ok(observed)
}

/// Result of matching observed snapshots against the desired targets
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub matched: usize,
    pub delete_services: Vec<SharedSnapshot>,
    pub delete_rules: Vec<SharedSnapshot>,
}

impl Reconciliation {
    pub fn deletions(&self) -> impl Iterator<Item = &SharedSnapshot> {
        self.delete_services.iter().chain(self.delete_rules.iter())
    }

    pub fn deletion_count(&self) -> usize {
        self.delete_services.len() + self.delete_rules.len()
    }
}

/// Match snapshots to targets by identity
///
/// Snapshots from another environment or template group are ignored, as are
/// snapshots whose task definition could not be read. A matched snapshot
/// populates the target's origin; an unmatched one becomes a deletion
/// candidate. `services` and `scheduled_tasks` must be the full desired set,
/// not only what this run deploys.
pub async fn reconcile(
    observed: &ObservedState,
    services: &[SharedTarget],
    scheduled_tasks: &[SharedTarget],
    environment: &str,
    template_group: Option<&str>,
) -> Reconciliation {
    let mut result = Reconciliation::default();

    for shared in observed.snapshots() {
        let snapshot = shared.lock().await;
        if snapshot.status == Status::Error {
            continue;
        }
        let Some(params) = snapshot.params() else {
            continue;
        };
        if params.environment != environment {
            continue;
        }
        if let Some(group) = template_group {
            if params.template_group.as_deref() != Some(group) {
                continue;
            }
        }

        match &snapshot.observed {
            Observed::Service(observed) => {
                if adopt_into(services, observed).await {
                    result.matched += 1;
                } else {
                    debug!("Service `{}` is not desired", observed.service_name);
                    result.delete_services.push(shared.clone());
                }
            }
            Observed::Rule(observed) => {
                if adopt_rule_into(scheduled_tasks, observed).await {
                    result.matched += 1;
                } else {
                    debug!("Rule `{}` is not desired", observed.name);
                    result.delete_rules.push(shared.clone());
                }
            }
        }
    }

    result
}

async fn adopt_into(services: &[SharedTarget], observed: &DescribeService) -> bool {
    for shared in services {
        let mut target = shared.lock().await;
        if let DeployTarget::Service(service) = &mut *target {
            if service.service_name == observed.service_name
                && service.params.cluster_name == observed.cluster_name
            {
                adopt_service(service, observed);
                return true;
            }
        }
    }
    false
}

async fn adopt_rule_into(scheduled_tasks: &[SharedTarget], observed: &CloudwatchEventRule) -> bool {
    for shared in scheduled_tasks {
        let mut target = shared.lock().await;
        if let DeployTarget::ScheduledTask(task) = &mut *target {
            if task.spec.family() == observed.name {
                adopt_rule(task, observed);
                return true;
            }
        }
    }
    false
}

/// Record an observed service as the target's origin, once per run
pub fn adopt_service(target: &mut ServiceTarget, observed: &DescribeService) {
    let Some(spec) = observed.spec.clone() else {
        return;
    };
    if !target
        .state
        .set_origin(spec, observed.task_definition_arn.clone())
    {
        return;
    }
    target.state.exists = observed.active;
    target.state.origin_desired_count = Some(observed.desired_count);
    target.state.running_count = observed.running_count;
    target.state.desired_count = observed.desired_count;
}

/// Record an observed rule as the target's origin, once per run
pub fn adopt_rule(target: &mut ScheduledTaskTarget, observed: &CloudwatchEventRule) {
    let (Some(spec), Some(arn)) = (observed.spec.clone(), observed.task_definition_arn.clone())
    else {
        return;
    };
    if !target.state.set_origin(spec, arn) {
        return;
    }
    target.state.exists = true;
    target.rule_state = observed.state;
    target.origin_cluster = observed.params.as_ref().map(|p| p.cluster_name.clone());
}

/// Rule state the deploy writes back: the observed one, or enabled for new rules
pub fn rule_state_for(target: &ScheduledTaskTarget) -> RuleState {
    if target.state.exists {
        target.rule_state
    } else {
        RuleState::Enabled
    }
}
