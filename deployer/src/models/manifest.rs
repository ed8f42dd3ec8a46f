//! Rendered deploy manifest and target-list construction

use std::collections::HashSet;

use ecs_models::RuleState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DeployError;
use crate::models::params::{DeployParameters, TargetKind};
use crate::models::spec::WorkloadSpec;
use crate::models::target::{
    DeployTarget, RunState, ScheduledTaskTarget, ServiceTarget, SharedTarget,
};

/// Output of the template renderer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployManifest {
    pub environment: String,

    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    #[serde(default)]
    pub scheduled_tasks: Vec<ScheduledTaskEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub task_definition: Value,

    #[serde(default)]
    pub stop_before_deploy: bool,

    #[serde(default)]
    pub primary_placement: bool,

    #[serde(default)]
    pub placement_strategy: Vec<Value>,

    #[serde(default)]
    pub placement_constraints: Vec<Value>,

    #[serde(default)]
    pub load_balancers: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_configuration: Option<Value>,

    #[serde(default)]
    pub service_registries: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskEntry {
    pub task_definition: Value,

    pub schedule_expression: String,

    #[serde(default)]
    pub placement_strategy: Vec<Value>,

    #[serde(default)]
    pub placement_constraints: Vec<Value>,
}

/// Filters selecting which targets this run deploys
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    /// Match `SERVICE_GROUP`
    pub service_group: Option<String>,

    /// Match `TEMPLATE_GROUP`
    pub template_group: Option<String>,
}

impl TargetFilter {
    fn accepts(&self, params: &DeployParameters) -> bool {
        let group_ok = match &self.service_group {
            Some(group) => params.service_group.as_ref() == Some(group),
            None => true,
        };
        let template_ok = match &self.template_group {
            Some(group) => params.template_group.as_ref() == Some(group),
            None => true,
        };
        group_ok && template_ok
    }
}

/// Every target of a run
///
/// The full lists feed reconciliation; the deploy lists are what this run
/// actually touches.
#[derive(Debug, Clone)]
pub struct TargetSet {
    pub environment: String,
    pub services: Vec<SharedTarget>,
    pub scheduled_tasks: Vec<SharedTarget>,
    pub deploy_services: Vec<SharedTarget>,
    pub deploy_scheduled_tasks: Vec<SharedTarget>,
}

impl TargetSet {
    /// Build targets from a manifest, failing before any cloud call on
    /// invalid parameters, duplicate families or an empty selection
    pub fn from_manifest(
        manifest: DeployManifest,
        filter: &TargetFilter,
    ) -> Result<Self, DeployError> {
        let mut families = HashSet::new();
        let mut set = TargetSet {
            environment: manifest.environment,
            services: Vec::new(),
            scheduled_tasks: Vec::new(),
            deploy_services: Vec::new(),
            deploy_scheduled_tasks: Vec::new(),
        };

        for entry in manifest.services {
            let spec = WorkloadSpec::from_document(entry.task_definition)?;
            let params = DeployParameters::parse(&spec, TargetKind::Service)?;
            claim_family(&mut families, &spec)?;

            let selected = filter.accepts(&params);
            let target = DeployTarget::Service(ServiceTarget {
                service_name: format!("{}-service", spec.family()),
                state: RunState::with_desired_count(params.count),
                spec,
                params,
                primary_placement: entry.primary_placement,
                stop_before_deploy: entry.stop_before_deploy,
                placement_strategy: entry.placement_strategy,
                placement_constraints: entry.placement_constraints,
                load_balancers: entry.load_balancers,
                network_configuration: entry.network_configuration,
                service_registries: entry.service_registries,
            })
            .shared();

            if selected {
                set.deploy_services.push(target.clone());
            }
            set.services.push(target);
        }

        for entry in manifest.scheduled_tasks {
            let spec = WorkloadSpec::from_document(entry.task_definition)?;
            let params = DeployParameters::parse(&spec, TargetKind::ScheduledTask)?;
            claim_family(&mut families, &spec)?;

            let selected = filter.accepts(&params);
            let target = DeployTarget::ScheduledTask(ScheduledTaskTarget {
                state: RunState::with_desired_count(params.count),
                spec,
                params,
                schedule_expression: entry.schedule_expression,
                placement_strategy: entry.placement_strategy,
                placement_constraints: entry.placement_constraints,
                rule_state: RuleState::Enabled,
                origin_cluster: None,
            })
            .shared();

            if selected {
                set.deploy_scheduled_tasks.push(target.clone());
            }
            set.scheduled_tasks.push(target);
        }

        if set.deploy_services.is_empty() && set.deploy_scheduled_tasks.is_empty() {
            return Err(DeployError::ConfigError(
                "Deployment target not found.".to_string(),
            ));
        }
        Ok(set)
    }

    /// Services and scheduled tasks this run deploys
    pub fn deploy_targets(&self) -> impl Iterator<Item = &SharedTarget> {
        self.deploy_services
            .iter()
            .chain(self.deploy_scheduled_tasks.iter())
    }

    pub fn deploy_count(&self) -> usize {
        self.deploy_services.len() + self.deploy_scheduled_tasks.len()
    }
}

fn claim_family(families: &mut HashSet<String>, spec: &WorkloadSpec) -> Result<(), DeployError> {
    if !families.insert(spec.family().to_string()) {
        return Err(DeployError::ConfigError(format!(
            "Duplicate family name `{}` found.",
            spec.family()
        )));
    }
    Ok(())
}
