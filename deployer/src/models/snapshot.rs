//! Observed cloud state, read during the fetch phase

use std::sync::Arc;

use ecs_models::{RuleDescription, RuleState, ServiceDescription, TaskDefinition};
use tokio::sync::Mutex;

use crate::errors::DeployError;
use crate::models::params::{DeployParameters, TargetKind};
use crate::models::spec::WorkloadSpec;
use crate::models::target::Status;
use crate::utils::arn_to_name;

pub type SharedSnapshot = Arc<Mutex<Snapshot>>;

/// A running service as described by the cloud
#[derive(Debug, Clone)]
pub struct DescribeService {
    pub service_name: String,
    pub cluster_name: String,
    pub task_definition_arn: String,
    pub running_count: u32,
    pub desired_count: u32,
    pub active: bool,

    /// Filled once the task definition has been described
    pub spec: Option<WorkloadSpec>,
    pub params: Option<DeployParameters>,
}

impl DescribeService {
    pub fn from_description(description: &ServiceDescription) -> Self {
        Self {
            service_name: description.service_name.clone(),
            cluster_name: arn_to_name(&description.cluster_arn).to_string(),
            task_definition_arn: description.task_definition.clone(),
            running_count: description.running_count,
            desired_count: description.desired_count,
            active: description.is_active(),
            spec: None,
            params: None,
        }
    }
}

/// A managed scheduled rule as described by the cloud
#[derive(Debug, Clone)]
pub struct CloudwatchEventRule {
    pub name: String,
    pub arn: String,
    pub state: RuleState,
    pub schedule_expression: Option<String>,

    /// Filled once the task definition has been described
    pub task_definition_arn: Option<String>,
    pub spec: Option<WorkloadSpec>,
    pub params: Option<DeployParameters>,
}

impl CloudwatchEventRule {
    pub fn from_rule(rule: &RuleDescription) -> Self {
        Self {
            name: rule.name.clone(),
            arn: rule.arn.clone(),
            state: rule.state,
            schedule_expression: rule.schedule_expression.clone(),
            task_definition_arn: None,
            spec: None,
            params: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Observed {
    Service(DescribeService),
    Rule(CloudwatchEventRule),
}

/// An observed entity plus the status of the unit that fetched it
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub observed: Observed,
    pub status: Status,
    pub failure: Option<String>,
}

impl Snapshot {
    pub fn service(description: &ServiceDescription) -> Self {
        Self::new(Observed::Service(DescribeService::from_description(description)))
    }

    pub fn rule(rule: &RuleDescription) -> Self {
        Self::new(Observed::Rule(CloudwatchEventRule::from_rule(rule)))
    }

    fn new(observed: Observed) -> Self {
        Self {
            observed,
            status: Status::Normal,
            failure: None,
        }
    }

    pub fn shared(self) -> SharedSnapshot {
        Arc::new(Mutex::new(self))
    }

    /// Service name or rule name
    pub fn identity(&self) -> &str {
        match &self.observed {
            Observed::Service(s) => &s.service_name,
            Observed::Rule(r) => &r.name,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match &self.observed {
            Observed::Service(_) => "service",
            Observed::Rule(_) => "scheduled task",
        }
    }

    /// Name or arn the backing task definition is described by
    pub fn task_definition_ref(&self) -> &str {
        match &self.observed {
            Observed::Service(s) => &s.task_definition_arn,
            Observed::Rule(r) => &r.name,
        }
    }

    pub fn params(&self) -> Option<&DeployParameters> {
        match &self.observed {
            Observed::Service(s) => s.params.as_ref(),
            Observed::Rule(r) => r.params.as_ref(),
        }
    }

    pub fn spec(&self) -> Option<&WorkloadSpec> {
        match &self.observed {
            Observed::Service(s) => s.spec.as_ref(),
            Observed::Rule(r) => r.spec.as_ref(),
        }
    }

    /// Attach the described task definition and parse its parameters
    pub fn set_from_task_definition(
        &mut self,
        definition: &TaskDefinition,
    ) -> Result<(), DeployError> {
        let spec = WorkloadSpec::from_document(definition.document.clone())?;
        match &mut self.observed {
            Observed::Service(s) => {
                s.params = Some(DeployParameters::parse(&spec, TargetKind::Service)?);
                s.spec = Some(spec);
            }
            Observed::Rule(r) => {
                r.params = Some(DeployParameters::parse(&spec, TargetKind::ScheduledTask)?);
                r.task_definition_arn = Some(definition.task_definition_arn.clone());
                r.spec = Some(spec);
            }
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.status == Status::Error {
            return;
        }
        self.status = Status::Error;
        self.failure = Some(reason.into());
    }
}
