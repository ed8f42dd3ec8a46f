//! Deploy targets and their per-run state

use std::sync::Arc;

use ecs_models::RuleState;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::deploy::canonical::same_spec;
use crate::models::params::DeployParameters;
use crate::models::spec::WorkloadSpec;

/// A target shared between the orchestrator and the pool unit working on it
pub type SharedTarget = Arc<Mutex<DeployTarget>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Normal,
    Error,
}

/// Mutable state a target accumulates during one run
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub status: Status,

    /// Why the target entered [`Status::Error`]
    pub failure: Option<String>,

    origin_spec: Option<WorkloadSpec>,
    pub origin_arn: Option<String>,

    /// Desired count observed before this run touched the target
    pub origin_desired_count: Option<u32>,

    /// Task definition arn this run deploys, either reused or newly registered
    pub task_definition_arn: Option<String>,

    /// A new revision was registered during this run
    pub registered: bool,

    /// The service is ACTIVE, or the rule exists
    pub exists: bool,

    pub running_count: u32,
    pub desired_count: u32,
}

impl RunState {
    pub fn with_desired_count(desired_count: u32) -> Self {
        Self {
            desired_count,
            ..Default::default()
        }
    }

    pub fn origin_spec(&self) -> Option<&WorkloadSpec> {
        self.origin_spec.as_ref()
    }

    /// Record the observed spec, keeping the first one seen
    ///
    /// Returns false when an origin was already recorded this run.
    pub fn set_origin(&mut self, spec: WorkloadSpec, arn: String) -> bool {
        if self.origin_spec.is_some() {
            return false;
        }
        self.origin_spec = Some(spec);
        self.origin_arn = Some(arn);
        true
    }

    /// Move to [`Status::Error`]; only the first failure is kept
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.status == Status::Error {
            return;
        }
        self.status = Status::Error;
        self.failure = Some(reason.into());
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    /// The desired containers equal the observed ones after canonicalization
    pub fn matches_origin(&self, spec: &WorkloadSpec) -> bool {
        match &self.origin_spec {
            Some(origin) => same_spec(origin.containers(), spec.containers()),
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub spec: WorkloadSpec,
    pub params: DeployParameters,
    pub service_name: String,
    pub primary_placement: bool,
    pub stop_before_deploy: bool,
    pub placement_strategy: Vec<Value>,
    pub placement_constraints: Vec<Value>,
    pub load_balancers: Vec<Value>,
    pub network_configuration: Option<Value>,
    pub service_registries: Vec<Value>,
    pub state: RunState,
}

impl ServiceTarget {
    /// Placement constraints sent to the cloud, with the distinct-instance
    /// constraint appended when requested
    pub fn resolved_placement_constraints(&self) -> Vec<Value> {
        let mut constraints = self.placement_constraints.clone();
        if self.params.distinct_instance
            && !constraints
                .iter()
                .any(|c| c.get("type").and_then(Value::as_str) == Some("distinctInstance"))
        {
            constraints.push(serde_json::json!({ "type": "distinctInstance" }));
        }
        constraints
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTaskTarget {
    pub spec: WorkloadSpec,
    pub params: DeployParameters,
    pub schedule_expression: String,
    pub placement_strategy: Vec<Value>,
    pub placement_constraints: Vec<Value>,

    /// Rule state written back on deploy; observed state when the rule exists
    pub rule_state: RuleState,

    /// Cluster the currently scheduled revision runs in
    pub origin_cluster: Option<String>,

    pub state: RunState,
}

/// Something the pipeline deploys
#[derive(Debug, Clone)]
pub enum DeployTarget {
    Service(ServiceTarget),
    ScheduledTask(ScheduledTaskTarget),
}

impl DeployTarget {
    pub fn shared(self) -> SharedTarget {
        Arc::new(Mutex::new(self))
    }

    /// Unique name: `<family>-service` for services, the family for tasks
    pub fn identity(&self) -> &str {
        match self {
            DeployTarget::Service(s) => &s.service_name,
            DeployTarget::ScheduledTask(t) => t.spec.family(),
        }
    }

    pub fn family(&self) -> &str {
        self.spec().family()
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            DeployTarget::Service(_) => "service",
            DeployTarget::ScheduledTask(_) => "scheduled task",
        }
    }

    pub fn spec(&self) -> &WorkloadSpec {
        match self {
            DeployTarget::Service(s) => &s.spec,
            DeployTarget::ScheduledTask(t) => &t.spec,
        }
    }

    pub fn params(&self) -> &DeployParameters {
        match self {
            DeployTarget::Service(s) => &s.params,
            DeployTarget::ScheduledTask(t) => &t.params,
        }
    }

    pub fn state(&self) -> &RunState {
        match self {
            DeployTarget::Service(s) => &s.state,
            DeployTarget::ScheduledTask(t) => &t.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut RunState {
        match self {
            DeployTarget::Service(s) => &mut s.state,
            DeployTarget::ScheduledTask(t) => &mut t.state,
        }
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn is_same_spec(&self) -> bool {
        self.state().matches_origin(self.spec())
    }
}
