//! Cloud collaborator surface
//!
//! Every call returns a [`CloudError`] carrying an explicit [`CloudErrorKind`],
//! so callers switch on the kind instead of inspecting error text.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ecs_models::{
    CreateServiceRequest, RuleDescription, ScheduledRuleRequest, ServiceDescription,
    TaskDefinition, UpdateServiceRequest,
};
use serde_json::Value;

pub use memory::InMemoryEcs;

/// Classification of a failed cloud call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudErrorKind {
    /// Service, rule or task definition does not exist
    NotFound,
    /// Request rate exceeded
    Throttling,
    /// A waiter gave up before the resource reached the wanted state
    WaiterTimeout,
    /// Anything else
    Other,
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudErrorKind::NotFound => "not found",
            CloudErrorKind::Throttling => "throttled",
            CloudErrorKind::WaiterTimeout => "waiter timeout",
            CloudErrorKind::Other => "request failed",
        };
        f.write_str(s)
    }
}

/// Error returned by every [`EcsClient`] call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CloudError {
    kind: CloudErrorKind,
    message: String,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, message)
    }

    pub fn waiter_timeout(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::WaiterTimeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Other, message)
    }

    pub fn kind(&self) -> CloudErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }
}

/// Container service and scheduled-rule API consumed by the deployer.
///
/// Implementations must be safe to share across pool workers.
#[async_trait]
pub trait EcsClient: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<String>, CloudError>;

    /// Service arns in a cluster
    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, CloudError>;

    /// Describe services by arn or name; unknown entries are left out of the result
    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> Result<Vec<ServiceDescription>, CloudError>;

    /// Describe one service, NotFound when the cluster does not know it
    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<ServiceDescription, CloudError> {
        let mut found = self.describe_services(cluster, &[service.to_string()]).await?;
        found.pop().ok_or_else(|| {
            CloudError::not_found(format!("service `{}` in cluster `{}`", service, cluster))
        })
    }

    /// Resolve a family, `family:revision` or full arn to a task definition
    async fn describe_task_definition(&self, name_or_arn: &str)
        -> Result<TaskDefinition, CloudError>;

    async fn register_task_definition(&self, document: &Value)
        -> Result<TaskDefinition, CloudError>;

    async fn deregister_task_definition(&self, arn: &str) -> Result<(), CloudError>;

    async fn create_service(
        &self,
        request: &CreateServiceRequest,
    ) -> Result<ServiceDescription, CloudError>;

    /// NotFound when the service does not exist yet
    async fn update_service(
        &self,
        request: &UpdateServiceRequest,
    ) -> Result<ServiceDescription, CloudError>;

    async fn delete_service(&self, cluster: &str, service: &str) -> Result<(), CloudError>;

    /// Block until the service reaches a steady state, WaiterTimeout otherwise
    async fn wait_for_service_stable(
        &self,
        cluster: &str,
        service: &str,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<ServiceDescription, CloudError>;

    async fn list_scheduled_rules(&self) -> Result<Vec<RuleDescription>, CloudError>;

    async fn describe_rule(&self, name: &str) -> Result<RuleDescription, CloudError>;

    async fn create_or_update_scheduled_rule(
        &self,
        request: &ScheduledRuleRequest,
    ) -> Result<(), CloudError>;

    async fn disable_rule(&self, name: &str) -> Result<(), CloudError>;

    async fn delete_scheduled_rule(
        &self,
        name: &str,
        target_arn: Option<&str>,
    ) -> Result<(), CloudError>;

    async fn list_running_tasks(&self, cluster: &str, family: &str)
        -> Result<Vec<String>, CloudError>;

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> Result<(), CloudError>;

    async fn wait_for_tasks_stopped(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<(), CloudError>;
}
