//! In-process implementation of the cloud surface
//!
//! Backs the `--state-file` sandbox mode and the test suite. Every call is
//! recorded with start and finish ticks of a shared logical clock, and faults
//! can be injected per operation and subject.
//!
//! Subjects used for recording and fault matching:
//! - service calls: the service name
//! - task definition calls: the family
//! - rule calls: the rule name
//! - task calls: the family (`list_running_tasks`), the task arn (`stop_task`)
//!   or the cluster (`wait_for_tasks_stopped`)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ecs_models::{
    CreateServiceRequest, RuleDescription, RuleState, ScheduledRuleRequest, ServiceDescription,
    TaskDefinition, UpdateServiceRequest, SERVICE_STATUS_ACTIVE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cloud::{CloudError, CloudErrorKind, EcsClient};
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::utils::arn_to_name;

const ECS_ARN_PREFIX: &str = "arn:aws:ecs:local:000000000000";
const EVENTS_ARN_PREFIX: &str = "arn:aws:events:local:000000000000";

/// Serializable cloud state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    /// cluster name -> service name -> description
    #[serde(default)]
    pub clusters: BTreeMap<String, BTreeMap<String, ServiceDescription>>,

    /// family -> revisions, oldest first
    #[serde(default)]
    pub task_definitions: BTreeMap<String, Vec<StoredTaskDefinition>>,

    #[serde(default)]
    pub rules: BTreeMap<String, StoredRule>,

    #[serde(default)]
    pub tasks: Vec<RunningTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTaskDefinition {
    pub definition: TaskDefinition,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRule {
    pub rule: RuleDescription,

    /// Last run-task target written for the rule
    #[serde(default)]
    pub target: Option<ScheduledRuleRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    pub cluster: String,
    pub family: String,
    pub task_arn: String,
    pub stopped: bool,
}

/// One recorded call against the in-memory cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: &'static str,
    pub subject: String,
    pub started: u64,
    pub finished: u64,
    pub failed: bool,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: &'static str,
    subject: String,
    kind: CloudErrorKind,
    remaining: u32,
}

/// In-memory container service
pub struct InMemoryEcs {
    state: Mutex<ClusterState>,
    calls: Mutex<Vec<CallRecord>>,
    faults: Mutex<Vec<Fault>>,
    clock: AtomicU64,
    latency: Duration,
}

impl Default for InMemoryEcs {
    fn default() -> Self {
        Self::from_state(ClusterState::default())
    }
}

impl InMemoryEcs {
    pub fn from_state(state: ClusterState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Start with empty clusters of the given names
    pub fn with_clusters(names: &[&str]) -> Self {
        let mut state = ClusterState::default();
        for name in names {
            state.clusters.insert(name.to_string(), BTreeMap::new());
        }
        Self::from_state(state)
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Load sandbox state, starting empty when the file does not exist yet
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        let state: ClusterState = file.read_json().await?;
        Ok(Self::from_state(state))
    }

    /// Persist sandbox state
    pub async fn save(&self, file: &File) -> Result<(), DeployError> {
        let state = self.state.lock().await;
        file.write_json(&*state).await
    }

    pub async fn snapshot(&self) -> ClusterState {
        self.state.lock().await.clone()
    }

    /// Fail the next `times` calls of `operation` on `subject` with `kind`
    pub async fn fail(
        &self,
        operation: &'static str,
        subject: &str,
        kind: CloudErrorKind,
        times: u32,
    ) {
        self.faults.lock().await.push(Fault {
            operation,
            subject: subject.to_string(),
            kind,
            remaining: times,
        });
    }

    pub async fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().await.clone()
    }

    /// Recorded calls of one operation, in completion order
    pub async fn calls_of(&self, operation: &str) -> Vec<CallRecord> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    // ============================== SEEDING ============================== //

    /// Register `document` and run it as `<family>-service` with every task up
    pub async fn seed_service(
        &self,
        cluster: &str,
        document: Value,
        desired_count: u32,
    ) -> Result<ServiceDescription, CloudError> {
        let mut state = self.state.lock().await;
        let definition = register(&mut state, &document)?;
        let service_name = format!("{}-service", definition.family);
        let description = ServiceDescription {
            service_name: service_name.clone(),
            cluster_arn: cluster_arn(cluster),
            task_definition: definition.task_definition_arn,
            running_count: desired_count,
            desired_count,
            status: SERVICE_STATUS_ACTIVE.to_string(),
        };
        state
            .clusters
            .entry(cluster.to_string())
            .or_default()
            .insert(service_name, description.clone());
        Ok(description)
    }

    /// Register `document` and schedule it under a rule named after its family
    pub async fn seed_rule(
        &self,
        document: Value,
        schedule_expression: &str,
        rule_state: RuleState,
        description: &str,
    ) -> Result<RuleDescription, CloudError> {
        let mut state = self.state.lock().await;
        let definition = register(&mut state, &document)?;
        let rule = RuleDescription {
            name: definition.family.clone(),
            arn: format!("{}:rule/{}", EVENTS_ARN_PREFIX, definition.family),
            state: rule_state,
            description: Some(description.to_string()),
            schedule_expression: Some(schedule_expression.to_string()),
        };
        state.rules.insert(
            definition.family,
            StoredRule {
                rule: rule.clone(),
                target: None,
            },
        );
        Ok(rule)
    }

    /// Start a task instance of `family`, returning its arn
    pub async fn seed_running_task(&self, cluster: &str, family: &str) -> String {
        let task_arn = format!(
            "{}:task/{}/{}",
            ECS_ARN_PREFIX,
            cluster,
            uuid::Uuid::new_v4().simple()
        );
        self.state.lock().await.tasks.push(RunningTask {
            cluster: cluster.to_string(),
            family: family.to_string(),
            task_arn: task_arn.clone(),
            stopped: false,
        });
        task_arn
    }

    // ============================== QUERIES ============================== //

    pub async fn service(&self, cluster: &str, name: &str) -> Option<ServiceDescription> {
        self.state
            .lock()
            .await
            .clusters
            .get(cluster)
            .and_then(|services| services.get(name))
            .cloned()
    }

    pub async fn rule(&self, name: &str) -> Option<StoredRule> {
        self.state.lock().await.rules.get(name).cloned()
    }

    pub async fn revisions(&self, family: &str) -> Vec<StoredTaskDefinition> {
        self.state
            .lock()
            .await
            .task_definitions
            .get(family)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn running_tasks(&self, cluster: &str, family: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .tasks
            .iter()
            .filter(|t| t.cluster == cluster && t.family == family && !t.stopped)
            .map(|t| t.task_arn.clone())
            .collect()
    }

    // ============================== INTERNALS ============================== //

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    async fn take_fault(&self, operation: &'static str, subject: &str) -> Option<CloudError> {
        let mut faults = self.faults.lock().await;
        let fault = faults
            .iter_mut()
            .find(|f| f.operation == operation && f.subject == subject && f.remaining > 0)?;
        fault.remaining -= 1;
        Some(CloudError::new(
            fault.kind,
            format!("injected failure for {} on `{}`", operation, subject),
        ))
    }

    async fn call<T, F>(
        &self,
        operation: &'static str,
        subject: &str,
        f: F,
    ) -> Result<T, CloudError>
    where
        F: FnOnce(&mut ClusterState) -> Result<T, CloudError> + Send,
        T: Send,
    {
        let started = self.tick();
        debug!("cloud call {} `{}`", operation, subject);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match self.take_fault(operation, subject).await {
            Some(err) => Err(err),
            None => {
                let mut state = self.state.lock().await;
                f(&mut state)
            }
        };

        let finished = self.tick();
        self.calls.lock().await.push(CallRecord {
            operation,
            subject: subject.to_string(),
            started,
            finished,
            failed: result.is_err(),
        });
        result
    }
}

fn cluster_arn(cluster: &str) -> String {
    format!("{}:cluster/{}", ECS_ARN_PREFIX, cluster)
}

fn service_arn(cluster: &str, service: &str) -> String {
    format!("{}:service/{}/{}", ECS_ARN_PREFIX, cluster, service)
}

/// Family part of a family, `family:revision` or task definition arn
fn family_of(name_or_arn: &str) -> &str {
    let name = arn_to_name(name_or_arn);
    name.split_once(':').map(|(family, _)| family).unwrap_or(name)
}

fn register(state: &mut ClusterState, document: &Value) -> Result<TaskDefinition, CloudError> {
    let family = document
        .get("family")
        .and_then(Value::as_str)
        .ok_or_else(|| CloudError::other("task definition requires `family`"))?
        .to_string();
    let revisions = state.task_definitions.entry(family.clone()).or_default();
    let revision = revisions.len() as u32 + 1;
    let definition = TaskDefinition {
        task_definition_arn: format!("{}:task-definition/{}:{}", ECS_ARN_PREFIX, family, revision),
        family,
        revision,
        document: document.clone(),
    };
    revisions.push(StoredTaskDefinition {
        definition: definition.clone(),
        active: true,
    });
    Ok(definition)
}

fn resolve<'a>(state: &'a ClusterState, name_or_arn: &str) -> Option<&'a StoredTaskDefinition> {
    let name = arn_to_name(name_or_arn);
    let (family, revision) = match name.split_once(':') {
        Some((family, revision)) => (family, revision.parse::<u32>().ok()),
        None => (name, None),
    };
    let revisions = state.task_definitions.get(family)?;
    match revision {
        Some(revision) => revisions.iter().find(|t| t.definition.revision == revision),
        None => revisions.iter().rev().find(|t| t.active),
    }
}

fn resolve_arn(state: &ClusterState, name_or_arn: &str) -> Result<String, CloudError> {
    resolve(state, name_or_arn)
        .map(|t| t.definition.task_definition_arn.clone())
        .ok_or_else(|| CloudError::other(format!("task definition `{}` is not registered", name_or_arn)))
}

fn cluster_mut<'a>(
    state: &'a mut ClusterState,
    cluster: &str,
) -> Result<&'a mut BTreeMap<String, ServiceDescription>, CloudError> {
    state
        .clusters
        .get_mut(cluster)
        .ok_or_else(|| CloudError::other(format!("cluster `{}` not found", cluster)))
}

#[async_trait]
impl EcsClient for InMemoryEcs {
    async fn list_clusters(&self) -> Result<Vec<String>, CloudError> {
        self.call("list_clusters", "", |state| {
            Ok(state.clusters.keys().cloned().collect())
        })
        .await
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, CloudError> {
        self.call("list_services", cluster, |state| {
            let services = cluster_mut(state, cluster)?;
            Ok(services.keys().map(|name| service_arn(cluster, name)).collect())
        })
        .await
    }

    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> Result<Vec<ServiceDescription>, CloudError> {
        let subject = services.join(",");
        self.call("describe_services", &subject, |state| {
            let known = cluster_mut(state, cluster)?;
            Ok(services
                .iter()
                .filter_map(|s| known.get(arn_to_name(s)).cloned())
                .collect())
        })
        .await
    }

    async fn describe_task_definition(
        &self,
        name_or_arn: &str,
    ) -> Result<TaskDefinition, CloudError> {
        self.call("describe_task_definition", family_of(name_or_arn), |state| {
            resolve(state, name_or_arn)
                .map(|t| t.definition.clone())
                .ok_or_else(|| {
                    CloudError::not_found(format!("task definition `{}`", name_or_arn))
                })
        })
        .await
    }

    async fn register_task_definition(
        &self,
        document: &Value,
    ) -> Result<TaskDefinition, CloudError> {
        let family = document
            .get("family")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.call("register_task_definition", &family, |state| {
            register(state, document)
        })
        .await
    }

    async fn deregister_task_definition(&self, arn: &str) -> Result<(), CloudError> {
        self.call("deregister_task_definition", family_of(arn), |state| {
            let family = family_of(arn).to_string();
            let stored = state
                .task_definitions
                .get_mut(&family)
                .and_then(|revisions| {
                    revisions
                        .iter_mut()
                        .find(|t| t.definition.task_definition_arn == arn)
                })
                .ok_or_else(|| CloudError::other(format!("task definition `{}` is not registered", arn)))?;
            stored.active = false;
            Ok(())
        })
        .await
    }

    async fn create_service(
        &self,
        request: &CreateServiceRequest,
    ) -> Result<ServiceDescription, CloudError> {
        self.call("create_service", &request.service_name, |state| {
            let task_definition = resolve_arn(state, &request.task_definition)?;
            let services = cluster_mut(state, &request.cluster)?;
            if services
                .get(&request.service_name)
                .is_some_and(|s| s.is_active())
            {
                return Err(CloudError::other(format!(
                    "service `{}` already exists",
                    request.service_name
                )));
            }
            let description = ServiceDescription {
                service_name: request.service_name.clone(),
                cluster_arn: cluster_arn(&request.cluster),
                task_definition,
                running_count: 0,
                desired_count: request.desired_count,
                status: SERVICE_STATUS_ACTIVE.to_string(),
            };
            services.insert(request.service_name.clone(), description.clone());
            Ok(description)
        })
        .await
    }

    async fn update_service(
        &self,
        request: &UpdateServiceRequest,
    ) -> Result<ServiceDescription, CloudError> {
        self.call("update_service", &request.service, |state| {
            let missing = !cluster_mut(state, &request.cluster)?
                .get(&request.service)
                .is_some_and(|s| s.is_active());
            if missing {
                return Err(CloudError::not_found(format!("service `{}`", request.service)));
            }
            let task_definition = resolve_arn(state, &request.task_definition)?;
            let service = cluster_mut(state, &request.cluster)?
                .get_mut(&request.service)
                .ok_or_else(|| CloudError::not_found(format!("service `{}`", request.service)))?;
            service.task_definition = task_definition;
            service.desired_count = request.desired_count;
            Ok(service.clone())
        })
        .await
    }

    async fn delete_service(&self, cluster: &str, service: &str) -> Result<(), CloudError> {
        self.call("delete_service", service, |state| {
            cluster_mut(state, cluster)?
                .remove(service)
                .map(|_| ())
                .ok_or_else(|| CloudError::not_found(format!("service `{}`", service)))
        })
        .await
    }

    async fn wait_for_service_stable(
        &self,
        cluster: &str,
        service: &str,
        _max_attempts: u32,
        _delay: Duration,
    ) -> Result<ServiceDescription, CloudError> {
        self.call("wait_for_service_stable", service, |state| {
            let found = cluster_mut(state, cluster)?
                .get_mut(service)
                .ok_or_else(|| CloudError::not_found(format!("service `{}`", service)))?;
            found.running_count = found.desired_count;
            Ok(found.clone())
        })
        .await
    }

    async fn list_scheduled_rules(&self) -> Result<Vec<RuleDescription>, CloudError> {
        self.call("list_scheduled_rules", "", |state| {
            Ok(state.rules.values().map(|r| r.rule.clone()).collect())
        })
        .await
    }

    async fn describe_rule(&self, name: &str) -> Result<RuleDescription, CloudError> {
        self.call("describe_rule", name, |state| {
            state
                .rules
                .get(name)
                .map(|r| r.rule.clone())
                .ok_or_else(|| CloudError::not_found(format!("rule `{}`", name)))
        })
        .await
    }

    async fn create_or_update_scheduled_rule(
        &self,
        request: &ScheduledRuleRequest,
    ) -> Result<(), CloudError> {
        self.call("create_or_update_scheduled_rule", &request.name, |state| {
            resolve_arn(state, &request.task_definition_arn)?;
            let rule = RuleDescription {
                name: request.name.clone(),
                arn: format!("{}:rule/{}", EVENTS_ARN_PREFIX, request.name),
                state: request.state,
                description: Some(request.description.clone()),
                schedule_expression: Some(request.schedule_expression.clone()),
            };
            state.rules.insert(
                request.name.clone(),
                StoredRule {
                    rule,
                    target: Some(request.clone()),
                },
            );
            Ok(())
        })
        .await
    }

    async fn disable_rule(&self, name: &str) -> Result<(), CloudError> {
        self.call("disable_rule", name, |state| {
            let stored = state
                .rules
                .get_mut(name)
                .ok_or_else(|| CloudError::not_found(format!("rule `{}`", name)))?;
            stored.rule.state = RuleState::Disabled;
            Ok(())
        })
        .await
    }

    async fn delete_scheduled_rule(
        &self,
        name: &str,
        _target_arn: Option<&str>,
    ) -> Result<(), CloudError> {
        self.call("delete_scheduled_rule", name, |state| {
            state
                .rules
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| CloudError::not_found(format!("rule `{}`", name)))
        })
        .await
    }

    async fn list_running_tasks(
        &self,
        cluster: &str,
        family: &str,
    ) -> Result<Vec<String>, CloudError> {
        self.call("list_running_tasks", family, |state| {
            Ok(state
                .tasks
                .iter()
                .filter(|t| t.cluster == cluster && t.family == family && !t.stopped)
                .map(|t| t.task_arn.clone())
                .collect())
        })
        .await
    }

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> Result<(), CloudError> {
        self.call("stop_task", task_arn, |state| {
            let task = state
                .tasks
                .iter_mut()
                .find(|t| t.cluster == cluster && t.task_arn == task_arn)
                .ok_or_else(|| CloudError::not_found(format!("task `{}`", task_arn)))?;
            task.stopped = true;
            Ok(())
        })
        .await
    }

    async fn wait_for_tasks_stopped(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<(), CloudError> {
        self.call("wait_for_tasks_stopped", cluster, |state| {
            let pending = state
                .tasks
                .iter()
                .filter(|t| t.cluster == cluster && task_arns.contains(&t.task_arn) && !t.stopped)
                .count();
            if pending > 0 {
                return Err(CloudError::waiter_timeout(format!(
                    "{} task(s) still running",
                    pending
                )));
            }
            Ok(())
        })
        .await
    }
}
