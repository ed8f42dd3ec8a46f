//! Deploy parameters carried in a workload's environment block
//!
//! The renderer injects these keys into the first container's environment.
//! `ENVIRONMENT` and `CLUSTER_NAME` are always required, plus `DESIRED_COUNT`
//! for services or `TASK_COUNT` for scheduled tasks.

use crate::errors::DeployError;
use crate::models::spec::WorkloadSpec;

pub const ENVIRONMENT: &str = "ENVIRONMENT";
pub const CLUSTER_NAME: &str = "CLUSTER_NAME";
pub const SERVICE_GROUP: &str = "SERVICE_GROUP";
pub const TEMPLATE_GROUP: &str = "TEMPLATE_GROUP";
pub const DESIRED_COUNT: &str = "DESIRED_COUNT";
pub const TASK_COUNT: &str = "TASK_COUNT";
pub const MINIMUM_HEALTHY_PERCENT: &str = "MINIMUM_HEALTHY_PERCENT";
pub const MAXIMUM_PERCENT: &str = "MAXIMUM_PERCENT";
pub const DISTINCT_INSTANCE: &str = "DISTINCT_INSTANCE";
pub const TARGET_LAMBDA_ARN: &str = "TARGET_LAMBDA_ARN";

const DEFAULT_MINIMUM_HEALTHY_PERCENT: u32 = 50;
const DEFAULT_MAXIMUM_PERCENT: u32 = 200;

/// Which contract a workload is parsed under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Service,
    ScheduledTask,
}

impl TargetKind {
    fn count_key(&self) -> &'static str {
        match self {
            TargetKind::Service => DESIRED_COUNT,
            TargetKind::ScheduledTask => TASK_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployParameters {
    pub environment: String,
    pub cluster_name: String,
    pub service_group: Option<String>,
    pub template_group: Option<String>,

    /// `DESIRED_COUNT` for services, `TASK_COUNT` for scheduled tasks
    pub count: u32,

    pub minimum_healthy_percent: u32,
    pub maximum_percent: u32,
    pub distinct_instance: bool,

    /// Scheduled tasks only
    pub target_lambda_arn: Option<String>,
}

impl DeployParameters {
    pub fn parse(spec: &WorkloadSpec, kind: TargetKind) -> Result<Self, DeployError> {
        let entries = spec.environment().ok_or_else(|| {
            DeployError::ConfigError(format!(
                "task definition `{}` is lack of environment.\ntask definition:\n{}",
                spec.family(),
                spec.document()
            ))
        })?;

        let environment = require(spec, &entries, ENVIRONMENT)?.to_string();
        let cluster_name = require(spec, &entries, CLUSTER_NAME)?.to_string();
        let count_key = kind.count_key();
        let count = parse_u32(spec, count_key, require(spec, &entries, count_key)?)?;

        let minimum_healthy_percent = match lookup(&entries, MINIMUM_HEALTHY_PERCENT) {
            Some(value) => parse_u32(spec, MINIMUM_HEALTHY_PERCENT, value)?,
            None => DEFAULT_MINIMUM_HEALTHY_PERCENT,
        };
        let maximum_percent = match lookup(&entries, MAXIMUM_PERCENT) {
            Some(value) => parse_u32(spec, MAXIMUM_PERCENT, value)?,
            None => DEFAULT_MAXIMUM_PERCENT,
        };
        let distinct_instance = match lookup(&entries, DISTINCT_INSTANCE) {
            Some(value) => parse_bool(spec, DISTINCT_INSTANCE, value)?,
            None => false,
        };
        let target_lambda_arn = match kind {
            TargetKind::ScheduledTask => lookup(&entries, TARGET_LAMBDA_ARN).map(str::to_string),
            TargetKind::Service => None,
        };

        Ok(Self {
            environment,
            cluster_name,
            service_group: lookup(&entries, SERVICE_GROUP).map(str::to_string),
            template_group: lookup(&entries, TEMPLATE_GROUP).map(str::to_string),
            count,
            minimum_healthy_percent,
            maximum_percent,
            distinct_instance,
            target_lambda_arn,
        })
    }
}

/// Later entries win, matching how the renderer appends injected keys
fn lookup<'a>(entries: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .rev()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| *value)
}

fn require<'a>(
    spec: &WorkloadSpec,
    entries: &[(&'a str, &'a str)],
    key: &str,
) -> Result<&'a str, DeployError> {
    lookup(entries, key).ok_or_else(|| {
        DeployError::ConfigError(format!(
            "task definition `{}` is lack of environment `{}`.\ntask definition:\n{}",
            spec.family(),
            key,
            spec.document()
        ))
    })
}

fn parse_u32(spec: &WorkloadSpec, key: &str, value: &str) -> Result<u32, DeployError> {
    value.trim().parse().map_err(|_| {
        DeployError::ConfigError(format!(
            "task definition `{}` environment `{}` must be a non-negative integer, got `{}`",
            spec.family(),
            key,
            value
        ))
    })
}

fn parse_bool(spec: &WorkloadSpec, key: &str, value: &str) -> Result<bool, DeployError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Ok(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Ok(false),
        _ => Err(DeployError::ConfigError(format!(
            "task definition `{}` environment `{}` must be a boolean, got `{}`",
            spec.family(),
            key,
            value
        ))),
    }
}
