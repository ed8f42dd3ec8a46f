//! Settings file management

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::logs::LogLevel;

pub const DEFAULT_THREADS_COUNT: usize = 10;
pub const DELETE_THREADS_COUNT: usize = 3;
pub const DEFAULT_SERVICE_WAIT_MAX_ATTEMPTS: u32 = 180;
pub const DELETE_SERVICE_WAIT_MAX_ATTEMPTS: u32 = 72;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file here
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Pool size; 10 when deploying, 3 when deleting
    #[serde(default)]
    pub threads_count: Option<usize>,

    /// Stabilization poll attempts; 180 when deploying, 72 when deleting
    #[serde(default)]
    pub service_wait_max_attempts: Option<u32>,

    /// Seconds between stabilization polls
    #[serde(default = "default_service_wait_delay")]
    pub service_wait_delay_secs: u64,

    /// Keep services that were scaled to zero at zero
    #[serde(default = "default_true")]
    pub service_zero_keep: bool,

    /// Honor `stopBeforeDeploy` on services
    #[serde(default = "default_true")]
    pub stop_before_deploy: bool,

    /// Delete services and rules no longer in the manifest
    #[serde(default = "default_true")]
    pub delete_unused_service: bool,

    /// Only point services at the latest registered revision
    #[serde(default)]
    pub service_update_only: bool,

    /// Only register task definitions
    #[serde(default)]
    pub task_definition_update_only: bool,

    /// Deploy only targets whose `SERVICE_GROUP` matches
    #[serde(default)]
    pub deploy_service_group: Option<String>,

    /// Deploy only targets whose `TEMPLATE_GROUP` matches
    #[serde(default)]
    pub template_group: Option<String>,

    /// Retry ceilings for throttled and timed out calls
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_true() -> bool {
    true
}

fn default_service_wait_delay() -> u64 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            threads_count: None,
            service_wait_max_attempts: None,
            service_wait_delay_secs: default_service_wait_delay(),
            service_zero_keep: true,
            stop_before_deploy: true,
            delete_unused_service: true,
            service_update_only: false,
            task_definition_update_only: false,
            deploy_service_group: None,
            template_group: None,
            retry: RetrySettings::default(),
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_register_max_retries")]
    pub register_max_retries: u32,

    #[serde(default = "default_register_delay")]
    pub register_delay_secs: u64,

    #[serde(default = "default_deregister_max_retries")]
    pub deregister_max_retries: u32,

    #[serde(default = "default_deregister_delay")]
    pub deregister_delay_secs: u64,

    /// Extra waits after a stabilization waiter times out
    #[serde(default = "default_wait_max_retries")]
    pub wait_stable_max_retries: u32,

    /// Extra waits after a task-stopped waiter times out
    #[serde(default = "default_wait_max_retries")]
    pub wait_stopped_max_retries: u32,
}

fn default_register_max_retries() -> u32 {
    7
}

fn default_register_delay() -> u64 {
    10
}

fn default_deregister_max_retries() -> u32 {
    4
}

fn default_deregister_delay() -> u64 {
    3
}

fn default_wait_max_retries() -> u32 {
    3
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            register_max_retries: default_register_max_retries(),
            register_delay_secs: default_register_delay(),
            deregister_max_retries: default_deregister_max_retries(),
            deregister_delay_secs: default_deregister_delay(),
            wait_stable_max_retries: default_wait_max_retries(),
            wait_stopped_max_retries: default_wait_max_retries(),
        }
    }
}

impl Settings {
    /// Apply `--key=value` command line overrides
    ///
    /// Keys may use dashes or underscores. Keys that are not settings are ignored.
    pub fn apply_overrides(&mut self, args: &HashMap<String, String>) -> Result<(), DeployError> {
        for (raw_key, value) in args {
            let key = raw_key.replace('-', "_");
            match key.as_str() {
                "log_level" => {
                    self.log_level = value.parse().map_err(DeployError::ConfigError)?;
                }
                "log_json" => self.log_json = parse_flag(&key, value)?,
                "log_dir" => self.log_dir = Some(PathBuf::from(value)),
                "threads_count" => self.threads_count = Some(parse_number(&key, value)?),
                "service_wait_max_attempts" => {
                    self.service_wait_max_attempts = Some(parse_number(&key, value)?);
                }
                "service_wait_delay" | "service_wait_delay_secs" => {
                    self.service_wait_delay_secs = parse_number(&key, value)?;
                }
                "service_zero_keep" => self.service_zero_keep = parse_flag(&key, value)?,
                "stop_before_deploy" => self.stop_before_deploy = parse_flag(&key, value)?,
                "delete_unused_service" => self.delete_unused_service = parse_flag(&key, value)?,
                "service_update_only" => self.service_update_only = parse_flag(&key, value)?,
                "task_definition_update_only" => {
                    self.task_definition_update_only = parse_flag(&key, value)?;
                }
                "deploy_service_group" => self.deploy_service_group = Some(value.clone()),
                "template_group" => self.template_group = Some(value.clone()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject contradictory settings before any cloud call
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.service_update_only && self.task_definition_update_only {
            return Err(DeployError::ConfigError(
                "`service_update_only` and `task_definition_update_only` cannot both be set"
                    .to_string(),
            ));
        }
        if self.threads_count == Some(0) {
            return Err(DeployError::ConfigError(
                "`threads_count` must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, DeployError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(DeployError::ConfigError(format!(
            "`{}` expects true or false, got `{}`",
            key, value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, DeployError> {
    value.parse().map_err(|_| {
        DeployError::ConfigError(format!("`{}` expects a number, got `{}`", key, value))
    })
}
