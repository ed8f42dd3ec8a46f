//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::retry::RetryPolicies;
use crate::deploy::{operations, pipeline};
use crate::models::manifest::TargetFilter;
use crate::storage::settings::{
    Settings, DEFAULT_SERVICE_WAIT_MAX_ATTEMPTS, DEFAULT_THREADS_COUNT,
    DELETE_SERVICE_WAIT_MAX_ATTEMPTS, DELETE_THREADS_COUNT,
};

/// Sandbox state file used when `--state-file` is not given
pub const DEFAULT_STATE_FILE: &str = ".ecs-deployer/state.json";

/// What the invocation does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Deploy the services and scheduled tasks of a manifest
    Service { manifest: PathBuf, dry_run: bool },

    /// Delete everything managed in one environment
    Delete { environment: String, force: bool },
}

impl Command {
    pub fn is_delete(&self) -> bool {
        matches!(self, Command::Delete { .. })
    }

    /// Whether the run may change cloud state
    pub fn mutates(&self) -> bool {
        !matches!(self, Command::Service { dry_run: true, .. })
    }
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub command: Command,

    /// Local sandbox state backing the cloud client
    pub state_file: PathBuf,

    /// Which manifest targets this run deploys
    pub filter: TargetFilter,

    pub pipeline: pipeline::Options,
}

impl AppOptions {
    /// Resolve settings for `command`, applying the per-command defaults
    pub fn new(command: Command, settings: &Settings, state_file: Option<PathBuf>) -> Self {
        let delete = command.is_delete();
        let threads_count = settings.threads_count.unwrap_or(if delete {
            DELETE_THREADS_COUNT
        } else {
            DEFAULT_THREADS_COUNT
        });
        let service_wait_max_attempts = settings.service_wait_max_attempts.unwrap_or(if delete {
            DELETE_SERVICE_WAIT_MAX_ATTEMPTS
        } else {
            DEFAULT_SERVICE_WAIT_MAX_ATTEMPTS
        });

        Self {
            command,
            state_file: state_file.unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            filter: TargetFilter {
                service_group: settings.deploy_service_group.clone(),
                template_group: settings.template_group.clone(),
            },
            pipeline: pipeline::Options {
                threads_count,
                stop_before_deploy: settings.stop_before_deploy,
                // the delete command exists to delete
                delete_unused_service: delete || settings.delete_unused_service,
                template_group: settings.template_group.clone(),
                operator: operations::Options {
                    service_zero_keep: settings.service_zero_keep,
                    service_update_only: settings.service_update_only,
                    task_definition_update_only: settings.task_definition_update_only,
                    service_wait_max_attempts,
                    service_wait_delay: Duration::from_secs(settings.service_wait_delay_secs),
                    retry: RetryPolicies::from_settings(&settings.retry),
                },
            },
        }
    }
}
