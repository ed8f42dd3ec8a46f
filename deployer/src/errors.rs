//! Error types for the deployer

use thiserror::Error;

use crate::cloud::CloudError;

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Deployment error: {0}")]
    DeployFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// True for errors that must abort the run before any cloud mutation
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, DeployError::ConfigError(_))
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
