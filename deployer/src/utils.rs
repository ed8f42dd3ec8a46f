//! Utility functions

use serde::{Deserialize, Serialize};

/// Version information for the deployer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    /// Cargo profile the binary was built with (`debug` or `release`)
    pub profile: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        profile: option_env!("BUILD_PROFILE").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Last path segment of an arn, or the input itself when it has none
///
/// `arn:aws:ecs:region:account:service/cluster/web` yields `web`,
/// `arn:aws:ecs:region:account:task-definition/web:3` yields `web:3`.
pub fn arn_to_name(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}
