//! Bounded retries for cloud calls that may be throttled or time out

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::cloud::{CloudError, CloudErrorKind};
use crate::storage::settings::RetrySettings;

/// Retry a call on one error kind, a fixed number of extra times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    pub delay: Duration,
    pub retry_on: CloudErrorKind,
}

impl RetryPolicy {
    pub fn new(retry_on: CloudErrorKind, max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            retry_on,
        }
    }

    /// Run `call` until it succeeds, fails with another kind, or the
    /// retries are used up
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == self.retry_on && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        "{} failed ({}), retry {}/{}",
                        what, err, retries, self.max_retries
                    );
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Policies for every retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicies {
    pub register: RetryPolicy,
    pub deregister: RetryPolicy,
    pub wait_stable: RetryPolicy,
    pub wait_stopped: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            register: RetryPolicy::new(
                CloudErrorKind::Throttling,
                settings.register_max_retries,
                Duration::from_secs(settings.register_delay_secs),
            ),
            deregister: RetryPolicy::new(
                CloudErrorKind::Throttling,
                settings.deregister_max_retries,
                Duration::from_secs(settings.deregister_delay_secs),
            ),
            // the waiters poll on their own, so there is nothing to sleep for
            wait_stable: RetryPolicy::new(
                CloudErrorKind::WaiterTimeout,
                settings.wait_stable_max_retries,
                Duration::ZERO,
            ),
            wait_stopped: RetryPolicy::new(
                CloudErrorKind::WaiterTimeout,
                settings.wait_stopped_max_retries,
                Duration::ZERO,
            ),
        }
    }

    /// Same ceilings with every delay removed
    pub fn without_delay(mut self) -> Self {
        self.register.delay = Duration::ZERO;
        self.deregister.delay = Duration::ZERO;
        self.wait_stable.delay = Duration::ZERO;
        self.wait_stopped.delay = Duration::ZERO;
        self
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
