//! Election tuning parameters

use std::time::Duration;

use crate::error::{ElectionError, Result};

/// Default time an unrenewed lease stays valid
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Default interval between renewals while leader
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between acquisition attempts while follower
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for a leader election [`Manager`](crate::Manager)
///
/// ```
/// use std::time::Duration;
/// use consensus::Config;
///
/// let config = Config::new("worker-0")
///     .with_lease_duration(Duration::from_secs(10))
///     .with_renew_interval(Duration::from_secs(3));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Unique, stable name of this process instance (e.g. the pod name)
    pub identity: String,
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How often the leader renews its lease
    pub renew_interval: Duration,
    /// How often a follower retries acquisition
    pub retry_interval: Duration,
}

impl Config {
    /// Create a configuration with default timings
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Set the lease duration
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the renewal interval
    pub fn with_renew_interval(mut self, renew_interval: Duration) -> Self {
        self.renew_interval = renew_interval;
        self
    }

    /// Set the acquisition retry interval
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Check the configuration for values the election loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(ElectionError::InvalidConfig(
                "identity must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("lease_duration", self.lease_duration),
            ("renew_interval", self.renew_interval),
            ("retry_interval", self.retry_interval),
        ] {
            if value.is_zero() {
                return Err(ElectionError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.renew_interval >= self.lease_duration {
            return Err(ElectionError::InvalidConfig(format!(
                "renew_interval ({:?}) must be shorter than lease_duration ({:?})",
                self.renew_interval, self.lease_duration
            )));
        }

        Ok(())
    }
}
