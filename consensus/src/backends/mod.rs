//! Storage backends for the lease record
//!
//! The [`Backend`] trait is the only seam the election loop depends on. Each
//! implementation owns the exclusivity guarantee for its lease record:
//!
//! - [`file::FileBackend`]: a JSON record guarded by an exclusive `flock`
//! - [`kubernetes::KubernetesBackend`]: a `coordination.k8s.io/v1` Lease
//!   updated under optimistic concurrency

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ElectionError, Result};

pub mod file;
pub mod kubernetes;

/// Durable, externally arbitrated storage for one lease record
///
/// Contested outcomes are reported as `Ok(false)` from [`Backend::try_acquire`];
/// errors are reserved for storage and transport failures. A blank identity
/// is rejected with [`ElectionError::InvalidConfig`] since it would read as
/// "no holder".
#[async_trait]
pub trait Backend: Send + Sync {
    /// Attempt to become (or remain) the holder of the lease
    ///
    /// Returns `Ok(true)` when `identity` holds the lease afterwards and
    /// `Ok(false)` when another identity validly holds it or won a race.
    async fn try_acquire(&self, identity: &str, lease_duration: Duration) -> Result<bool>;

    /// Extend the lease held by `identity`
    ///
    /// Fails with [`ElectionError::NotHolder`](crate::ElectionError::NotHolder)
    /// if another identity holds the record.
    async fn renew(&self, identity: &str, lease_duration: Duration) -> Result<()>;

    /// Give up the lease if `identity` holds it
    ///
    /// Releasing a lease that is absent or held by someone else succeeds.
    async fn release(&self, identity: &str) -> Result<()>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn try_acquire(&self, identity: &str, lease_duration: Duration) -> Result<bool> {
        (**self).try_acquire(identity, lease_duration).await
    }

    async fn renew(&self, identity: &str, lease_duration: Duration) -> Result<()> {
        (**self).renew(identity, lease_duration).await
    }

    async fn release(&self, identity: &str) -> Result<()> {
        (**self).release(identity).await
    }
}

/// Whether a lease renewed at `renew_time` is still valid at `now`
pub(crate) fn lease_valid(
    renew_time: DateTime<Utc>,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> bool {
    match chrono::Duration::from_std(lease_duration) {
        Ok(ttl) => now.signed_duration_since(renew_time) < ttl,
        // Out of chrono's range: never expires
        Err(_) => true,
    }
}

/// Reject identities that could be confused with "no holder"
pub(crate) fn check_identity(identity: &str) -> Result<()> {
    if identity.trim().is_empty() {
        return Err(ElectionError::InvalidConfig(
            "identity must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_valid_within_duration() {
        let now = Utc::now();
        let renewed = now - chrono::Duration::milliseconds(500);
        assert!(lease_valid(renewed, Duration::from_secs(1), now));
    }

    #[test]
    fn test_lease_expires_at_duration() {
        let now = Utc::now();
        let renewed = now - chrono::Duration::seconds(1);
        assert!(!lease_valid(renewed, Duration::from_secs(1), now));
    }

    #[test]
    fn test_future_renew_time_is_valid() {
        let now = Utc::now();
        let renewed = now + chrono::Duration::seconds(5);
        assert!(lease_valid(renewed, Duration::from_secs(1), now));
    }

    #[test]
    fn test_blank_identity_is_rejected() {
        assert!(matches!(
            check_identity(""),
            Err(ElectionError::InvalidConfig(_))
        ));
        assert!(check_identity("  ").is_err());
        assert!(check_identity("a").is_ok());
    }
}
