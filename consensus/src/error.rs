//! Error types for leader election

use std::io;
use std::time::Duration;

/// Errors that can occur during leader election
///
/// A contested acquisition is not an error: backends report it as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// Configuration rejected before the election started
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to create or open the lease record file
    #[error("Failed to create lock file: {0}")]
    LockFileCreation(#[source] io::Error),

    /// Failed to take the exclusive lock on the lease record file
    #[error("Failed to acquire lock: {0}")]
    LockAcquisition(#[source] io::Error),

    /// Reading, writing or flushing the lease record failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The lease record could not be decoded or encoded
    #[error("Malformed lease record: {0}")]
    RecordFormat(#[from] serde_json::Error),

    /// A renewal was attempted by an identity that does not hold the lease
    #[error("{identity} is not the lease holder (holder: {})", .holder.as_deref().unwrap_or("<none>"))]
    NotHolder {
        /// Identity that attempted the operation
        identity: String,
        /// Identity recorded as holder, if any
        holder: Option<String>,
    },

    /// An optimistic write was rejected because the record changed underneath it
    #[error("Lease {name} was modified concurrently")]
    UpdateConflict {
        /// Name of the lease object
        name: String,
    },

    /// Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    /// A wait was cancelled before leadership was gained
    #[error("Wait for leadership cancelled")]
    Cancelled,

    /// The shutdown release did not complete in time
    #[error("Lease release timed out after {0:?}")]
    ReleaseTimeout(Duration),

    /// The blocking file transaction panicked or was aborted
    #[error("Blocking lease task failed: {0}")]
    BlockingTask(#[from] tokio::task::JoinError),
}

impl ElectionError {
    /// Build a [`ElectionError::NotHolder`] error
    pub fn not_holder(identity: impl Into<String>, holder: Option<String>) -> Self {
        Self::NotHolder {
            identity: identity.into(),
            holder,
        }
    }
}

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;
