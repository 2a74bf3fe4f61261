//! Lease-based leader election for a fleet of cooperating processes.
//!
//! One process at a time holds a durable lease record; the [`Manager`] keeps
//! trying to acquire it while a follower, renews it while leader, and releases
//! it on shutdown. The outcome is published on a [`Lease`] handle that any
//! number of tasks can query or wait on.
//!
//! # Overview
//!
//! - **Pluggable storage**: anything implementing [`Backend`] can arbitrate
//! - **File backend**: JSON record guarded by an exclusive `flock`, for local use
//! - **Kubernetes backend**: `coordination.k8s.io/v1` Lease updated with
//!   optimistic concurrency, for clusters
//! - **Flap resistant**: a single failed renewal does not demote the leader
//! - **Clean handoff**: cancelling the session releases the lease within a
//!   bounded timeout
//!
//! This is not a consensus protocol: the backend is the single point of truth
//! and is solely responsible for exclusive updates to the record.
//!
//! # Example
//!
//! ```ignore
//! use consensus::{backends::file::FileBackend, Config, Manager};
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = Manager::new(
//!     FileBackend::new("/tmp/consensus-lease.json"),
//!     Config::new("worker-0"),
//! )?;
//!
//! let cancel = CancellationToken::new();
//! let lease = manager.start(cancel.clone());
//!
//! loop {
//!     if lease.is_leader() {
//!         // Leader-only work
//!     }
//! }
//! ```
//!
//! # Custom Timings
//!
//! ```ignore
//! use std::time::Duration;
//! use consensus::Config;
//!
//! let config = Config::new("worker-0")
//!     .with_lease_duration(Duration::from_secs(10))
//!     .with_renew_interval(Duration::from_secs(3))
//!     .with_retry_interval(Duration::from_secs(1));
//! ```

pub mod backends;
mod config;
mod error;
mod lease;
mod manager;

pub use backends::Backend;
pub use config::{
    Config, DEFAULT_LEASE_DURATION, DEFAULT_RENEW_INTERVAL, DEFAULT_RETRY_INTERVAL,
};
pub use error::{ElectionError, Result};
pub use lease::Lease;
pub use manager::{Manager, DEMOTION_THRESHOLD, RELEASE_TIMEOUT};
