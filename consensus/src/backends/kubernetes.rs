//! Kubernetes Lease based backend
//!
//! Uses a `coordination.k8s.io/v1` Lease object as the lease record. Every
//! write is a full `replace` carrying the `resourceVersion` read just before,
//! so the API server rejects a write made against a stale copy. Losing such a
//! race during acquisition is reported as "not acquired", never as an error.
//!
//! Expiry is judged with the local clock against the stored `renewTime`, so
//! members should run with synchronised clocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

use super::{check_identity, lease_valid, Backend};
use crate::error::{ElectionError, Result};

/// Namespace used when `POD_NAMESPACE` is not set
pub const DEFAULT_NAMESPACE: &str = "default";

/// HTTP status the API server returns for `AlreadyExists` and `Conflict`
const STATUS_CONFLICT: u16 = 409;

/// Result of an optimistic write
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// The write was accepted; carries the stored object
    Applied(Lease),
    /// Another writer got there first (object already exists or stale version)
    Conflict,
}

/// Access to the single Lease object an election runs on
///
/// Implementations must reject `create` when the object already exists and
/// `replace` when the object's `resourceVersion` no longer matches.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Name of the Lease object
    fn name(&self) -> &str;

    /// Fetch the Lease, `None` if it has never been created
    async fn get(&self) -> Result<Option<Lease>>;

    /// Create the Lease
    async fn create(&self, lease: Lease) -> Result<WriteOutcome>;

    /// Replace the Lease, guarded by its `resourceVersion`
    async fn replace(&self, lease: Lease) -> Result<WriteOutcome>;
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get(&self) -> Result<Option<Lease>> {
        (**self).get().await
    }

    async fn create(&self, lease: Lease) -> Result<WriteOutcome> {
        (**self).create(lease).await
    }

    async fn replace(&self, lease: Lease) -> Result<WriteOutcome> {
        (**self).replace(lease).await
    }
}

/// [`LeaseStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    /// Address the Lease `name` in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

/// Map the API server's 409 onto [`WriteOutcome::Conflict`]
fn write_outcome(result: kube::Result<Lease>) -> Result<WriteOutcome> {
    match result {
        Ok(lease) => Ok(WriteOutcome::Applied(lease)),
        Err(kube::Error::Api(response)) if response.code == STATUS_CONFLICT => {
            debug!(reason = %response.reason, "lease write conflict");
            Ok(WriteOutcome::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<Lease>> {
        Ok(self.api.get_opt(&self.name).await?)
    }

    async fn create(&self, lease: Lease) -> Result<WriteOutcome> {
        write_outcome(self.api.create(&PostParams::default(), &lease).await)
    }

    async fn replace(&self, lease: Lease) -> Result<WriteOutcome> {
        write_outcome(
            self.api
                .replace(&self.name, &PostParams::default(), &lease)
                .await,
        )
    }
}

/// Lease backend using a Kubernetes Lease object
pub struct KubernetesBackend<S = KubeLeaseStore> {
    store: S,
}

impl KubernetesBackend<KubeLeaseStore> {
    /// Create a backend for the Lease `name` in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self::with_store(KubeLeaseStore::new(client, namespace, name))
    }

    /// Create a backend from the ambient environment
    ///
    /// The namespace comes from `POD_NAMESPACE` (default `"default"`); the
    /// client uses the in-cluster service account or the local kubeconfig.
    pub async fn from_env(lease_name: &str) -> Result<Self> {
        if lease_name.trim().is_empty() {
            return Err(ElectionError::InvalidConfig(
                "lease name must not be empty".to_string(),
            ));
        }

        let namespace = std::env::var("POD_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let client = Client::try_default().await?;
        info!(%namespace, lease = %lease_name, "using Kubernetes lease backend");

        Ok(Self::new(client, &namespace, lease_name))
    }
}

impl<S: LeaseStore> KubernetesBackend<S> {
    /// Create a backend over an arbitrary [`LeaseStore`]
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    /// Get the underlying store
    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Lease duration in whole seconds, rounded up and at least one
fn duration_seconds(duration: Duration) -> i32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i32::try_from(secs.max(1)).unwrap_or(i32::MAX)
}

/// Whether the spec describes a lease that has not expired yet
fn spec_valid(spec: &LeaseSpec, fallback: Duration, now: DateTime<Utc>) -> bool {
    let Some(renew_time) = spec.renew_time.as_ref().map(|t| t.0) else {
        return false;
    };
    let duration = spec
        .lease_duration_seconds
        .and_then(|secs| u64::try_from(secs).ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback);

    lease_valid(renew_time, duration, now)
}

fn new_lease(name: &str, identity: &str, lease_duration: Duration, now: DateTime<Utc>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(duration_seconds(lease_duration)),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    }
}

#[async_trait]
impl<S: LeaseStore> Backend for KubernetesBackend<S> {
    async fn try_acquire(&self, identity: &str, lease_duration: Duration) -> Result<bool> {
        check_identity(identity)?;
        let now = Utc::now();

        let Some(mut lease) = self.store.get().await? else {
            let lease = new_lease(self.store.name(), identity, lease_duration, now);
            return match self.store.create(lease).await? {
                WriteOutcome::Applied(_) => {
                    info!(%identity, lease = %self.store.name(), "created lease");
                    Ok(true)
                }
                WriteOutcome::Conflict => {
                    debug!(%identity, "lost lease creation race");
                    Ok(false)
                }
            };
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let holder = spec.holder_identity.clone().filter(|h| !h.is_empty());

        match holder.as_deref() {
            Some(holder) if holder == identity => {
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(duration_seconds(lease_duration));
            }
            Some(holder) if spec_valid(spec, lease_duration, now) => {
                debug!(%identity, %holder, "lease held by another identity");
                return Ok(false);
            }
            previous => {
                if let Some(previous) = previous {
                    info!(%identity, %previous, "taking over expired lease");
                    spec.lease_transitions =
                        Some(spec.lease_transitions.unwrap_or(0).saturating_add(1));
                }
                spec.holder_identity = Some(identity.to_string());
                spec.acquire_time = Some(MicroTime(now));
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(duration_seconds(lease_duration));
            }
        }

        match self.store.replace(lease).await? {
            WriteOutcome::Applied(_) => Ok(true),
            WriteOutcome::Conflict => {
                debug!(%identity, "lost lease update race");
                Ok(false)
            }
        }
    }

    async fn renew(&self, identity: &str, lease_duration: Duration) -> Result<()> {
        check_identity(identity)?;
        let Some(mut lease) = self.store.get().await? else {
            return Err(ElectionError::not_holder(identity, None));
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if spec.holder_identity.as_deref() != Some(identity) {
            return Err(ElectionError::not_holder(
                identity,
                spec.holder_identity.clone().filter(|h| !h.is_empty()),
            ));
        }

        spec.renew_time = Some(MicroTime(Utc::now()));
        spec.lease_duration_seconds = Some(duration_seconds(lease_duration));

        match self.store.replace(lease).await? {
            WriteOutcome::Applied(_) => Ok(()),
            WriteOutcome::Conflict => Err(ElectionError::UpdateConflict {
                name: self.store.name().to_string(),
            }),
        }
    }

    async fn release(&self, identity: &str) -> Result<()> {
        check_identity(identity)?;
        let Some(mut lease) = self.store.get().await? else {
            return Ok(());
        };

        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(identity) {
            return Ok(());
        }

        spec.holder_identity = None;

        match self.store.replace(lease).await? {
            WriteOutcome::Applied(_) => {
                info!(%identity, lease = %self.store.name(), "released lease");
                Ok(())
            }
            WriteOutcome::Conflict => Err(ElectionError::UpdateConflict {
                name: self.store.name().to_string(),
            }),
        }
    }
}
