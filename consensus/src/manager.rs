//! Election loop driving a [`Backend`] and publishing the result on a [`Lease`]
//!
//! One background task per manager runs the election. As a follower it calls
//! [`Backend::try_acquire`] every `retry_interval`; as leader it calls
//! [`Backend::renew`] every `renew_interval` and steps down after
//! [`DEMOTION_THRESHOLD`] consecutive renewal failures. When the session token
//! is cancelled the loop makes one bounded attempt to release the lease and
//! exits for good.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::Backend;
use crate::config::Config;
use crate::error::{ElectionError, Result};
use crate::lease::Lease;

/// Upper bound on the release attempt made while shutting down
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive renewal failures after which the leader steps down
pub const DEMOTION_THRESHOLD: u32 = 2;

/// Leader election manager
///
/// ```no_run
/// use consensus::{backends::file::FileBackend, Config, Manager};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> consensus::Result<()> {
/// let backend = FileBackend::new("/tmp/consensus-lease.json");
/// let manager = Manager::new(backend, Config::new("worker-0"))?;
///
/// let cancel = CancellationToken::new();
/// let lease = manager.start(cancel.clone());
///
/// lease.wait_for_leadership(&cancel).await?;
/// // ... leader-only work, checking lease.is_leader() ...
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Manager {
    backend: Arc<dyn Backend>,
    config: Config,
    session: Mutex<Option<Session>>,
}

/// A started election
struct Session {
    lease: Lease,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Manager {
    /// Create a manager, rejecting invalid configuration up front
    pub fn new(backend: impl Backend + 'static, config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            backend: Arc::new(backend),
            config,
            session: Mutex::new(None),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the election loop and return the lease handle
    ///
    /// Returns immediately; the first acquisition attempt happens right away
    /// on a spawned task. The session ends when `cancel` (or [`Manager::stop`])
    /// fires. Calling `start` again returns the existing handle without
    /// starting a second loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, cancel: CancellationToken) -> Lease {
        let mut session = self.lock_session();
        if let Some(session) = session.as_ref() {
            debug!(identity = %self.config.identity, "election already started");
            return session.lease.clone();
        }

        let lease = Lease::new(self.config.identity.clone());
        let cancel = cancel.child_token();

        let election = Election {
            backend: self.backend.clone(),
            config: self.config.clone(),
            lease: lease.clone(),
            renew_failures: 0,
        };
        let task = tokio::spawn(election.run(cancel.clone()));

        *session = Some(Session {
            lease: lease.clone(),
            cancel,
            task: Some(task),
        });

        lease
    }

    /// Stop the election, releasing the lease if held
    ///
    /// Safe to call any number of times; only the first call has an effect.
    /// Does not wait for the release; see [`Manager::shutdown`].
    pub fn stop(&self) {
        let session = self.lock_session();
        if let Some(session) = session.as_ref() {
            if !session.cancel.is_cancelled() {
                info!(identity = %self.config.identity, "stopping leader election");
                session.cancel.cancel();
            }
        }
    }

    /// Stop the election and wait for the loop, including its release, to finish
    pub async fn shutdown(&self) {
        self.stop();

        let task = self.lock_session().as_mut().and_then(|s| s.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(identity = %self.config.identity, error = %e, "election task failed");
            }
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the election task
struct Election {
    backend: Arc<dyn Backend>,
    config: Config,
    lease: Lease,
    /// Consecutive renewal failures while leader
    renew_failures: u32,
}

impl Election {
    async fn run(mut self, cancel: CancellationToken) {
        info!(identity = %self.config.identity, "starting leader election");

        let mut interrupted = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                _ = self.tick() => {}
            }

            let interval = if self.lease.is_leader() {
                self.config.renew_interval
            } else {
                self.config.retry_interval
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        // An interrupted call may have taken the lease without us recording it
        if self.lease.is_leader() || interrupted {
            self.release().await;
        }
        self.lease.demote();

        info!(identity = %self.config.identity, "leader election stopped");
    }

    async fn tick(&mut self) {
        if self.lease.is_leader() {
            self.renew().await;
        } else {
            self.try_acquire().await;
        }
    }

    async fn try_acquire(&mut self) {
        let identity = &self.config.identity;

        match self
            .backend
            .try_acquire(identity, self.config.lease_duration)
            .await
        {
            Ok(true) => {
                self.renew_failures = 0;
                if self.lease.promote() {
                    info!(%identity, "became leader");
                }
            }
            Ok(false) => debug!(%identity, "lease held by another instance"),
            Err(e) => warn!(%identity, error = %e, "failed to acquire lease"),
        }
    }

    async fn renew(&mut self) {
        let identity = &self.config.identity;

        match self
            .backend
            .renew(identity, self.config.lease_duration)
            .await
        {
            Ok(()) => {
                self.renew_failures = 0;
                debug!(%identity, "renewed lease");
            }
            Err(e) => {
                self.renew_failures += 1;
                warn!(
                    %identity,
                    failures = self.renew_failures,
                    error = %e,
                    "failed to renew lease"
                );

                if self.renew_failures >= DEMOTION_THRESHOLD {
                    self.renew_failures = 0;
                    if self.lease.demote() {
                        warn!(%identity, "lost leadership");
                    }
                }
            }
        }
    }

    /// Best-effort release bounded by [`RELEASE_TIMEOUT`]
    async fn release(&self) {
        let identity = &self.config.identity;

        match tokio::time::timeout(RELEASE_TIMEOUT, self.backend.release(identity)).await {
            Ok(Ok(())) => info!(%identity, "released lease"),
            Ok(Err(e)) => warn!(%identity, error = %e, "failed to release lease"),
            Err(_) => warn!(
                %identity,
                error = %ElectionError::ReleaseTimeout(RELEASE_TIMEOUT),
                "failed to release lease"
            ),
        }
    }
}
