//! Process-local view of leadership
//!
//! A [`Lease`] is a cheap, cloneable handle shared between the election loop
//! (the only writer) and any number of readers. The leader flag and the
//! promotion signal live behind the same mutex for writers, so a waiter can
//! never observe "not leader" and then subscribe to a signal that has already
//! been retired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{ElectionError, Result};

#[derive(Debug)]
struct LeaseState {
    identity: String,
    is_leader: AtomicBool,
    /// Current promotion signal. Fired (set to `true`) once per promotion and
    /// replaced with a fresh one on demotion.
    signal: Mutex<watch::Sender<bool>>,
}

/// Handle for querying and waiting on leadership
#[derive(Debug, Clone)]
pub struct Lease {
    state: Arc<LeaseState>,
}

impl Lease {
    pub(crate) fn new(identity: impl Into<String>) -> Self {
        Self {
            state: Arc::new(LeaseState {
                identity: identity.into(),
                is_leader: AtomicBool::new(false),
                signal: Mutex::new(fresh_signal()),
            }),
        }
    }

    /// Identity this lease was started with
    pub fn identity(&self) -> &str {
        &self.state.identity
    }

    /// Whether this process is currently the leader
    ///
    /// Lock-free; safe to call in tight loops.
    pub fn is_leader(&self) -> bool {
        self.state.is_leader.load(Ordering::Acquire)
    }

    /// Wait until this process becomes leader
    ///
    /// Returns immediately when already leader, and
    /// [`ElectionError::Cancelled`] if `cancel` fires first.
    pub async fn wait_for_leadership(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let signal = {
                let slot = self.lock_signal();
                if self.is_leader() {
                    return Ok(());
                }
                slot.subscribe()
            };

            tokio::select! {
                promoted = fired(signal) => {
                    if promoted {
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => return Err(ElectionError::Cancelled),
            }
        }
    }

    /// Transition to leader. Returns `false` if already leader.
    pub(crate) fn promote(&self) -> bool {
        let slot = self.lock_signal();
        if self.state.is_leader.swap(true, Ordering::AcqRel) {
            return false;
        }
        slot.send_replace(true);
        true
    }

    /// Transition to follower. Returns `false` if already a follower.
    pub(crate) fn demote(&self) -> bool {
        let mut slot = self.lock_signal();
        if !self.state.is_leader.swap(false, Ordering::AcqRel) {
            return false;
        }
        *slot = fresh_signal();
        true
    }

    fn lock_signal(&self) -> MutexGuard<'_, watch::Sender<bool>> {
        self.state
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn fresh_signal() -> watch::Sender<bool> {
    watch::channel(false).0
}

/// Resolve once the signal fires; `false` if it was retired unfired
async fn fired(mut signal: watch::Receiver<bool>) -> bool {
    signal.wait_for(|fired| *fired).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_new_lease_is_follower() {
        let lease = Lease::new("a");
        assert_eq!(lease.identity(), "a");
        assert!(!lease.is_leader());
    }

    #[test]
    fn test_promote_and_demote_report_transitions() {
        let lease = Lease::new("a");

        assert!(lease.promote());
        assert!(!lease.promote());
        assert!(lease.is_leader());

        assert!(lease.demote());
        assert!(!lease.demote());
        assert!(!lease.is_leader());
    }

    #[test]
    fn test_clones_share_state() {
        let lease = Lease::new("a");
        let observer = lease.clone();

        lease.promote();
        assert!(observer.is_leader());
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_returns_immediately_when_leader() {
        let lease = Lease::new("a");
        lease.promote();

        let cancel = CancellationToken::new();
        timeout(SHORT, lease.wait_for_leadership(&cancel))
            .await
            .expect("should not block")
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_blocks_until_promotion() {
        let lease = Lease::new("a");
        let waiter = {
            let lease = lease.clone();
            tokio::spawn(async move {
                lease
                    .wait_for_leadership(&CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(SHORT).await;
        assert!(!waiter.is_finished());

        lease.promote();
        timeout(LONG, waiter).await.unwrap().unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_cancelled() {
        let lease = Lease::new("a");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lease.wait_for_leadership(&cancel).await.unwrap_err();
        assert!(matches!(err, ElectionError::Cancelled));
    }

    #[test_log::test(tokio::test)]
    async fn test_demotion_rearms_signal() {
        let lease = Lease::new("a");
        lease.promote();
        lease.demote();

        let cancel = CancellationToken::new();
        assert!(timeout(SHORT, lease.wait_for_leadership(&cancel))
            .await
            .is_err());

        let waiter = {
            let lease = lease.clone();
            tokio::spawn(async move {
                lease
                    .wait_for_leadership(&CancellationToken::new())
                    .await
            })
        };
        lease.promote();
        timeout(LONG, waiter).await.unwrap().unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_woken_waiter_succeeds_after_quick_demotion() {
        let lease = Lease::new("a");
        let signal = lease.lock_signal().subscribe();

        lease.promote();
        lease.demote();

        // The retired signal was fired before being replaced
        assert!(fired(signal).await);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_waiters_are_all_woken() {
        let lease = Lease::new("a");

        let waiters: Vec<_> = (0..32)
            .map(|_| {
                let lease = lease.clone();
                tokio::spawn(async move {
                    lease
                        .wait_for_leadership(&CancellationToken::new())
                        .await
                })
            })
            .collect();

        tokio::task::yield_now().await;
        lease.promote();

        for waiter in waiters {
            timeout(LONG, waiter).await.unwrap().unwrap().unwrap();
        }
    }
}
