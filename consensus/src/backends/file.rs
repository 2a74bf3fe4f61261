//! File-lock based lease backend
//!
//! The lease record is a small JSON document. Every operation is one
//! read-modify-write transaction performed while holding an exclusive
//! advisory lock (`flock`) on the record file, so only one process can
//! decide at a time. Intended for processes sharing a local filesystem.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{check_identity, lease_valid, Backend};
use crate::error::{ElectionError, Result};

/// Contents of the lease record file
///
/// An empty `holder` means nobody holds the lease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseRecord {
    /// Identity of the current holder
    pub holder: String,
    /// Last time the holder acquired or renewed the lease
    pub renew_time: DateTime<Utc>,
}

impl LeaseRecord {
    /// The current holder, if any
    pub fn holder(&self) -> Option<&str> {
        if self.holder.is_empty() {
            None
        } else {
            Some(&self.holder)
        }
    }
}

/// What a transaction decided to do with the record
enum Transaction<T> {
    /// Write the modified record back and return the value
    Commit(T),
    /// Leave the file untouched and return the value
    ReadOnly(T),
}

/// Lease backend storing the record in a locked local file
#[derive(Debug, Clone)]
pub struct FileBackend {
    /// Path to the JSON record file
    path: PathBuf,
}

impl FileBackend {
    /// Create a backend for the record at `path`
    ///
    /// The file (and its parent directories) are created on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path to the record file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current record under the lock
    pub async fn current(&self) -> Result<LeaseRecord> {
        self.transact(|record, _| Ok(Transaction::ReadOnly(record.clone())))
            .await
    }

    /// Run `op` against the record while holding the exclusive lock
    ///
    /// `flock` blocks the calling thread, so the transaction runs on the
    /// blocking pool.
    async fn transact<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LeaseRecord, DateTime<Utc>) -> Result<Transaction<T>> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || transact_blocking(&path, op)).await?
    }
}

fn transact_blocking<T, F>(path: &Path, op: F) -> Result<T>
where
    F: FnOnce(&mut LeaseRecord, DateTime<Utc>) -> Result<Transaction<T>>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(ElectionError::LockFileCreation)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(ElectionError::LockFileCreation)?;

    file.lock_exclusive()
        .map_err(ElectionError::LockAcquisition)?;

    let result = run_locked(&mut file, op);

    // Closing the descriptor drops the lock as well
    if let Err(e) = FileExt::unlock(&file) {
        warn!(path = %path.display(), error = %e, "failed to unlock lease file");
    }

    result
}

fn run_locked<T, F>(file: &mut File, op: F) -> Result<T>
where
    F: FnOnce(&mut LeaseRecord, DateTime<Utc>) -> Result<Transaction<T>>,
{
    let mut record = read_record(file)?;

    match op(&mut record, Utc::now())? {
        Transaction::Commit(value) => {
            write_record(file, &record)?;
            Ok(value)
        }
        Transaction::ReadOnly(value) => Ok(value),
    }
}

/// Read the record from the start of the file; an empty file is a blank record
fn read_record(file: &mut File) -> Result<LeaseRecord> {
    file.seek(SeekFrom::Start(0))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    if contents.trim().is_empty() {
        return Ok(LeaseRecord::default());
    }

    Ok(serde_json::from_str(&contents)?)
}

/// Replace the whole file with `record` and flush it to disk
fn write_record(file: &mut File, record: &LeaseRecord) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;

    serde_json::to_writer_pretty(&mut *file, record)?;
    file.write_all(b"\n")?;
    file.sync_all()?;

    Ok(())
}

#[async_trait]
impl Backend for FileBackend {
    async fn try_acquire(&self, identity: &str, lease_duration: Duration) -> Result<bool> {
        check_identity(identity)?;
        let identity = identity.to_string();

        self.transact(move |record, now| {
            if record.holder == identity {
                record.renew_time = now;
                return Ok(Transaction::Commit(true));
            }

            match record.holder() {
                Some(holder) if lease_valid(record.renew_time, lease_duration, now) => {
                    debug!(%identity, %holder, "lease held by another identity");
                    Ok(Transaction::ReadOnly(false))
                }
                previous => {
                    if let Some(previous) = previous {
                        info!(%identity, %previous, "taking over expired lease");
                    }
                    record.holder = identity;
                    record.renew_time = now;
                    Ok(Transaction::Commit(true))
                }
            }
        })
        .await
    }

    async fn renew(&self, identity: &str, _lease_duration: Duration) -> Result<()> {
        check_identity(identity)?;
        let identity = identity.to_string();

        self.transact(move |record, now| {
            if record.holder != identity {
                return Err(ElectionError::not_holder(
                    identity,
                    record.holder().map(str::to_string),
                ));
            }

            record.renew_time = now;
            Ok(Transaction::Commit(()))
        })
        .await
    }

    async fn release(&self, identity: &str) -> Result<()> {
        check_identity(identity)?;
        let identity = identity.to_string();

        self.transact(move |record, _| {
            if record.holder == identity {
                record.holder.clear();
                Ok(Transaction::Commit(()))
            } else {
                Ok(Transaction::ReadOnly(()))
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Barrier;

    const LEASE: Duration = Duration::from_secs(2);

    fn backend(dir: &TempDir) -> FileBackend {
        FileBackend::new(dir.path().join("lease.json"))
    }

    fn write_raw(backend: &FileBackend, record: &LeaseRecord) {
        fs::write(backend.path(), serde_json::to_string(record).unwrap()).unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_acquire_on_empty_file() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        assert!(backend.try_acquire("a", LEASE).await.unwrap());

        let record = backend.current().await.unwrap();
        assert_eq!(record.holder(), Some("a"));
    }

    #[test_log::test(tokio::test)]
    async fn test_blank_existing_file_has_no_holder() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        fs::write(backend.path(), "").unwrap();

        assert_eq!(backend.current().await.unwrap(), LeaseRecord::default());
        assert!(backend.try_acquire("a", LEASE).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("nested/dir/lease.json"));

        assert!(backend.try_acquire("a", LEASE).await.unwrap());
        assert!(backend.path().exists());
    }

    #[test_log::test(tokio::test)]
    async fn test_holder_reacquire_refreshes_renew_time() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let stale = Utc::now() - chrono::Duration::seconds(1);
        write_raw(
            &backend,
            &LeaseRecord {
                holder: "a".into(),
                renew_time: stale,
            },
        );

        assert!(backend.try_acquire("a", LEASE).await.unwrap());
        assert!(backend.current().await.unwrap().renew_time > stale);
    }

    #[test_log::test(tokio::test)]
    async fn test_valid_lease_blocks_other_identity() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        assert!(backend.try_acquire("a", LEASE).await.unwrap());
        backend.renew("a", LEASE).await.unwrap();

        assert!(!backend.try_acquire("b", LEASE).await.unwrap());
        assert_eq!(backend.current().await.unwrap().holder(), Some("a"));
    }

    #[test_log::test(tokio::test)]
    async fn test_expired_lease_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        write_raw(
            &backend,
            &LeaseRecord {
                holder: "a".into(),
                renew_time: Utc::now() - chrono::Duration::seconds(10),
            },
        );

        assert!(backend.try_acquire("b", LEASE).await.unwrap());
        assert_eq!(backend.current().await.unwrap().holder(), Some("b"));

        // The previous holder can no longer renew
        let err = backend.renew("a", LEASE).await.unwrap_err();
        assert!(matches!(
            err,
            ElectionError::NotHolder { ref identity, ref holder }
                if identity == "a" && holder.as_deref() == Some("b")
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_renew_without_record_fails() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let err = backend.renew("a", LEASE).await.unwrap_err();
        assert!(matches!(err, ElectionError::NotHolder { holder: None, .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_release_clears_holder_and_allows_immediate_acquire() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        assert!(backend.try_acquire("a", LEASE).await.unwrap());
        backend.release("a").await.unwrap();
        assert_eq!(backend.current().await.unwrap().holder(), None);

        assert!(backend.try_acquire("b", LEASE).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        // Nothing to release
        backend.release("a").await.unwrap();

        // Held by someone else
        assert!(backend.try_acquire("b", LEASE).await.unwrap());
        backend.release("a").await.unwrap();
        assert_eq!(backend.current().await.unwrap().holder(), Some("b"));
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        fs::write(backend.path(), "{ not json").unwrap();

        let err = backend.try_acquire("a", LEASE).await.unwrap_err();
        assert!(matches!(err, ElectionError::RecordFormat(_)));
    }

    #[test_log::test(tokio::test)]
    async fn test_record_format_on_disk() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        assert!(backend.try_acquire("a", LEASE).await.unwrap());

        let raw = fs::read_to_string(backend.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["holder"], "a");
        assert!(value["renewTime"].as_str().is_some());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_acquirers_exactly_one_wins() {
        const RACERS: usize = 8;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lease.json");
        let barrier = Arc::new(Barrier::new(RACERS));

        let handles: Vec<_> = (0..RACERS)
            .map(|i| {
                let backend = FileBackend::new(path.clone());
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    backend.try_acquire(&format!("racer-{i}"), LEASE).await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_identity_cannot_claim_released_lease() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        assert!(backend.try_acquire("a", LEASE).await.unwrap());
        backend.release("a").await.unwrap();

        let err = backend.try_acquire("", LEASE).await.unwrap_err();
        assert!(matches!(err, ElectionError::InvalidConfig(_)));
        assert!(backend.renew("", LEASE).await.is_err());
        assert!(backend.release("").await.is_err());

        assert_eq!(backend.current().await.unwrap().holder(), None);
        assert!(backend.try_acquire("b", LEASE).await.unwrap());
    }
}
