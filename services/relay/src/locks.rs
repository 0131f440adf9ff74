//! Lock store: per-identifier pause records
//!
//! A debugged process asks for a pause, then polls its record until it is
//! released. Records are mutated only through [`LockStore::replace`] and
//! [`LockStore::remove`]; replacing is atomic, so a reader never sees an
//! identifier without a record in the middle of a replace.
//!
//! # On-disk layout
//! ```text
//! <dir>/<id>     {"lock":true,"stop":true}
//! ```
//! Stale records and temporaries are removed at startup; other files in
//! the directory are left in place.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use types::ids::LockId;
use types::lock::LockRecord;
use uuid::Uuid;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LockStoreError {
    #[error("IO error on lock {id}: {source}")]
    Io {
        id: LockId,
        #[source]
        source: io::Error,
    },

    #[error("corrupt lock record {id}: {source}")]
    Corrupt {
        id: LockId,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error on lock directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ── Store trait ─────────────────────────────────────────────────────

/// Storage for pause records, at most one per identifier.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically install `record` for `id`, discarding any previous one.
    async fn replace(&self, id: &LockId, record: LockRecord) -> Result<(), LockStoreError>;

    /// Delete the record for `id`. Returns whether one existed.
    async fn remove(&self, id: &LockId) -> Result<bool, LockStoreError>;

    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError>;

    async fn exists(&self, id: &LockId) -> Result<bool, LockStoreError> {
        Ok(self.get(id).await?.is_some())
    }

    /// Delete every record. Returns how many were removed.
    async fn clear(&self) -> Result<usize, LockStoreError>;
}

/// Hold `id` and tell it to stop, replacing whatever state it had.
pub async fn acquire(store: &dyn LockStore, id: &LockId) -> Result<LockRecord, LockStoreError> {
    let record = LockRecord::stopped();
    store.replace(id, record).await?;
    info!(lock_id = %id, "Lock acquired");
    Ok(record)
}

// ── Filesystem store ────────────────────────────────────────────────

/// One JSON file per identifier under a directory.
///
/// Writes go to a temporary file that is renamed over the record, under a
/// per-identifier mutex; different identifiers proceed concurrently. A
/// mutex lives in `guards` only while some operation on its identifier is
/// in flight.
pub struct FsLockStore {
    dir: PathBuf,
    guards: DashMap<LockId, Arc<Mutex<()>>>,
}

/// Records are a few bytes of JSON; anything larger is not ours.
const MAX_RECORD_BYTES: u64 = 256;

impl FsLockStore {
    /// Open (creating if needed) the lock directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, LockStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| LockStoreError::Directory {
                path: dir.clone(),
                source,
            })?;
        debug!(dir = %dir.display(), "Opened lock directory");
        Ok(Self {
            dir,
            guards: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &LockId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    fn guard(&self, id: &LockId) -> Arc<Mutex<()>> {
        self.guards.entry(id.clone()).or_default().clone()
    }

    /// Give back a guard taken with [`guard`](Self::guard), dropping the map
    /// entry once no other operation holds it.
    fn release(&self, id: &LockId, guard: Arc<Mutex<()>>) {
        drop(guard);
        self.guards
            .remove_if(id, |_, held| Arc::strong_count(held) == 1);
    }

    async fn write_record(&self, id: &LockId, record: LockRecord) -> Result<(), LockStoreError> {
        let json = serde_json::to_vec(&record).map_err(|source| LockStoreError::Corrupt {
            id: id.clone(),
            source,
        })?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", id, Uuid::now_v7().simple()));
        let io_err = |source| LockStoreError::Io {
            id: id.clone(),
            source,
        };

        fs::write(&tmp, &json).await.map_err(io_err)?;
        if let Err(source) = fs::rename(&tmp, self.record_path(id)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(source));
        }
        debug!(lock_id = %id, lock = record.lock, stop = record.stop, "Lock record written");
        Ok(())
    }

    async fn delete_record(&self, id: &LockId) -> Result<bool, LockStoreError> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LockStoreError::Io {
                id: id.clone(),
                source,
            }),
        }
    }

    async fn read_record(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError> {
        let path = self.record_path(id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LockStoreError::Io {
                    id: id.clone(),
                    source,
                })
            }
        };
        let record: LockRecord =
            serde_json::from_slice(&data).map_err(|source| LockStoreError::Corrupt {
                id: id.clone(),
                source,
            })?;

        let created_at = fs::metadata(&path)
            .await
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or(record.created_at);
        Ok(Some(record.with_created_at(created_at)))
    }
}

#[async_trait]
impl LockStore for FsLockStore {
    async fn replace(&self, id: &LockId, record: LockRecord) -> Result<(), LockStoreError> {
        let guard = self.guard(id);
        let result = {
            let _held = guard.lock().await;
            self.write_record(id, record).await
        };
        self.release(id, guard);
        result
    }

    async fn remove(&self, id: &LockId) -> Result<bool, LockStoreError> {
        let guard = self.guard(id);
        let result = {
            let _held = guard.lock().await;
            self.delete_record(id).await
        };
        self.release(id, guard);
        result
    }

    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError> {
        let guard = self.guard(id);
        let result = {
            let _held = guard.lock().await;
            self.read_record(id).await
        };
        self.release(id, guard);
        result
    }

    /// Delete the records and temporary files this store writes. Anything
    /// else in the directory is left alone.
    async fn clear(&self) -> Result<usize, LockStoreError> {
        let dir_err = |source| LockStoreError::Directory {
            path: self.dir.clone(),
            source,
        };
        let mut entries = fs::read_dir(&self.dir).await.map_err(dir_err)?;
        let mut removed = 0;
        let mut skipped = 0;
        while let Some(entry) = entries.next_entry().await.map_err(dir_err)? {
            let path = entry.path();
            if !is_store_file(&entry).await {
                warn!(path = %path.display(), "Leaving unrecognized entry in lock directory");
                skipped += 1;
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(dir_err(source)),
            }
        }
        info!(dir = %self.dir.display(), removed, skipped, "Cleared lock directory");
        Ok(removed)
    }
}

/// Temporary file name written by `replace`: `.<id>.<32 hex>.tmp`.
fn is_temp_name(name: &str) -> bool {
    let Some(inner) = name
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(".tmp"))
    else {
        return false;
    };
    match inner.rsplit_once('.') {
        Some((id, suffix)) => {
            suffix.len() == 32
                && suffix.chars().all(|c| c.is_ascii_hexdigit())
                && LockId::new(id).is_ok()
        }
        None => false,
    }
}

/// Regular file that is either one of our temporaries or a small file named
/// by a valid id holding a lock record.
async fn is_store_file(entry: &fs::DirEntry) -> bool {
    match entry.file_type().await {
        Ok(file_type) if file_type.is_file() => {}
        _ => return false,
    }
    let file_name = entry.file_name();
    let Some(name) = file_name.to_str() else {
        return false;
    };
    if is_temp_name(name) {
        return true;
    }
    if LockId::new(name).is_err() {
        return false;
    }
    match entry.metadata().await {
        Ok(meta) if meta.len() <= MAX_RECORD_BYTES => {}
        _ => return false,
    }
    match fs::read(entry.path()).await {
        Ok(data) => serde_json::from_slice::<LockRecord>(&data).is_ok(),
        Err(_) => false,
    }
}

// ── In-memory store ─────────────────────────────────────────────────

/// Map-backed store for embedding and tests. Never fails.
#[derive(Default)]
pub struct MemoryLockStore {
    records: DashMap<LockId, LockRecord>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn replace(&self, id: &LockId, record: LockRecord) -> Result<(), LockStoreError> {
        self.records.insert(id.clone(), record);
        Ok(())
    }

    async fn remove(&self, id: &LockId) -> Result<bool, LockStoreError> {
        Ok(self.records.remove(id).is_some())
    }

    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError> {
        Ok(self.records.get(id).map(|r| *r))
    }

    async fn clear(&self) -> Result<usize, LockStoreError> {
        let removed = self.records.len();
        self.records.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> LockId {
        LockId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_writes_json_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLockStore::open(dir.path().join("locks")).await.unwrap();

        let record = acquire(&store, &id("abc123")).await.unwrap();
        assert!(record.lock && record.stop);

        let on_disk = std::fs::read_to_string(store.dir().join("abc123")).unwrap();
        assert_eq!(on_disk, r#"{"lock":true,"stop":true}"#);
        assert!(store.exists(&id("abc123")).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_replaces_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLockStore::open(dir.path()).await.unwrap();

        store.replace(&id("a"), LockRecord::paused()).await.unwrap();
        acquire(&store, &id("a")).await.unwrap();

        let record = store.get(&id("a")).await.unwrap().unwrap();
        assert!(record.same_state(&LockRecord::stopped()));
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLockStore::open(dir.path()).await.unwrap();

        acquire(&store, &id("a")).await.unwrap();
        assert!(store.remove(&id("a")).await.unwrap());
        assert!(!store.remove(&id("a")).await.unwrap());
        assert_eq!(store.get(&id("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_removes_only_store_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("stale"), br#"{"lock":true,"stop":false}"#).unwrap();
        std::fs::write(
            root.join(".stale.0190f3c2a1b27c3d8e9f0a1b2c3d4e5f.tmp"),
            b"{",
        )
        .unwrap();
        std::fs::write(root.join("notes.txt"), b"keep me").unwrap();
        std::fs::write(root.join(".bashrc"), b"export X=1").unwrap();
        std::fs::write(root.join("big"), vec![b' '; 1024]).unwrap();
        std::fs::create_dir(root.join("nested")).unwrap();
        std::fs::write(root.join("nested").join("a"), br#"{"lock":true,"stop":true}"#).unwrap();
        let store = FsLockStore::open(root).await.unwrap();
        acquire(&store, &id("a")).await.unwrap();

        assert_eq!(store.clear().await.unwrap(), 3);
        assert!(!store.exists(&id("a")).await.unwrap());
        assert!(!store.exists(&id("stale")).await.unwrap());

        let mut left: Vec<_> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, vec![".bashrc", "big", "nested", "notes.txt"]);
        assert!(root.join("nested").join("a").exists());
    }

    #[test]
    fn test_temp_name_recognition() {
        assert!(is_temp_name(".abc.0190f3c2a1b27c3d8e9f0a1b2c3d4e5f.tmp"));
        assert!(!is_temp_name(".abc.tmp"));
        assert!(!is_temp_name("abc.0190f3c2a1b27c3d8e9f0a1b2c3d4e5f.tmp"));
        assert!(!is_temp_name(".abc.0190f3c2a1b27c3d8e9f0a1b2c3d4e5z.tmp"));
    }

    #[tokio::test]
    async fn test_guards_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLockStore::open(dir.path()).await.unwrap();

        for i in 0..500 {
            let lock = id(&format!("absent-{}", i));
            assert_eq!(store.get(&lock).await.unwrap(), None);
            assert!(!store.remove(&lock).await.unwrap());
        }
        assert_eq!(store.guards.len(), 0);

        acquire(&store, &id("held")).await.unwrap();
        store.remove(&id("held")).await.unwrap();
        assert_eq!(store.guards.len(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLockStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("bad"), b"not json").unwrap();

        let err = store.get(&id("bad")).await.unwrap_err();
        assert!(matches!(err, LockStoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_write_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLockStore::open(dir.path().join("locks")).await.unwrap();
        std::fs::remove_dir(dir.path().join("locks")).unwrap();

        let err = acquire(&store, &id("a")).await.unwrap_err();
        assert!(matches!(err, LockStoreError::Io { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_leave_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsLockStore::open(dir.path()).await.unwrap());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        acquire(store.as_ref(), &id("same")).await.map(|_| ())
                    } else {
                        store.replace(&id("same"), LockRecord::paused()).await
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("same")]);
        let record = store.get(&id("same")).await.unwrap().unwrap();
        assert!(record.lock);
        assert_eq!(store.guards.len(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryLockStore::new();
        assert!(store.is_empty());

        let record = acquire(&store, &id("abc123")).await.unwrap();
        assert_eq!(store.get(&id("abc123")).await.unwrap(), Some(record));
        assert_eq!(store.len(), 1);

        acquire(&store, &id("abc123")).await.unwrap();
        assert_eq!(store.len(), 1);

        assert!(store.remove(&id("abc123")).await.unwrap());
        assert!(!store.remove(&id("abc123")).await.unwrap());
        assert_eq!(store.clear().await.unwrap(), 0);
    }
}
