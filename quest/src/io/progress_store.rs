//! Progress record persistence with compare-and-swap on the revision.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use fs2::FileExt;
use tracing::debug;

use crate::core::types::ProgressRecord;

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
const LOCK_ATTEMPTS: u32 = 40;

/// Errors that can occur while loading or saving progress.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The persisted revision is not the one the writer started from.
    #[error("revision conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },

    #[error("progress store I/O: {0:#}")]
    Io(#[from] anyhow::Error),
}

/// Persistence capability for progress records.
pub trait ProgressStore: Send + Sync {
    /// `None` when the instance has never been saved.
    fn load_progress(&self, instance_id: &str) -> Result<Option<ProgressRecord>, StoreError>;

    /// Save `record` if the persisted revision equals `expected_revision`.
    ///
    /// An absent record counts as revision 0.
    fn save_progress(
        &self,
        instance_id: &str,
        record: &ProgressRecord,
        expected_revision: u64,
    ) -> Result<(), StoreError>;
}

/// JSON files under a directory, one per instance, guarded by a lock file.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    root: PathBuf,
}

impl FileProgressStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn record_path(&self, instance_id: &str) -> PathBuf {
        self.root.join(format!("{instance_id}.json"))
    }

    fn lock_path(&self, instance_id: &str) -> PathBuf {
        self.root.join(format!("{instance_id}.lock"))
    }

    fn read(&self, instance_id: &str) -> anyhow::Result<Option<ProgressRecord>> {
        let path = self.record_path(instance_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read progress {}", path.display()));
            }
        };
        let record: ProgressRecord = serde_json::from_str(&contents)
            .with_context(|| format!("parse progress {}", path.display()))?;
        Ok(Some(record))
    }
}

impl ProgressStore for FileProgressStore {
    fn load_progress(&self, instance_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let record = self.read(instance_id)?;
        debug!(instance_id, revision = ?record.as_ref().map(|r| r.revision), "progress loaded");
        Ok(record)
    }

    fn save_progress(
        &self,
        instance_id: &str,
        record: &ProgressRecord,
        expected_revision: u64,
    ) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path(instance_id))?;

        let found = self.read(instance_id)?.map_or(0, |current| current.revision);
        if found != expected_revision {
            return Err(StoreError::Conflict {
                expected: expected_revision,
                found,
            });
        }

        let mut buf = serde_json::to_string_pretty(record).context("serialize progress")?;
        buf.push('\n');
        super::write_atomic(&self.record_path(instance_id), &buf)?;
        debug!(instance_id, revision = record.revision, "progress saved");
        Ok(())
    }
}

/// Exclusive advisory lock held for the duration of a compare-and-swap.
///
/// The lock file itself persists; the OS drops the lock when the handle
/// closes, including when the holding process dies.
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock {}", path.display()))?;
        for _ in 0..LOCK_ATTEMPTS {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(LOCK_RETRY_DELAY),
                Err(err) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
        }
        Err(anyhow!("progress store is locked: {}", path.display()))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock even if this fails.
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(err = %err, "explicit unlock failed");
        }
    }
}
