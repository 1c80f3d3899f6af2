//! Progress record storage.
//!
//! Stores are synchronous and may block on disk; async callers go through
//! `spawn_blocking` (see `TaskExecutor`). Updates to one sample are serialized through a per-sample lock held across
//! the whole read-modify-write, so an `Increment` behaves as an atomic add
//! even when many partition tasks finish at once. Different samples never
//! contend.

use super::record::{FieldUpdate, ProgressField, ProgressRecord};
use crate::error::{PipelineError, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Durable per-sample record storage keyed by sample identifier.
pub trait ProgressStore: Send + Sync {
    /// Current record, if one was ever written.
    fn get(&self, sn: &str) -> Result<Option<ProgressRecord>>;

    /// Apply all updates as one linearizable step, creating the record on
    /// first write. Returns the record as stored.
    fn apply(&self, sn: &str, updates: &[(ProgressField, FieldUpdate)]) -> Result<ProgressRecord>;
}

fn apply_all(
    record: &mut ProgressRecord,
    sn: &str,
    updates: &[(ProgressField, FieldUpdate)],
) -> Result<()> {
    for (field, update) in updates {
        record
            .apply(*field, update)
            .map_err(|message| PipelineError::progress(sn, message))?;
    }
    record.last_activity = Utc::now();
    Ok(())
}

/// One JSON file per sample under a directory.
pub struct FileProgressStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileProgressStore {
    /// Open (creating if needed) a record directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::debug!("Progress records in {}", dir.display());
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    fn record_path(&self, sn: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sn))
    }

    fn lock_for(&self, sn: &str) -> Arc<Mutex<()>> {
        self.locks.entry(sn.to_string()).or_default().value().clone()
    }

    fn read(&self, sn: &str, path: &Path) -> Result<Option<ProgressRecord>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PipelineError::progress(sn, format!("corrupt record {}: {}", path.display(), e)))
    }

    fn write(&self, record: &ProgressRecord, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| PipelineError::progress(&record.sn, e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl ProgressStore for FileProgressStore {
    fn get(&self, sn: &str) -> Result<Option<ProgressRecord>> {
        let lock = self.lock_for(sn);
        let _guard = lock.lock();
        self.read(sn, &self.record_path(sn))
    }

    fn apply(&self, sn: &str, updates: &[(ProgressField, FieldUpdate)]) -> Result<ProgressRecord> {
        let lock = self.lock_for(sn);
        let _guard = lock.lock();

        let path = self.record_path(sn);
        let mut record = self
            .read(sn, &path)?
            .unwrap_or_else(|| ProgressRecord::new(sn));
        apply_all(&mut record, sn, updates)?;
        self.write(&record, &path)?;
        Ok(record)
    }
}

/// Non-durable store for tests and dry runs.
#[derive(Default)]
pub struct MemoryProgressStore {
    records: DashMap<String, ProgressRecord>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, sn: &str) -> Result<Option<ProgressRecord>> {
        Ok(self.records.get(sn).map(|r| r.value().clone()))
    }

    fn apply(&self, sn: &str, updates: &[(ProgressField, FieldUpdate)]) -> Result<ProgressRecord> {
        // The entry guard holds the shard lock for the whole update
        let mut entry = self
            .records
            .entry(sn.to_string())
            .or_insert_with(|| ProgressRecord::new(sn));
        let mut next = entry.value().clone();
        apply_all(&mut next, sn, updates)?;
        *entry.value_mut() = next.clone();
        Ok(next)
    }
}
