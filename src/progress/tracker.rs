//! Stage-level progress operations on top of a [`ProgressStore`].

use super::record::{FieldUpdate, FieldValue, ProgressField, ProgressRecord};
use super::store::ProgressStore;
use crate::error::{PipelineError, Result};
use std::sync::Arc;

/// Records stage transitions for samples.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Apply field updates, creating the record on first write.
    pub fn upsert(&self, sn: &str, updates: &[(ProgressField, FieldUpdate)]) -> Result<ProgressRecord> {
        self.store.apply(sn, updates)
    }

    /// Record for a sample, or `NotFound` if nothing was written yet.
    pub fn get(&self, sn: &str) -> Result<ProgressRecord> {
        self.store
            .get(sn)?
            .ok_or_else(|| PipelineError::not_found(format!("progress record for '{}'", sn)))
    }

    /// Record for a sample if one exists.
    pub fn find(&self, sn: &str) -> Result<Option<ProgressRecord>> {
        self.store.get(sn)
    }

    /// Read one field. Fails with `NotFound` before the first write.
    pub fn read_field(&self, sn: &str, field: ProgressField) -> Result<FieldValue> {
        Ok(self.get(sn)?.field(field))
    }

    /// Mark the download finished on `host` and record the planned partition total.
    pub fn record_download(&self, sn: &str, host: &str, total_partitions: u32) -> Result<ProgressRecord> {
        self.store.apply(
            sn,
            &[
                (ProgressField::Host, FieldUpdate::text(host)),
                (ProgressField::TotalPartitions, FieldUpdate::count(total_partitions)),
                (ProgressField::DownloadDone, FieldUpdate::flag(true)),
            ],
        )
    }

    /// Mark one partition counted. Marking is idempotent per partition, so a
    /// retried or re-run task never counts twice. Sets `partitions_complete`
    /// once every planned partition is marked.
    pub fn record_partition_done(&self, sn: &str, partition: u32) -> Result<ProgressRecord> {
        self.record_partitions_done(sn, std::iter::once(partition))
    }

    /// Mark several partitions counted in one update.
    pub fn record_partitions_done(
        &self,
        sn: &str,
        partitions: impl IntoIterator<Item = u32>,
    ) -> Result<ProgressRecord> {
        let updates: Vec<_> = partitions
            .into_iter()
            .map(|p| (ProgressField::PartitionsDone, FieldUpdate::Mark(p)))
            .collect();
        let record = self.store.apply(sn, &updates)?;

        if record.total_partitions > 0
            && record.partitions_done >= record.total_partitions
            && !record.partitions_complete
        {
            tracing::info!(
                "Sample {}: all {} partitions counted",
                sn,
                record.total_partitions
            );
            return self
                .store
                .apply(sn, &[(ProgressField::PartitionsComplete, FieldUpdate::flag(true))]);
        }
        Ok(record)
    }

    pub fn record_merge_done(&self, sn: &str) -> Result<ProgressRecord> {
        self.store
            .apply(sn, &[(ProgressField::MergeDone, FieldUpdate::flag(true))])
    }

    /// Terminal success marker, written by cleanup.
    pub fn record_finished(&self, sn: &str) -> Result<ProgressRecord> {
        self.store.apply(
            sn,
            &[
                (ProgressField::MergeDone, FieldUpdate::flag(true)),
                (ProgressField::CleanupDone, FieldUpdate::flag(true)),
                (ProgressField::Failed, FieldUpdate::flag(false)),
                (ProgressField::FailureReason, FieldUpdate::Set(FieldValue::Text(None))),
            ],
        )
    }

    pub fn record_failed(&self, sn: &str, reason: &str) -> Result<ProgressRecord> {
        self.store.apply(
            sn,
            &[
                (ProgressField::Failed, FieldUpdate::flag(true)),
                (ProgressField::FailureReason, FieldUpdate::text(reason)),
            ],
        )
    }

    /// Clear a failure left by an earlier run so the sample can be retried.
    pub fn clear_failure(&self, sn: &str) -> Result<()> {
        if let Some(record) = self.store.get(sn)? {
            if record.failed {
                self.store.apply(
                    sn,
                    &[
                        (ProgressField::Failed, FieldUpdate::flag(false)),
                        (ProgressField::FailureReason, FieldUpdate::Set(FieldValue::Text(None))),
                    ],
                )?;
            }
        }
        Ok(())
    }
}
