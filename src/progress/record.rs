//! Per-sample progress record and the field updates applied to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Durable state of one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Sample identifier
    pub sn: String,

    /// Host that downloaded the sample
    #[serde(default)]
    pub host: Option<String>,

    /// Partitions planned for the sample, zero until the download records it
    #[serde(default)]
    pub total_partitions: u32,

    /// Completed partitions. Only ever increases.
    #[serde(default)]
    pub partitions_done: u32,

    /// Indices of partitions known to have a published artifact
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub completed_partitions: BTreeSet<u32>,

    #[serde(default)]
    pub download_done: bool,

    #[serde(default)]
    pub partitions_complete: bool,

    #[serde(default)]
    pub merge_done: bool,

    #[serde(default)]
    pub cleanup_done: bool,

    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub failure_reason: Option<String>,

    pub last_activity: DateTime<Utc>,
}

impl ProgressRecord {
    /// A fresh record with every marker cleared.
    pub fn new(sn: impl Into<String>) -> Self {
        Self {
            sn: sn.into(),
            host: None,
            total_partitions: 0,
            partitions_done: 0,
            completed_partitions: BTreeSet::new(),
            download_done: false,
            partitions_complete: false,
            merge_done: false,
            cleanup_done: false,
            failed: false,
            failure_reason: None,
            last_activity: Utc::now(),
        }
    }

    /// Whether every stage has finished.
    pub fn is_finished(&self) -> bool {
        self.merge_done && self.cleanup_done
    }

    /// One-word state used by status output.
    pub fn state(&self) -> &'static str {
        if self.failed {
            "failed"
        } else if self.cleanup_done {
            "finished"
        } else if self.merge_done {
            "merged"
        } else if self.partitions_complete {
            "counted"
        } else if self.download_done {
            "counting"
        } else {
            "pending"
        }
    }

    /// Current value of a field.
    pub fn field(&self, field: ProgressField) -> FieldValue {
        match field {
            ProgressField::Host => FieldValue::Text(self.host.clone()),
            ProgressField::TotalPartitions => FieldValue::Count(self.total_partitions),
            ProgressField::PartitionsDone => FieldValue::Count(self.partitions_done),
            ProgressField::DownloadDone => FieldValue::Flag(self.download_done),
            ProgressField::PartitionsComplete => FieldValue::Flag(self.partitions_complete),
            ProgressField::MergeDone => FieldValue::Flag(self.merge_done),
            ProgressField::CleanupDone => FieldValue::Flag(self.cleanup_done),
            ProgressField::Failed => FieldValue::Flag(self.failed),
            ProgressField::FailureReason => FieldValue::Text(self.failure_reason.clone()),
        }
    }

    /// Apply one update. Type mismatches are rejected with a message.
    ///
    /// `partitions_done` is monotonic: a smaller literal is ignored and
    /// increments stop at `total_partitions` once that is known. Marking the
    /// same partition twice counts it once.
    pub fn apply(&mut self, field: ProgressField, update: &FieldUpdate) -> Result<(), String> {
        match (field, update) {
            (ProgressField::PartitionsDone, FieldUpdate::Mark(partition)) => {
                if self.total_partitions > 0 && *partition >= self.total_partitions {
                    return Err(format!(
                        "partition {} outside the {} planned",
                        partition, self.total_partitions
                    ));
                }
                self.completed_partitions.insert(*partition);
                let marked = self.completed_partitions.len() as u32;
                self.partitions_done = self.partitions_done.max(marked);
            }
            (ProgressField::PartitionsDone, FieldUpdate::Increment) => {
                let next = self.partitions_done.saturating_add(1);
                self.partitions_done = if self.total_partitions > 0 {
                    next.min(self.total_partitions)
                } else {
                    next
                };
            }
            (ProgressField::PartitionsDone, FieldUpdate::Set(FieldValue::Count(n))) => {
                let capped = if self.total_partitions > 0 {
                    (*n).min(self.total_partitions)
                } else {
                    *n
                };
                self.partitions_done = self.partitions_done.max(capped);
            }
            (ProgressField::TotalPartitions, FieldUpdate::Increment) => {
                self.total_partitions = self.total_partitions.saturating_add(1);
            }
            (ProgressField::TotalPartitions, FieldUpdate::Set(FieldValue::Count(n))) => {
                self.total_partitions = *n;
            }
            (ProgressField::Host, FieldUpdate::Set(FieldValue::Text(v))) => {
                self.host = v.clone();
            }
            (ProgressField::FailureReason, FieldUpdate::Set(FieldValue::Text(v))) => {
                self.failure_reason = v.clone();
            }
            (flag, FieldUpdate::Set(FieldValue::Flag(v))) if flag.is_flag() => {
                *self.flag_mut(flag) = *v;
            }
            (field, update) => {
                return Err(format!("cannot apply {:?} to field {}", update, field));
            }
        }
        Ok(())
    }

    fn flag_mut(&mut self, field: ProgressField) -> &mut bool {
        match field {
            ProgressField::DownloadDone => &mut self.download_done,
            ProgressField::PartitionsComplete => &mut self.partitions_complete,
            ProgressField::MergeDone => &mut self.merge_done,
            ProgressField::CleanupDone => &mut self.cleanup_done,
            _ => &mut self.failed,
        }
    }
}

/// Updatable fields of a [`ProgressRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressField {
    Host,
    TotalPartitions,
    PartitionsDone,
    DownloadDone,
    PartitionsComplete,
    MergeDone,
    CleanupDone,
    Failed,
    FailureReason,
}

impl ProgressField {
    fn is_flag(&self) -> bool {
        matches!(
            self,
            ProgressField::DownloadDone
                | ProgressField::PartitionsComplete
                | ProgressField::MergeDone
                | ProgressField::CleanupDone
                | ProgressField::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressField::Host => "host",
            ProgressField::TotalPartitions => "total_partitions",
            ProgressField::PartitionsDone => "partitions_done",
            ProgressField::DownloadDone => "download_done",
            ProgressField::PartitionsComplete => "partitions_complete",
            ProgressField::MergeDone => "merge_done",
            ProgressField::CleanupDone => "cleanup_done",
            ProgressField::Failed => "failed",
            ProgressField::FailureReason => "failure_reason",
        }
    }
}

impl fmt::Display for ProgressField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Literal field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(Option<String>),
    Count(u32),
    Flag(bool),
}

/// One change to a field: overwrite, add one, or mark one partition done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    Set(FieldValue),
    Increment,
    Mark(u32),
}

impl FieldUpdate {
    pub fn text(value: impl Into<String>) -> Self {
        FieldUpdate::Set(FieldValue::Text(Some(value.into())))
    }

    pub fn count(value: u32) -> Self {
        FieldUpdate::Set(FieldValue::Count(value))
    }

    pub fn flag(value: bool) -> Self {
        FieldUpdate::Set(FieldValue::Flag(value))
    }
}
