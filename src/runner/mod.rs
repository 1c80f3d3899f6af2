//! External counting tool abstraction.
//!
//! The scheduler and merge engine only see [`CountingTool`]; [`ProcessTool`]
//! is the implementation that shells out to the configured executable.

mod process;

pub use process::ProcessTool;

use crate::error::Result;
use crate::merge::HitRecord;
use futures::stream::BoxStream;
use std::future::Future;
use std::path::{Path, PathBuf};

/// Stream of hit records produced by a live counting run.
pub type HitStream = BoxStream<'static, Result<HitRecord>>;

/// Everything the counting tool needs to process one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    /// Sample identifier, for logging
    pub sample: String,
    /// Staged raw sequence data
    pub input: PathBuf,
    /// Staged index of the raw data
    pub index: PathBuf,
    /// Partition index in `[0, mapped + unmapped)`
    pub partition: u32,
    /// Mapped partitions in the plan
    pub total_mapped: u32,
    /// Unmapped partitions in the plan
    pub unmapped: u32,
    /// Reference handed to the tool, if configured
    pub reference: Option<PathBuf>,
}

impl PartitionRequest {
    /// Command-line arguments describing this request.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--input".to_string(),
            self.input.display().to_string(),
            "--index".to_string(),
            self.index.display().to_string(),
            "--partition".to_string(),
            self.partition.to_string(),
            "--total-partitions".to_string(),
            self.total_mapped.to_string(),
            "--unmapped-partitions".to_string(),
            self.unmapped.to_string(),
        ];
        if let Some(reference) = &self.reference {
            args.push("--reference".to_string());
            args.push(reference.display().to_string());
        }
        args
    }
}

/// Capability to count reads for one partition.
pub trait CountingTool: Send + Sync + 'static {
    /// Produce the partition's count artifact at `output`.
    fn count_partition(
        &self,
        request: &PartitionRequest,
        output: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stream the partition's hit records without materializing them.
    fn stream_hits(&self, request: &PartitionRequest) -> impl Future<Output = Result<HitStream>> + Send;
}
