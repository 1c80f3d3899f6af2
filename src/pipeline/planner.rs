//! Partition planning.

use crate::config::PartitionConfig;
use crate::error::{PipelineError, Result};
use serde::Serialize;

/// Work units for one sample: mapped shards first, then unmapped shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub mapped: u32,
    pub unmapped: u32,
}

impl PartitionPlan {
    pub fn total(&self) -> u32 {
        self.mapped + self.unmapped
    }

    /// Every partition index.
    pub fn partitions(&self) -> std::ops::Range<u32> {
        0..self.total()
    }

    pub fn is_unmapped(&self, partition: u32) -> bool {
        partition >= self.mapped && partition < self.total()
    }

    pub fn from_config(config: &PartitionConfig) -> Result<Self> {
        plan(config.mapped, config.unmapped_divisor, config.unmapped)
    }
}

/// Compute the partition plan.
///
/// `unmapped = max(mapped / divisor, 1)` unless `unmapped_override` is given,
/// in which case it is used verbatim.
pub fn plan(mapped: u32, divisor: u32, unmapped_override: Option<u32>) -> Result<PartitionPlan> {
    if mapped < 1 {
        return Err(PipelineError::config("mapped partition count must be at least 1"));
    }
    let unmapped = match unmapped_override {
        Some(n) => n,
        None => {
            if divisor < 1 {
                return Err(PipelineError::config("unmapped partition divisor must be at least 1"));
            }
            (mapped / divisor).max(1)
        }
    };
    mapped
        .checked_add(unmapped)
        .ok_or_else(|| PipelineError::config("partition count overflows"))?;
    Ok(PartitionPlan { mapped, unmapped })
}
