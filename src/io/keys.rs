//! Hierarchical artifact keys: `{prefix}/{stage}/{sample}/...`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage owning an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Partitions,
    Contigs,
    Samples,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Partitions => "partitions",
            Stage::Contigs => "contigs",
            Stage::Samples => "samples",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PARTITION_SUFFIX: &str = ".counts.tsv";

/// Builds object keys for every artifact the pipeline produces.
#[derive(Debug, Clone, Default)]
pub struct KeyLayout {
    prefix: Option<String>,
    bucket: Option<String>,
}

impl KeyLayout {
    /// Create a layout rooted at an optional key prefix. `bucket` lets
    /// manifest entries given as `s3://bucket/key` resolve to plain keys.
    pub fn new(prefix: Option<&str>, bucket: Option<&str>) -> Self {
        Self {
            prefix: prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            bucket: bucket.map(str::to_string),
        }
    }

    fn stage_dir(&self, stage: Stage, sn: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}/{}", prefix, stage, sn),
            None => format!("{}/{}", stage, sn),
        }
    }

    /// Key of one partition's partial counts.
    pub fn partition(&self, sn: &str, partition: u32) -> String {
        format!(
            "{}/{}.part{:05}{}",
            self.stage_dir(Stage::Partitions, sn),
            sn,
            partition,
            PARTITION_SUFFIX
        )
    }

    /// Prefix under which all of a sample's partition artifacts live.
    pub fn partition_prefix(&self, sn: &str) -> String {
        self.stage_dir(Stage::Partitions, sn)
    }

    /// Key of a merged per-contig artifact.
    pub fn contig(&self, sn: &str, contig: &str) -> String {
        format!("{}/{}.{}.wssd", self.stage_dir(Stage::Contigs, sn), sn, contig)
    }

    /// Key of the final per-sample artifact.
    pub fn sample(&self, sn: &str) -> String {
        format!("{}/{}.wssd", self.stage_dir(Stage::Samples, sn), sn)
    }

    /// Normalize a manifest source location into a store key.
    ///
    /// `s3://bucket/key` for the configured bucket becomes `key`; anything
    /// else is used verbatim minus leading slashes.
    pub fn source(&self, location: &str) -> String {
        if let Ok((bucket, key)) = super::parse_s3_uri(location) {
            if self.bucket.as_deref() == Some(bucket) {
                return key.to_string();
            }
        }
        location.trim_start_matches('/').to_string()
    }

    /// Recover the partition index from a partition key.
    pub fn partition_index(key: &str) -> Option<u32> {
        let name = key.rsplit('/').next()?;
        let stem = name.strip_suffix(PARTITION_SUFFIX)?;
        let (_, idx) = stem.rsplit_once(".part")?;
        idx.parse().ok()
    }
}
