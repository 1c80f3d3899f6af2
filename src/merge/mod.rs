//! Count accumulation, artifact encoding and the merge engine.

mod artifact;
mod counts;
mod engine;

pub use artifact::{
    read_contig_artifact, read_partition_contributions, read_sample_artifact, write_contig_artifact,
    Contribution, SampleArtifact, SampleHeader, SampleWriter,
};
pub use counts::{ContigCounts, HitRecord, LiveAccumulator, LiveStats};
pub use engine::MergeEngine;
