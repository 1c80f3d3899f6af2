//! Read-only run inputs: the sample manifest and the reference contig table.

mod contigs;
mod manifest;

pub use contigs::{Contig, ContigTable};
pub use manifest::{Manifest, Sample};
