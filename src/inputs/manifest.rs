//! Sample manifest loading.
//!
//! The manifest is a tab-separated table with a header row. Column names are
//! matched flexibly so manifests from different pipeline variants load as-is.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

/// One sample to process. Immutable for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    /// Sample identifier
    #[serde(alias = "sample", alias = "sample_id", alias = "sample_name")]
    pub sn: String,

    /// Object store key of the raw sequence data
    #[serde(alias = "path", alias = "cram", alias = "bam", alias = "raw")]
    pub raw_key: String,

    /// Object store key of the raw data's index
    #[serde(alias = "index", alias = "crai", alias = "bai")]
    pub index_key: String,
}

/// Ordered list of samples from the manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    samples: Vec<Sample>,
}

impl Manifest {
    /// Build a manifest from samples, rejecting duplicate identifiers.
    pub fn new(samples: Vec<Sample>) -> Result<Self> {
        let mut seen = HashSet::new();
        for sample in &samples {
            if sample.sn.is_empty() {
                return Err(PipelineError::config("manifest contains an empty sample identifier"));
            }
            if !seen.insert(sample.sn.as_str()) {
                return Err(PipelineError::config(format!(
                    "manifest lists sample '{}' more than once",
                    sample.sn
                )));
            }
        }
        Ok(Self { samples })
    }

    /// Load the manifest from a tab-separated file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::config(format!("cannot open manifest {}: {}", path.display(), e))
        })?;
        let manifest = Self::from_reader(file)?;
        tracing::info!("Loaded {} samples from {}", manifest.len(), path.display());
        Ok(manifest)
    }

    /// Parse a manifest from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut samples = Vec::new();
        for (line, row) in rdr.deserialize::<Sample>().enumerate() {
            let sample = row.map_err(|e| {
                PipelineError::config(format!("manifest row {}: {}", line + 1, e))
            })?;
            samples.push(sample);
        }

        if samples.is_empty() {
            return Err(PipelineError::config("manifest contains no samples"));
        }
        Self::new(samples)
    }

    /// Samples in manifest order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Look up a sample by identifier.
    pub fn get(&self, sn: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.sn == sn)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let tsv = "sn\tpath\tindex\nS1\traw/S1.cram\traw/S1.cram.crai\nS2\traw/S2.cram\traw/S2.cram.crai\n";
        let manifest = Manifest::from_reader(tsv.as_bytes()).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.samples()[0].sn, "S1");
        assert_eq!(manifest.samples()[1].index_key, "raw/S2.cram.crai");
        assert_eq!(manifest.get("S2").unwrap().raw_key, "raw/S2.cram");
    }

    #[test]
    fn test_parse_manifest_alternate_headers() {
        let tsv = "sample\tcram\tcrai\nNA12878\tdata/NA12878.cram\tdata/NA12878.crai\n";
        let manifest = Manifest::from_reader(tsv.as_bytes()).unwrap();
        assert_eq!(manifest.samples()[0].sn, "NA12878");
        assert_eq!(manifest.samples()[0].raw_key, "data/NA12878.cram");
    }

    #[test]
    fn test_duplicate_sample_rejected() {
        let tsv = "sn\tpath\tindex\nS1\ta\tb\nS1\tc\td\n";
        let err = Manifest::from_reader(tsv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("S1"));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let tsv = "sn\tpath\tindex\n";
        assert!(matches!(
            Manifest::from_reader(tsv.as_bytes()),
            Err(PipelineError::Config { .. })
        ));
    }

    #[test]
    fn test_missing_column_rejected() {
        let tsv = "sn\tpath\nS1\ta\n";
        assert!(Manifest::from_reader(tsv.as_bytes()).is_err());
    }
}
