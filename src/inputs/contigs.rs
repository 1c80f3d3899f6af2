//! Reference contig table.
//!
//! The table order is the merge order: every per-sample merge walks contigs
//! in exactly this sequence so output is reproducible.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A named reference sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contig {
    pub name: String,
    pub size: u64,
}

impl Contig {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Number of bins needed to cover the contig.
    pub fn num_bins(&self, bin_size: u64) -> usize {
        self.size.div_ceil(bin_size.max(1)) as usize
    }
}

/// Contigs in reference table order.
#[derive(Debug, Clone, Default)]
pub struct ContigTable {
    contigs: Vec<Contig>,
    by_name: HashMap<String, usize>,
}

impl ContigTable {
    /// Build a table, rejecting duplicate names.
    pub fn new(contigs: Vec<Contig>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(contigs.len());
        for (i, contig) in contigs.iter().enumerate() {
            if by_name.insert(contig.name.clone(), i).is_some() {
                return Err(PipelineError::config(format!(
                    "contig '{}' listed more than once",
                    contig.name
                )));
            }
        }
        Ok(Self { contigs, by_name })
    }

    /// Load from a file of `name size` lines.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read contig table {}: {}", path.display(), e))
        })?;
        let table = Self::parse(&text)?;
        tracing::info!("Loaded {} contigs from {}", table.len(), path.display());
        Ok(table)
    }

    /// Parse whitespace-separated `name size` lines. Extra columns are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut contigs = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (name, size) = match (fields.next(), fields.next()) {
                (Some(name), Some(size)) => (name, size),
                _ => {
                    return Err(PipelineError::config(format!(
                        "contig table line {}: expected 'name size'",
                        lineno + 1
                    )))
                }
            };
            let size: u64 = size.parse().map_err(|_| {
                PipelineError::config(format!(
                    "contig table line {}: invalid size '{}'",
                    lineno + 1,
                    size
                ))
            })?;
            contigs.push(Contig::new(name, size));
        }

        if contigs.is_empty() {
            return Err(PipelineError::config("contig table is empty"));
        }
        Self::new(contigs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contig> {
        self.contigs.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Contig> {
        self.by_name.get(name).map(|&i| &self.contigs[i])
    }

    /// Position of a contig in table order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.contigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contigs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preserves_order() {
        let table = ContigTable::parse("chr2 50\nchr1\t100\n# comment\n\nchrX 7 extra\n").unwrap();
        let names: Vec<_> = table.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["chr2", "chr1", "chrX"]);
        assert_eq!(table.get("chr1").unwrap().size, 100);
        assert_eq!(table.position("chrX"), Some(2));
    }

    #[test]
    fn test_parse_rejects_bad_size() {
        assert!(ContigTable::parse("chr1 lots\n").is_err());
        assert!(ContigTable::parse("chr1\n").is_err());
        assert!(ContigTable::parse("").is_err());
    }

    #[test]
    fn test_duplicate_contig_rejected() {
        assert!(ContigTable::parse("chr1 10\nchr1 20\n").is_err());
    }

    #[test]
    fn test_num_bins() {
        let contig = Contig::new("chr1", 100);
        assert_eq!(contig.num_bins(1), 100);
        assert_eq!(contig.num_bins(30), 4);
        assert_eq!(Contig::new("chrM", 0).num_bins(10), 0);
    }
}
