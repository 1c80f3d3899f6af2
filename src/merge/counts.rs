//! Dense per-contig count matrices.

use crate::inputs::Contig;
use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// One alignment hit: a read placed at `position` with `edit_distance` mismatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitRecord {
    pub contig: String,
    pub position: u64,
    pub edit_distance: u16,
}

impl HitRecord {
    /// Parse a `contig<TAB>position<TAB>edit_distance` line.
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let mut fields = line.split('\t');
        let (contig, position, edist) = match (fields.next(), fields.next(), fields.next()) {
            (Some(c), Some(p), Some(e)) => (c, p, e),
            _ => return Err(format!("expected 3 tab-separated fields in '{}'", line)),
        };
        let position = position
            .trim()
            .parse()
            .map_err(|_| format!("invalid position '{}'", position))?;
        let edit_distance = edist
            .trim()
            .parse()
            .map_err(|_| format!("invalid edit distance '{}'", edist))?;
        Ok(Self {
            contig: contig.to_string(),
            position,
            edit_distance,
        })
    }
}

/// Read counts for one contig, binned by position and split by edit distance.
///
/// Shape: (bins, max_edit_distance + 1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContigCounts {
    pub contig: String,
    pub size: u64,
    pub bin_size: u64,
    pub counts: Array2<u32>,
}

impl ContigCounts {
    /// All-zero counts covering the whole contig.
    pub fn zeros(contig: &Contig, bin_size: u64, max_edit_distance: u16) -> Self {
        let bin_size = bin_size.max(1);
        Self {
            contig: contig.name.clone(),
            size: contig.size,
            bin_size,
            counts: Array2::zeros((contig.num_bins(bin_size), max_edit_distance as usize + 1)),
        }
    }

    pub fn num_bins(&self) -> usize {
        self.counts.nrows()
    }

    pub fn max_edit_distance(&self) -> u16 {
        (self.counts.ncols().saturating_sub(1)) as u16
    }

    /// Whether the matrix shape matches the contig size and bin size it claims.
    pub fn is_consistent(&self) -> bool {
        self.bin_size > 0
            && self.counts.ncols() > 0
            && self.num_bins() as u64 == self.size.div_ceil(self.bin_size)
    }

    /// Add `count` hits at a position. Returns false if the hit falls outside
    /// the contig or above the tracked edit distance.
    pub fn add(&mut self, position: u64, edit_distance: u16, count: u32) -> bool {
        if position >= self.size || edit_distance as usize >= self.counts.ncols() {
            return false;
        }
        let bin = (position / self.bin_size) as usize;
        let cell = &mut self.counts[[bin, edit_distance as usize]];
        *cell = cell.saturating_add(count);
        true
    }

    /// Sum another matrix for the same contig into this one.
    pub fn merge(&mut self, other: &ContigCounts) -> Result<(), String> {
        if self.contig != other.contig || self.counts.dim() != other.counts.dim() {
            return Err(format!(
                "cannot merge {} {:?} into {} {:?}",
                other.contig,
                other.counts.dim(),
                self.contig,
                self.counts.dim()
            ));
        }
        Zip::from(&mut self.counts)
            .and(&other.counts)
            .for_each(|a, &b| *a = a.saturating_add(b));
        Ok(())
    }

    pub fn get(&self, bin: usize, edit_distance: u16) -> u32 {
        self.counts
            .get([bin, edit_distance as usize])
            .copied()
            .unwrap_or(0)
    }

    /// Total hits in a bin across all edit distances.
    pub fn bin_total(&self, bin: usize) -> u64 {
        if bin >= self.num_bins() {
            return 0;
        }
        self.counts
            .index_axis(Axis(0), bin)
            .iter()
            .map(|&c| c as u64)
            .sum()
    }

    /// Total hits in the contig.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

/// Live merge statistics for one contig.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStats {
    /// Records for this contig that were consumed
    pub streamed: u64,
    /// Records for this contig outside its range
    pub dropped: u64,
}

/// Streaming accumulator for live merges.
///
/// Hits for the target contig are buffered and folded into the matrix once the
/// buffer reaches its capacity; hits for other contigs are ignored.
#[derive(Debug)]
pub struct LiveAccumulator {
    counts: ContigCounts,
    buffer: Vec<(u64, u16)>,
    capacity: usize,
    stats: LiveStats,
}

impl LiveAccumulator {
    pub fn new(counts: ContigCounts, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            counts,
            buffer: Vec::with_capacity(capacity.min(1 << 20)),
            capacity,
            stats: LiveStats::default(),
        }
    }

    pub fn push(&mut self, hit: &HitRecord) {
        if hit.contig != self.counts.contig {
            return;
        }
        self.stats.streamed += 1;
        self.buffer.push((hit.position, hit.edit_distance));
        if self.buffer.len() >= self.capacity {
            self.flush();
        }
    }

    /// Fold buffered hits into the matrix.
    pub fn flush(&mut self) {
        for (position, edist) in self.buffer.drain(..) {
            if !self.counts.add(position, edist, 1) {
                self.stats.dropped += 1;
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn finish(mut self) -> (ContigCounts, LiveStats) {
        self.flush();
        (self.counts, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chr1() -> Contig {
        Contig::new("chr1", 100)
    }

    #[test]
    fn test_zeros_shape() {
        let counts = ContigCounts::zeros(&chr1(), 30, 3);
        assert_eq!(counts.counts.dim(), (4, 4));
        assert_eq!(counts.max_edit_distance(), 3);
        assert!(counts.is_consistent());
        assert_eq!(counts.total(), 0);
    }

    #[test]
    fn test_add_bins_and_drops() {
        let mut counts = ContigCounts::zeros(&chr1(), 10, 2);
        assert!(counts.add(0, 0, 1));
        assert!(counts.add(9, 1, 2));
        assert!(counts.add(99, 2, 1));
        assert!(!counts.add(100, 0, 1));
        assert!(!counts.add(5, 3, 1));

        assert_eq!(counts.get(0, 0), 1);
        assert_eq!(counts.get(0, 1), 2);
        assert_eq!(counts.bin_total(0), 3);
        assert_eq!(counts.bin_total(9), 1);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_merge_sums_and_saturates() {
        let mut a = ContigCounts::zeros(&chr1(), 1, 0);
        let mut b = ContigCounts::zeros(&chr1(), 1, 0);
        a.add(10, 0, u32::MAX - 1);
        b.add(10, 0, 5);
        b.add(11, 0, 1);
        a.merge(&b).unwrap();
        assert_eq!(a.get(10, 0), u32::MAX);
        assert_eq!(a.get(11, 0), 1);
    }

    #[test]
    fn test_merge_rejects_shape_mismatch() {
        let mut a = ContigCounts::zeros(&chr1(), 1, 3);
        let b = ContigCounts::zeros(&chr1(), 10, 3);
        assert!(a.merge(&b).is_err());
        let c = ContigCounts::zeros(&Contig::new("chr2", 100), 1, 3);
        assert!(a.merge(&c).is_err());
    }

    #[test]
    fn test_parse_hit_line() {
        let hit = HitRecord::parse_line("chr1\t42\t1").unwrap();
        assert_eq!(hit.contig, "chr1");
        assert_eq!(hit.position, 42);
        assert_eq!(hit.edit_distance, 1);
        assert!(HitRecord::parse_line("chr1\t42").is_err());
        assert!(HitRecord::parse_line("chr1\tx\t1").is_err());
    }

    #[test]
    fn test_live_accumulator_filters_and_flushes() {
        let mut acc = LiveAccumulator::new(ContigCounts::zeros(&chr1(), 1, 1), 2);
        let hit = |contig: &str, position, edit_distance| HitRecord {
            contig: contig.to_string(),
            position,
            edit_distance,
        };

        acc.push(&hit("chr1", 10, 0));
        assert_eq!(acc.buffered(), 1);
        acc.push(&hit("chr2", 10, 0));
        assert_eq!(acc.buffered(), 1);
        acc.push(&hit("chr1", 10, 1));
        assert_eq!(acc.buffered(), 0);
        acc.push(&hit("chr1", 500, 0));

        let (counts, stats) = acc.finish();
        assert_eq!(counts.bin_total(10), 2);
        assert_eq!(stats, LiveStats { streamed: 3, dropped: 1 });
    }

    proptest! {
        #[test]
        fn prop_merge_order_independent(
            parts in prop::collection::vec(
                prop::collection::vec((0u64..100, 0u16..4, 1u32..50), 0..20),
                1..6,
            )
        ) {
            let contig = chr1();
            let build = |hits: &[(u64, u16, u32)]| {
                let mut c = ContigCounts::zeros(&contig, 7, 3);
                for &(p, e, n) in hits {
                    c.add(p, e, n);
                }
                c
            };

            let mut forward = ContigCounts::zeros(&contig, 7, 3);
            for part in &parts {
                forward.merge(&build(part)).unwrap();
            }
            let mut backward = ContigCounts::zeros(&contig, 7, 3);
            for part in parts.iter().rev() {
                backward.merge(&build(part)).unwrap();
            }

            let expected: u64 = parts.iter().flatten().map(|&(_, _, n)| n as u64).sum();
            prop_assert_eq!(&forward, &backward);
            prop_assert_eq!(forward.total(), expected);
        }
    }
}
