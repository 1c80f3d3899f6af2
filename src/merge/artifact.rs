//! Artifact codecs.
//!
//! Partition artifacts are tab-separated text written by the counting tool.
//! Contig and sample artifacts are written by this crate: a short header
//! (`WSSD`, format version, artifact kind) followed by a zstd-compressed
//! bincode body. Sample artifacts hold their contigs in table order and are
//! streamed one contig at a time on both write and read.

use super::counts::ContigCounts;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"WSSD";
const FORMAT_VERSION: u16 = 1;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ArtifactKind {
    Contig = 1,
    Sample = 2,
}

fn write_header<W: Write>(writer: &mut W, kind: ArtifactKind) -> std::io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&[kind as u8])
}

fn read_header<R: Read>(reader: &mut R, key: &str, kind: ArtifactKind) -> Result<()> {
    let mut header = [0u8; 7];
    reader
        .read_exact(&mut header)
        .map_err(|e| PipelineError::merge(key, format!("truncated header: {}", e)))?;

    if &header[..4] != MAGIC {
        return Err(PipelineError::merge(key, "not a wssd artifact"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(PipelineError::merge(
            key,
            format!("unsupported format version {}", version),
        ));
    }
    if header[6] != kind as u8 {
        return Err(PipelineError::merge(
            key,
            format!("expected {:?} artifact, found kind {}", kind, header[6]),
        ));
    }
    Ok(())
}

fn decode_err(key: &str) -> impl Fn(bincode::Error) -> PipelineError + '_ {
    move |e| PipelineError::merge(key, format!("corrupt artifact: {}", e))
}

/// Write `path` through a `.tmp` sibling so readers never see a partial file.
fn write_atomically<F>(path: &Path, body: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut writer = BufWriter::new(File::create(&tmp)?);
    body(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// One cell contribution from a partition artifact: (position, edit distance, count).
pub type Contribution = (u64, u16, u32);

#[derive(Debug, Deserialize)]
struct PartitionRow<'a> {
    contig: &'a str,
    position: u64,
    edit_distance: u16,
    count: u32,
}

/// Read the contributions a partition artifact makes to one contig.
///
/// Rows are `contig<TAB>position<TAB>edit_distance<TAB>count`. Rows for other
/// contigs (including unmapped `*` rows) are skipped.
pub fn read_partition_contributions(path: &Path, key: &str, contig: &str) -> Result<Vec<Contribution>> {
    let file = File::open(path)
        .map_err(|e| PipelineError::merge(key, format!("cannot open staged artifact: {}", e)))?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .from_reader(BufReader::new(file));

    let mut out = Vec::new();
    let mut record = csv::StringRecord::new();
    loop {
        let more = rdr
            .read_record(&mut record)
            .map_err(|e| PipelineError::merge(key, e.to_string()))?;
        if !more {
            break;
        }
        if record.get(0) != Some(contig) {
            continue;
        }
        let row: PartitionRow = record.deserialize(None).map_err(|e| {
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            PipelineError::merge(key, format!("line {}: {}", line, e))
        })?;
        debug_assert_eq!(row.contig, contig);
        out.push((row.position, row.edit_distance, row.count));
    }
    Ok(out)
}

/// Write a merged contig artifact.
pub fn write_contig_artifact(path: &Path, counts: &ContigCounts) -> Result<()> {
    write_atomically(path, |writer| {
        write_header(writer, ArtifactKind::Contig)?;
        let mut encoder = zstd::Encoder::new(writer, ZSTD_LEVEL)?;
        bincode::serialize_into(&mut encoder, counts)
            .map_err(|e| PipelineError::merge(path.display().to_string(), e.to_string()))?;
        encoder.finish()?;
        Ok(())
    })
}

/// Read a contig artifact, checking its shape.
pub fn read_contig_artifact(path: &Path, key: &str) -> Result<ContigCounts> {
    let file = File::open(path)
        .map_err(|e| PipelineError::merge(key, format!("cannot open staged artifact: {}", e)))?;
    let mut reader = BufReader::new(file);
    read_header(&mut reader, key, ArtifactKind::Contig)?;

    let decoder = zstd::Decoder::new(reader)
        .map_err(|e| PipelineError::merge(key, format!("corrupt artifact: {}", e)))?;
    let counts: ContigCounts = bincode::deserialize_from(decoder).map_err(decode_err(key))?;
    if !counts.is_consistent() {
        return Err(PipelineError::merge(
            key,
            format!("matrix shape {:?} does not match contig size {}", counts.counts.dim(), counts.size),
        ));
    }
    Ok(counts)
}

/// Leading section of a sample artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleHeader {
    pub sample: String,
    pub bin_size: u64,
    pub max_edit_distance: u16,
    /// Contig names in the order their matrices follow
    pub contigs: Vec<String>,
}

/// Streams contig matrices into a sample artifact in header order.
pub struct SampleWriter {
    encoder: zstd::Encoder<'static, BufWriter<File>>,
    header: SampleHeader,
    written: usize,
    tmp: PathBuf,
    path: PathBuf,
}

impl SampleWriter {
    pub fn create(path: &Path, header: SampleHeader) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        let mut writer = BufWriter::new(File::create(&tmp)?);
        write_header(&mut writer, ArtifactKind::Sample)?;
        let mut encoder = zstd::Encoder::new(writer, ZSTD_LEVEL)?;
        bincode::serialize_into(&mut encoder, &header)
            .map_err(|e| PipelineError::merge(&header.sample, e.to_string()))?;

        Ok(Self {
            encoder,
            header,
            written: 0,
            tmp,
            path: path.to_path_buf(),
        })
    }

    /// Append the next contig. Must match the header order.
    pub fn write_contig(&mut self, counts: &ContigCounts) -> Result<()> {
        let expected = self.header.contigs.get(self.written).ok_or_else(|| {
            PipelineError::merge(
                &self.header.sample,
                format!("unexpected extra contig {}", counts.contig),
            )
        })?;
        if &counts.contig != expected {
            return Err(PipelineError::merge(
                &self.header.sample,
                format!("contig {} written where {} was expected", counts.contig, expected),
            ));
        }
        if counts.bin_size != self.header.bin_size
            || counts.max_edit_distance() != self.header.max_edit_distance
        {
            return Err(PipelineError::merge(
                &self.header.sample,
                format!("contig {} was merged with different binning", counts.contig),
            ));
        }

        bincode::serialize_into(&mut self.encoder, counts)
            .map_err(|e| PipelineError::merge(&self.header.sample, e.to_string()))?;
        self.written += 1;
        Ok(())
    }

    /// Complete the artifact. Fails if any contig is missing.
    pub fn finish(self) -> Result<()> {
        if self.written != self.header.contigs.len() {
            let missing = &self.header.contigs[self.written];
            return Err(PipelineError::merge(
                &self.header.sample,
                format!("contig {} never written", missing),
            ));
        }
        let mut writer = self.encoder.finish()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        std::fs::rename(&self.tmp, &self.path)?;
        Ok(())
    }
}

/// A fully decoded sample artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleArtifact {
    pub header: SampleHeader,
    pub contigs: Vec<ContigCounts>,
}

impl SampleArtifact {
    pub fn contig(&self, name: &str) -> Option<&ContigCounts> {
        self.contigs.iter().find(|c| c.contig == name)
    }
}

/// Read a whole sample artifact.
pub fn read_sample_artifact(path: &Path, key: &str) -> Result<SampleArtifact> {
    let file = File::open(path)
        .map_err(|e| PipelineError::merge(key, format!("cannot open staged artifact: {}", e)))?;
    let mut reader = BufReader::new(file);
    read_header(&mut reader, key, ArtifactKind::Sample)?;

    let mut decoder = zstd::Decoder::new(reader)
        .map_err(|e| PipelineError::merge(key, format!("corrupt artifact: {}", e)))?;
    let header: SampleHeader = bincode::deserialize_from(&mut decoder).map_err(decode_err(key))?;

    let mut contigs = Vec::with_capacity(header.contigs.len());
    for name in &header.contigs {
        let counts: ContigCounts = bincode::deserialize_from(&mut decoder).map_err(decode_err(key))?;
        if &counts.contig != name || !counts.is_consistent() {
            return Err(PipelineError::merge(
                key,
                format!("contig {} out of order or malformed", counts.contig),
            ));
        }
        contigs.push(counts);
    }
    Ok(SampleArtifact { header, contigs })
}
