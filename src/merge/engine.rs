//! Merge engine: partition artifacts into contig artifacts, contig artifacts
//! into the sample artifact.
//!
//! Merging is CPU-bound and runs on the blocking pool, fanning out over Rayon
//! for partition parsing. Staging of inputs goes through the storage adapter
//! with bounded concurrency.

use super::artifact::{
    read_contig_artifact, read_partition_contributions, write_contig_artifact, Contribution,
    SampleHeader, SampleWriter,
};
use super::counts::{ContigCounts, LiveAccumulator};
use crate::config::{InputMatching, MergeConfig};
use crate::error::{PipelineError, Result};
use crate::inputs::{Contig, ContigTable};
use crate::io::{KeyLayout, Storage};
use crate::pipeline::Metrics;
use crate::runner::{CountingTool, PartitionRequest};
use futures::{StreamExt, TryStreamExt};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Combines sharded counts into contig and sample artifacts.
pub struct MergeEngine {
    storage: Arc<Storage>,
    layout: KeyLayout,
    contigs: Arc<ContigTable>,
    settings: MergeConfig,
    metrics: Arc<Metrics>,
}

impl MergeEngine {
    pub fn new(
        storage: Arc<Storage>,
        layout: KeyLayout,
        contigs: Arc<ContigTable>,
        settings: MergeConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            layout,
            contigs,
            settings,
            metrics,
        }
    }

    fn contig(&self, name: &str) -> Result<Contig> {
        self.contigs
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::config(format!("contig '{}' not in contig table", name)))
    }

    /// Partition artifact keys feeding a batch merge.
    async fn partition_inputs(&self, sn: &str, declared: &[String], expected: u32) -> Result<Vec<String>> {
        match self.settings.input_matching {
            InputMatching::Explicit => Ok(declared.to_vec()),
            InputMatching::Prefix => {
                let listed = self.storage.list(&self.layout.partition_prefix(sn)).await?;
                let mut by_index: BTreeMap<u32, String> = listed
                    .into_iter()
                    .filter_map(|key| KeyLayout::partition_index(&key).map(|i| (i, key)))
                    .collect();

                let mut keys = Vec::with_capacity(expected as usize);
                for partition in 0..expected {
                    match by_index.remove(&partition) {
                        Some(key) => keys.push(key),
                        None => {
                            return Err(PipelineError::merge(
                                self.layout.partition(sn, partition),
                                "partition artifact missing",
                            ))
                        }
                    }
                }
                if !by_index.is_empty() {
                    tracing::warn!(
                        "Sample {}: ignoring {} partition artifacts beyond the planned {}",
                        sn,
                        by_index.len(),
                        expected
                    );
                }
                Ok(keys)
            }
        }
    }

    /// Stage inputs in order. A missing input becomes a merge error naming its key.
    async fn stage_inputs(&self, keys: &[String]) -> Result<Vec<(String, PathBuf)>> {
        futures::stream::iter(keys.iter().cloned())
            .map(|key| async move {
                match self.storage.stage(&key).await {
                    Ok(path) => Ok((key, path)),
                    Err(PipelineError::NotFound { .. }) => {
                        Err(PipelineError::merge(key, "merge input missing"))
                    }
                    Err(e) => Err(e),
                }
            })
            .buffered(self.settings.stage_concurrency.max(1))
            .try_collect()
            .await
    }

    /// Batch merge: sum every partition artifact's contributions to one contig.
    ///
    /// `declared` are the partition keys the task graph lists as dependencies;
    /// with prefix matching the sample's partition prefix is listed instead and
    /// `expected` partitions must be found. Returns the contig artifact key.
    pub async fn merge_contig_batch(
        &self,
        sn: &str,
        contig_name: &str,
        declared: &[String],
        expected: u32,
    ) -> Result<String> {
        let start = Instant::now();
        let contig = self.contig(contig_name)?;
        let keys = self.partition_inputs(sn, declared, expected).await?;
        let staged = self.stage_inputs(&keys).await?;

        let output_key = self.layout.contig(sn, &contig.name);
        let local = self.storage.local_path(&output_key);
        let bin_size = self.settings.bin_size;
        let max_edist = self.settings.max_edit_distance;

        let write_path = local.clone();
        let (total, dropped) = tokio::task::spawn_blocking(move || -> Result<(u64, u64)> {
            let parts: Vec<Vec<Contribution>> = staged
                .par_iter()
                .map(|(key, path)| read_partition_contributions(path, key, &contig.name))
                .collect::<Result<_>>()?;

            let mut counts = ContigCounts::zeros(&contig, bin_size, max_edist);
            let mut dropped = 0u64;
            for &(position, edist, n) in parts.iter().flatten() {
                if !counts.add(position, edist, n) {
                    dropped += 1;
                }
            }
            write_contig_artifact(&write_path, &counts)?;
            Ok((counts.total(), dropped))
        })
        .await
        .map_err(|e| PipelineError::merge(&output_key, format!("merge task failed: {}", e)))??;

        self.storage.publish(&local, &output_key).await?;

        self.metrics.add_hits_dropped(dropped);
        self.metrics.add_merge_contig_time(start.elapsed());
        if dropped > 0 {
            tracing::warn!(
                "Sample {} {}: dropped {} out-of-range records",
                sn,
                contig_name,
                dropped
            );
        }
        tracing::debug!(
            "Sample {} {}: merged {} partitions, {} hits",
            sn,
            contig_name,
            keys.len(),
            total
        );
        Ok(output_key)
    }

    /// Live merge: stream every partition's hits from the counting tool and
    /// keep those on one contig. Returns the contig artifact key.
    pub async fn merge_contig_live<T: CountingTool>(
        &self,
        tool: &T,
        sn: &str,
        contig_name: &str,
        requests: &[PartitionRequest],
    ) -> Result<String> {
        let start = Instant::now();
        let contig = self.contig(contig_name)?;
        let zeros = ContigCounts::zeros(&contig, self.settings.bin_size, self.settings.max_edit_distance);
        let mut acc = LiveAccumulator::new(zeros, self.settings.max_basepairs_in_mem);

        for request in requests {
            let mut hits = tool.stream_hits(request).await?;
            while let Some(hit) = hits.try_next().await? {
                acc.push(&hit);
            }
        }
        let (counts, stats) = acc.finish();

        let output_key = self.layout.contig(sn, &contig.name);
        let local = self.storage.local_path(&output_key);
        let write_path = local.clone();
        tokio::task::spawn_blocking(move || write_contig_artifact(&write_path, &counts))
            .await
            .map_err(|e| PipelineError::merge(&output_key, format!("merge task failed: {}", e)))??;

        self.storage.publish(&local, &output_key).await?;

        self.metrics.add_hits(stats.streamed, stats.dropped);
        self.metrics.add_merge_contig_time(start.elapsed());
        tracing::debug!(
            "Sample {} {}: live merged {} partitions, {} hits ({} dropped)",
            sn,
            contig_name,
            requests.len(),
            stats.streamed,
            stats.dropped
        );
        Ok(output_key)
    }

    /// Combine every contig artifact of a sample, in contig table order, into
    /// the sample artifact. Returns the sample artifact key.
    pub async fn merge_sample(&self, sn: &str) -> Result<String> {
        let start = Instant::now();
        let keys: Vec<String> = self
            .contigs
            .iter()
            .map(|c| self.layout.contig(sn, &c.name))
            .collect();
        let staged = self.stage_inputs(&keys).await?;

        let header = SampleHeader {
            sample: sn.to_string(),
            bin_size: self.settings.bin_size.max(1),
            max_edit_distance: self.settings.max_edit_distance,
            contigs: self.contigs.iter().map(|c| c.name.clone()).collect(),
        };

        let output_key = self.layout.sample(sn);
        let local = self.storage.local_path(&output_key);
        let write_path = local.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = SampleWriter::create(&write_path, header.clone())?;
            for (name, (key, path)) in header.contigs.iter().zip(&staged) {
                let counts = read_contig_artifact(path, key)?;
                if &counts.contig != name {
                    return Err(PipelineError::merge(
                        key.as_str(),
                        format!("holds contig {}, expected {}", counts.contig, name),
                    ));
                }
                if counts.bin_size != header.bin_size
                    || counts.max_edit_distance() != header.max_edit_distance
                {
                    return Err(PipelineError::merge(
                        key.as_str(),
                        "merged with different bin size or edit distance range",
                    ));
                }
                writer.write_contig(&counts)?;
            }
            writer.finish()
        })
        .await
        .map_err(|e| PipelineError::merge(&output_key, format!("merge task failed: {}", e)))??;

        self.storage.publish(&local, &output_key).await?;

        self.metrics.add_merge_sample_time(start.elapsed());
        tracing::info!("Sample {}: merged {} contigs into {}", sn, keys.len(), output_key);
        Ok(output_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::merge::{read_sample_artifact, HitRecord};
    use crate::runner::HitStream;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::{ObjectStore, PutPayload};
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<dyn ObjectStore>,
        storage: Arc<Storage>,
        layout: KeyLayout,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let retry = RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        let storage = Arc::new(Storage::new(store.clone(), dir.path().join("staging"), retry, 4));
        Fixture {
            _dir: dir,
            store,
            storage,
            layout: KeyLayout::new(None, None),
        }
    }

    fn table() -> Arc<ContigTable> {
        Arc::new(ContigTable::parse("chr1 100\nchr2 50\n").unwrap())
    }

    fn engine(fx: &Fixture, settings: MergeConfig) -> MergeEngine {
        MergeEngine::new(
            fx.storage.clone(),
            fx.layout.clone(),
            table(),
            settings,
            Metrics::new(),
        )
    }

    async fn put(store: &Arc<dyn ObjectStore>, key: &str, body: &str) {
        store
            .put(&ObjectPath::from(key), PutPayload::from(body.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    async fn fetch_contig(fx: &Fixture, key: &str) -> ContigCounts {
        fx.storage.remove_local(key).await.unwrap();
        let path = fx.storage.stage(key).await.unwrap();
        read_contig_artifact(&path, key).unwrap()
    }

    #[tokio::test]
    async fn test_batch_merge_sums_partitions() {
        let fx = fixture();
        let engine = engine(&fx, MergeConfig::default());

        let mut keys = Vec::new();
        for p in 0..5 {
            let key = fx.layout.partition("S1", p);
            let body = if p < 4 { "chr1\t10\t0\t1\n" } else { "*\t0\t0\t7\n" };
            put(&fx.store, &key, body).await;
            keys.push(key);
        }

        let out = engine.merge_contig_batch("S1", "chr1", &keys, 5).await.unwrap();
        assert_eq!(out, "contigs/S1/S1.chr1.wssd");

        let counts = fetch_contig(&fx, &out).await;
        assert_eq!(counts.get(10, 0), 4);
        assert_eq!(counts.total(), 4);

        let out = engine.merge_contig_batch("S1", "chr2", &keys, 5).await.unwrap();
        assert_eq!(fetch_contig(&fx, &out).await.total(), 0);
    }

    #[tokio::test]
    async fn test_batch_merge_missing_partition_names_key() {
        let fx = fixture();
        let engine = engine(&fx, MergeConfig::default());
        let present = fx.layout.partition("S1", 0);
        put(&fx.store, &present, "chr1\t1\t0\t1\n").await;
        let missing = fx.layout.partition("S1", 1);

        let err = engine
            .merge_contig_batch("S1", "chr1", &[present, missing.clone()], 2)
            .await
            .unwrap_err();
        match err {
            PipelineError::Merge { key, .. } => assert_eq!(key, missing),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_prefix_matching_discovers_partitions() {
        let fx = fixture();
        let settings = MergeConfig {
            input_matching: InputMatching::Prefix,
            ..MergeConfig::default()
        };
        let engine = engine(&fx, settings);
        for p in 0..3 {
            put(&fx.store, &fx.layout.partition("S1", p), "chr1\t0\t1\t2\n").await;
        }

        let out = engine.merge_contig_batch("S1", "chr1", &[], 3).await.unwrap();
        assert_eq!(fetch_contig(&fx, &out).await.get(0, 1), 6);

        let err = engine.merge_contig_batch("S1", "chr1", &[], 4).await.unwrap_err();
        match err {
            PipelineError::Merge { key, .. } => assert_eq!(key, fx.layout.partition("S1", 3)),
            other => panic!("unexpected error: {}", other),
        }
    }

    struct ScriptedTool;

    impl CountingTool for ScriptedTool {
        async fn count_partition(&self, _request: &PartitionRequest, _output: &Path) -> Result<()> {
            Ok(())
        }

        async fn stream_hits(&self, request: &PartitionRequest) -> Result<HitStream> {
            let hits: Vec<Result<HitRecord>> = vec![
                Ok(HitRecord {
                    contig: "chr1".to_string(),
                    position: 10,
                    edit_distance: 0,
                }),
                Ok(HitRecord {
                    contig: "chr2".to_string(),
                    position: request.partition as u64,
                    edit_distance: 1,
                }),
            ];
            Ok(futures::stream::iter(hits).boxed())
        }
    }

    fn requests(n: u32) -> Vec<PartitionRequest> {
        (0..n)
            .map(|partition| PartitionRequest {
                sample: "S1".to_string(),
                input: PathBuf::from("S1.cram"),
                index: PathBuf::from("S1.crai"),
                partition,
                total_mapped: n,
                unmapped: 0,
                reference: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_live_merge_filters_contig() {
        let fx = fixture();
        let settings = MergeConfig {
            max_basepairs_in_mem: 3,
            ..MergeConfig::default()
        };
        let engine = engine(&fx, settings);

        let out = engine
            .merge_contig_live(&ScriptedTool, "S1", "chr2", &requests(4))
            .await
            .unwrap();
        let counts = fetch_contig(&fx, &out).await;
        assert_eq!(counts.total(), 4);
        for p in 0..4 {
            assert_eq!(counts.get(p, 1), 1);
        }
    }

    #[tokio::test]
    async fn test_sample_merge_in_table_order() {
        let fx = fixture();
        let engine = engine(&fx, MergeConfig::default());
        let keys: Vec<String> = (0..2).map(|p| fx.layout.partition("S1", p)).collect();
        for key in &keys {
            put(&fx.store, key, "chr2\t3\t0\t1\nchr1\t10\t0\t1\n").await;
        }

        // Contig merges finish in reverse table order
        engine.merge_contig_batch("S1", "chr2", &keys, 2).await.unwrap();
        engine.merge_contig_batch("S1", "chr1", &keys, 2).await.unwrap();
        let out = engine.merge_sample("S1").await.unwrap();
        assert_eq!(out, "samples/S1/S1.wssd");

        fx.storage.remove_local(&out).await.unwrap();
        let path = fx.storage.stage(&out).await.unwrap();
        let artifact = read_sample_artifact(&path, &out).unwrap();
        assert_eq!(artifact.header.contigs, vec!["chr1", "chr2"]);
        assert_eq!(artifact.contig("chr1").unwrap().get(10, 0), 2);
        assert_eq!(artifact.contig("chr2").unwrap().get(3, 0), 2);
    }

    #[tokio::test]
    async fn test_sample_merge_missing_contig() {
        let fx = fixture();
        let engine = engine(&fx, MergeConfig::default());
        let key = fx.layout.partition("S1", 0);
        put(&fx.store, &key, "chr1\t1\t0\t1\n").await;
        engine.merge_contig_batch("S1", "chr1", &[key], 1).await.unwrap();

        let err = engine.merge_sample("S1").await.unwrap_err();
        match err {
            PipelineError::Merge { key, .. } => assert_eq!(key, "contigs/S1/S1.chr2.wssd"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
