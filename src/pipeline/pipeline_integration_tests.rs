//! End-to-end runs of the scheduler against the real executor, merge engine,
//! storage adapter and progress tracker, with a scripted counting tool.

use super::*;
use crate::config::{MergeConfig, ResourceConfig, RetryConfig};
use crate::error::{PipelineError, Result};
use crate::inputs::{ContigTable, Sample};
use crate::io::{KeyLayout, Storage};
use crate::merge::{read_sample_artifact, HitRecord, MergeEngine, SampleArtifact};
use crate::progress::{FileProgressStore, MemoryProgressStore, ProgressStore, ProgressTracker};
use crate::runner::{CountingTool, HitStream, PartitionRequest};
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Every mapped partition sees one read at chr1:10 with no edits; the unmapped
/// partition only reports unplaced reads.
#[derive(Default)]
struct FakeCounter {
    counted: AtomicUsize,
    streamed: AtomicUsize,
}

impl FakeCounter {
    fn hit(request: &PartitionRequest) -> HitRecord {
        if request.partition < request.total_mapped {
            HitRecord {
                contig: "chr1".to_string(),
                position: 10,
                edit_distance: 0,
            }
        } else {
            HitRecord {
                contig: "*".to_string(),
                position: 0,
                edit_distance: 0,
            }
        }
    }
}

impl CountingTool for FakeCounter {
    async fn count_partition(&self, request: &PartitionRequest, output: &Path) -> Result<()> {
        assert!(request.input.exists(), "raw input not staged");
        self.counted.fetch_add(1, Ordering::SeqCst);
        let hit = Self::hit(request);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = format!(
            "# partition {}\n{}\t{}\t{}\t1\n",
            request.partition, hit.contig, hit.position, hit.edit_distance
        );
        tokio::fs::write(output, body).await?;
        Ok(())
    }

    async fn stream_hits(&self, request: &PartitionRequest) -> Result<HitStream> {
        self.streamed.fetch_add(1, Ordering::SeqCst);
        let hits: Vec<Result<HitRecord>> = vec![Ok(Self::hit(request))];
        Ok(futures::stream::iter(hits).boxed())
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<dyn ObjectStore>,
    storage: Arc<Storage>,
    progress: ProgressTracker,
    layout: KeyLayout,
    contigs: Arc<ContigTable>,
    tool: Arc<FakeCounter>,
    mapped: u32,
    cores: u32,
}

impl Harness {
    async fn new(samples: &[&str]) -> Self {
        Self::with_progress(samples, Arc::new(MemoryProgressStore::new())).await
    }

    async fn with_progress(samples: &[&str], progress: Arc<dyn ProgressStore>) -> Self {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        for sn in samples {
            put(&store, &format!("raw/{}.cram", sn), "reads").await;
            put(&store, &format!("raw/{}.crai", sn), "index").await;
        }
        let retry = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let storage = Arc::new(Storage::new(store.clone(), dir.path().join("staging"), retry, 4));
        Self {
            _dir: dir,
            store,
            storage,
            progress: ProgressTracker::new(progress),
            layout: KeyLayout::new(None, None),
            contigs: Arc::new(ContigTable::parse("chr1 100\nchr2 50\n").unwrap()),
            tool: Arc::new(FakeCounter::default()),
            mapped: 4,
            cores: 4,
        }
    }

    fn executor(&self, samples: &[Sample], live_merge: bool) -> (TaskExecutor<FakeCounter>, TaskGraph, Arc<Metrics>) {
        let metrics = Metrics::new();
        let plan = plan(self.mapped, 100, None).unwrap();
        let resources = ResourceConfig::default();
        let inputs = GraphInputs {
            contigs: &self.contigs,
            plan,
            layout: &self.layout,
            resources: &resources,
            strategy: MergeStrategy::select(live_merge),
        };
        let graph = build_graph(samples, &inputs).unwrap();

        let merge = MergeEngine::new(
            self.storage.clone(),
            self.layout.clone(),
            self.contigs.clone(),
            MergeConfig {
                live_merge,
                bin_size: 1,
                ..MergeConfig::default()
            },
            metrics.clone(),
        );
        let executor = TaskExecutor::new(
            self.storage.clone(),
            self.progress.clone(),
            merge,
            self.tool.clone(),
            self.layout.clone(),
            plan,
            metrics.clone(),
        );
        (executor, graph, metrics)
    }

    async fn schedule<H: TaskHandler>(&self, handler: Arc<H>, graph: TaskGraph, metrics: Arc<Metrics>) -> RunReport {
        let config = SchedulerConfig {
            total_cores: self.cores,
            total_memory_mb: 1 << 20,
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            enable_metrics: false,
            metrics_interval_secs: 1,
            metrics_output_path: None,
        };
        Scheduler::new(handler, Arc::new(graph), metrics, config)
            .run()
            .await
    }

    async fn run(&self, samples: &[Sample], live_merge: bool) -> RunReport {
        let (executor, graph, metrics) = self.executor(samples, live_merge);
        self.schedule(Arc::new(executor), graph, metrics).await
    }

    async fn sample_artifact(&self, sn: &str) -> SampleArtifact {
        let key = self.layout.sample(sn);
        self.storage.remove_local(&key).await.unwrap();
        let path = self.storage.stage(&key).await.unwrap();
        read_sample_artifact(&path, &key).unwrap()
    }
}

async fn put(store: &Arc<dyn ObjectStore>, key: &str, body: &str) {
    store
        .put(&ObjectPath::from(key), PutPayload::from(body.as_bytes().to_vec()))
        .await
        .unwrap();
}

fn sample(sn: &str) -> Sample {
    Sample {
        sn: sn.to_string(),
        raw_key: format!("raw/{}.cram", sn),
        index_key: format!("raw/{}.crai", sn),
    }
}

/// Fails the first `failures` download attempts with a transfer error before
/// handing every task to the real executor, and logs task starts and finishes.
struct FlakyDownloads<H> {
    inner: H,
    failures: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl<H: TaskHandler> FlakyDownloads<H> {
    fn new(inner: H, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            events: Mutex::new(Vec::new()),
        }
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }
}

impl<H: TaskHandler> TaskHandler for FlakyDownloads<H> {
    async fn is_complete(&self, graph: &TaskGraph, id: TaskId) -> Result<bool> {
        self.inner.is_complete(graph, id).await
    }

    async fn execute(&self, graph: &TaskGraph, id: TaskId) -> Result<()> {
        let task = graph.task(id);
        self.events.lock().push(format!("start {}", task.key));
        if matches!(task.kind, TaskKind::Download)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(PipelineError::Transfer {
                key: task.sample.raw_key.clone(),
                attempts: 1,
                reason: "connection reset by peer".to_string(),
            });
        }
        self.inner.execute(graph, id).await?;
        self.events.lock().push(format!("done {}", task.key));
        Ok(())
    }

    async fn on_sample_failed(&self, sample: &str, error: &PipelineError) {
        self.inner.on_sample_failed(sample, error).await
    }
}

fn assert_expected_counts(artifact: &SampleArtifact) {
    assert_eq!(artifact.header.contigs, vec!["chr1", "chr2"]);
    let chr1 = artifact.contig("chr1").unwrap();
    assert_eq!(chr1.get(10, 0), 4);
    assert_eq!(chr1.total(), 4);
    assert_eq!(artifact.contig("chr2").unwrap().total(), 0);
}

#[tokio::test]
async fn test_batch_run_end_to_end() {
    let h = Harness::new(&["S1"]).await;
    let report = h.run(&[sample("S1")], false).await;

    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(report.samples["S1"], SampleOutcome::Succeeded);
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), 5);
    assert_eq!(h.tool.streamed.load(Ordering::SeqCst), 0);

    assert_expected_counts(&h.sample_artifact("S1").await);

    let record = h.progress.get("S1").unwrap();
    assert_eq!(record.total_partitions, 5);
    assert_eq!(record.partitions_done, 5);
    assert!(record.download_done);
    assert!(record.partitions_complete);
    assert!(record.merge_done);
    assert!(record.cleanup_done);
    assert!(!record.failed);
    assert!(record.host.is_some());

    // Intermediates are gone, the sample artifact stays
    for p in 0..5 {
        assert!(!h.storage.exists(&h.layout.partition("S1", p)).await.unwrap());
    }
    assert!(!h.storage.exists(&h.layout.contig("S1", "chr1")).await.unwrap());
    assert!(h.storage.exists(&h.layout.sample("S1")).await.unwrap());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = Harness::new(&["S1"]).await;
    assert!(h.run(&[sample("S1")], false).await.all_succeeded());
    let counted = h.tool.counted.load(Ordering::SeqCst);

    let report = h.run(&[sample("S1")], false).await;
    assert_eq!(report.samples["S1"], SampleOutcome::AlreadyComplete);
    assert_eq!(report.tasks_succeeded, 0);
    assert_eq!(report.tasks_skipped, report.total_tasks);
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), counted);
    assert_expected_counts(&h.sample_artifact("S1").await);
}

#[tokio::test]
async fn test_resume_after_lost_contig_artifact() {
    let h = Harness::new(&["S1"]).await;
    assert!(h.run(&[sample("S1")], false).await.all_succeeded());

    // Sample artifact lost after cleanup: everything feeding it is redone
    h.storage.delete(&h.layout.sample("S1")).await.unwrap();
    h.progress
        .upsert(
            "S1",
            &[(
                crate::progress::ProgressField::CleanupDone,
                crate::progress::FieldUpdate::flag(false),
            )],
        )
        .unwrap();

    let report = h.run(&[sample("S1")], false).await;
    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), 10);
    assert_expected_counts(&h.sample_artifact("S1").await);

    // Partition counter never exceeds the plan
    assert_eq!(h.progress.get("S1").unwrap().partitions_done, 5);
}

#[tokio::test]
async fn test_live_run_matches_batch() {
    let h = Harness::new(&["S1"]).await;
    let report = h.run(&[sample("S1")], true).await;

    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), 0);
    // One pass over every partition per contig
    assert_eq!(h.tool.streamed.load(Ordering::SeqCst), 10);
    assert_expected_counts(&h.sample_artifact("S1").await);

    for p in 0..5 {
        assert!(!h.storage.exists(&h.layout.partition("S1", p)).await.unwrap());
    }
    let record = h.progress.get("S1").unwrap();
    assert_eq!(record.partitions_done, 0);
    assert!(record.merge_done);
}

#[tokio::test]
async fn test_missing_input_fails_only_that_sample() {
    let h = Harness::new(&["S1"]).await;
    let report = h.run(&[sample("S1"), sample("S2")], false).await;

    assert_eq!(report.failed_samples(), vec!["S2"]);
    match &report.samples["S2"] {
        SampleOutcome::Failed { task, .. } => assert_eq!(task, "download(S2)"),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.samples["S1"], SampleOutcome::Succeeded);

    let record = h.progress.get("S2").unwrap();
    assert!(record.failed);
    assert!(record.failure_reason.is_some());
    assert!(!h.storage.exists(&h.layout.sample("S2")).await.unwrap());
    assert_expected_counts(&h.sample_artifact("S1").await);

    // Supplying the input lets a rerun finish the failed sample
    put(&h.store, "raw/S2.cram", "reads").await;
    put(&h.store, "raw/S2.crai", "index").await;
    h.progress.clear_failure("S2").unwrap();
    let report = h.run(&[sample("S1"), sample("S2")], false).await;
    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(report.samples["S1"], SampleOutcome::AlreadyComplete);
    assert!(!h.progress.get("S2").unwrap().failed);
}

#[tokio::test]
async fn test_multiple_samples_share_budget() {
    let names = ["S1", "S2", "S3"];
    let h = Harness::new(&names).await;
    let samples: Vec<Sample> = names.iter().map(|s| sample(s)).collect();
    let report = h.run(&samples, false).await;

    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(report.samples.keys().collect::<Vec<_>>(), vec!["S1", "S2", "S3"]);
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), 15);
    for sn in names {
        assert_expected_counts(&h.sample_artifact(sn).await);
    }
}

#[tokio::test]
async fn test_download_retried_before_any_partition_runs() {
    let h = Harness::new(&["S1"]).await;
    let (executor, graph, metrics) = h.executor(&[sample("S1")], false);
    let flaky = Arc::new(FlakyDownloads::new(executor, 2));

    let report = h.schedule(flaky.clone(), graph, metrics.clone()).await;

    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(metrics.snapshot().task_retries, 2);

    let events = flaky.events.lock().clone();
    let downloads = events.iter().filter(|e| e.as_str() == "start download(S1)").count();
    assert_eq!(downloads, 3);
    let downloaded = flaky.position("done download(S1)").unwrap();
    for (i, event) in events.iter().enumerate() {
        if event.starts_with("start mapAndCount") {
            assert!(i > downloaded, "{} started before the download finished", event);
        }
    }
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), 5);

    let record = h.progress.get("S1").unwrap();
    assert!(record.download_done);
    assert!(record.host.is_some());
    assert_eq!(record.total_partitions, 5);
    assert_eq!(record.partitions_done, 5);
    assert!(record.partitions_complete);
    assert!(record.cleanup_done);
    assert!(!record.failed);
    assert_expected_counts(&h.sample_artifact("S1").await);
}

#[tokio::test]
async fn test_partition_published_without_record_still_counts() {
    let h = Harness::new(&["S1"]).await;
    // Artifact from an earlier run that stopped before recording the partition
    put(&h.store, &h.layout.partition("S1", 2), "# partition 2\nchr1\t10\t0\t1\n").await;

    let report = h.run(&[sample("S1")], false).await;
    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), 4);

    let record = h.progress.get("S1").unwrap();
    assert_eq!(record.partitions_done, 5);
    assert!(record.partitions_complete);
    assert!(record.cleanup_done);
    assert_expected_counts(&h.sample_artifact("S1").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_on_file_records() {
    let records = TempDir::new().unwrap();
    let store: Arc<dyn ProgressStore> = Arc::new(FileProgressStore::open(records.path()).unwrap());
    let mut h = Harness::with_progress(&["S1", "S2"], store).await;
    h.mapped = 24;
    h.cores = 64;

    let report = h.run(&[sample("S1"), sample("S2")], false).await;
    assert!(report.all_succeeded(), "{}", report);
    assert_eq!(h.tool.counted.load(Ordering::SeqCst), 50);

    // Read back through a fresh store to see what reached disk
    let reopened = FileProgressStore::open(records.path()).unwrap();
    for sn in ["S1", "S2"] {
        let record = reopened.get(sn).unwrap().unwrap();
        assert_eq!(record.total_partitions, 25);
        assert_eq!(record.partitions_done, 25);
        assert!(record.partitions_complete);
        assert!(record.cleanup_done);

        let artifact = h.sample_artifact(sn).await;
        assert_eq!(artifact.contig("chr1").unwrap().get(10, 0), 24);
    }
}
