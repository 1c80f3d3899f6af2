//! Per-task execution against storage, progress, the merge engine and the
//! counting tool.

use super::graph::{MergeStrategy, TaskGraph, TaskId, TaskKind};
use super::metrics::Metrics;
use super::planner::PartitionPlan;
use crate::error::{PipelineError, Result};
use crate::inputs::Sample;
use crate::io::{KeyLayout, Storage};
use crate::merge::MergeEngine;
use crate::progress::ProgressTracker;
use crate::runner::{CountingTool, PartitionRequest};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// What the scheduler needs from whoever runs tasks.
pub trait TaskHandler: Send + Sync + 'static {
    /// Whether the task's effect is already in place.
    fn is_complete(&self, graph: &TaskGraph, id: TaskId) -> impl Future<Output = Result<bool>> + Send;

    /// Run the task once.
    fn execute(&self, graph: &TaskGraph, id: TaskId) -> impl Future<Output = Result<()>> + Send;

    /// Called once when a sample is given up on.
    fn on_sample_failed(&self, sample: &str, error: &PipelineError) -> impl Future<Output = ()> + Send;
}

/// Runs pipeline tasks for real.
pub struct TaskExecutor<T: CountingTool> {
    storage: Arc<Storage>,
    progress: ProgressTracker,
    merge: MergeEngine,
    tool: Arc<T>,
    layout: KeyLayout,
    plan: PartitionPlan,
    metrics: Arc<Metrics>,
    reference: Option<PathBuf>,
    cleanup: bool,
    host: String,
}

impl<T: CountingTool> TaskExecutor<T> {
    pub fn new(
        storage: Arc<Storage>,
        progress: ProgressTracker,
        merge: MergeEngine,
        tool: Arc<T>,
        layout: KeyLayout,
        plan: PartitionPlan,
        metrics: Arc<Metrics>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            storage,
            progress,
            merge,
            tool,
            layout,
            plan,
            metrics,
            reference: None,
            cleanup: true,
            host,
        }
    }

    /// Reference handed to the counting tool.
    pub fn with_reference(mut self, reference: Option<PathBuf>) -> Self {
        self.reference = reference;
        self
    }

    /// Whether cleanup deletes intermediate artifacts.
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Run a progress update on the blocking pool. File-backed stores block
    /// on disk and hold a per-sample lock while they do.
    async fn track<R, F>(&self, sn: &str, update: F) -> Result<R>
    where
        F: FnOnce(&ProgressTracker) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let progress = self.progress.clone();
        tokio::task::spawn_blocking(move || update(&progress))
            .await
            .map_err(|e| PipelineError::progress(sn, format!("progress update aborted: {}", e)))?
    }

    fn input_keys(&self, sample: &Sample) -> (String, String) {
        (
            self.layout.source(&sample.raw_key),
            self.layout.source(&sample.index_key),
        )
    }

    fn request(&self, sample: &Sample, partition: u32) -> PartitionRequest {
        let (raw, index) = self.input_keys(sample);
        PartitionRequest {
            sample: sample.sn.clone(),
            input: self.storage.local_path(&raw),
            index: self.storage.local_path(&index),
            partition,
            total_mapped: self.plan.mapped,
            unmapped: self.plan.unmapped,
            reference: self.reference.clone(),
        }
    }

    async fn download(&self, sample: &Sample) -> Result<()> {
        let start = Instant::now();
        let (raw, index) = self.input_keys(sample);
        futures::try_join!(self.storage.stage(&raw), self.storage.stage(&index))?;
        let (sn, host, total) = (sample.sn.clone(), self.host.clone(), self.plan.total());
        self.track(&sample.sn, move |p| p.record_download(&sn, &host, total))
            .await?;
        self.metrics.add_download_time(start.elapsed());
        tracing::info!("Sample {}: inputs staged on {}", sample.sn, self.host);
        Ok(())
    }

    async fn map_and_count(&self, sample: &Sample, partition: u32, output: &str) -> Result<()> {
        let start = Instant::now();
        let request = self.request(sample, partition);
        let scratch = self.storage.scratch_path(output);

        self.tool.count_partition(&request, &scratch).await?;
        self.storage.publish(&scratch, output).await?;
        self.storage.remove_scratch(output).await?;

        let sn = sample.sn.clone();
        self.track(&sample.sn, move |p| p.record_partition_done(&sn, partition))
            .await?;
        self.metrics.add_partition_counted();
        self.metrics.add_count_time(start.elapsed());
        tracing::debug!("Sample {}: partition {} counted", sample.sn, partition);
        Ok(())
    }

    async fn merge_contig(
        &self,
        graph: &TaskGraph,
        id: TaskId,
        sample: &Sample,
        contig: &str,
        strategy: MergeStrategy,
    ) -> Result<()> {
        match strategy {
            MergeStrategy::Batch => {
                let declared = graph.dependency_outputs(id);
                self.merge
                    .merge_contig_batch(&sample.sn, contig, &declared, self.plan.total())
                    .await?;
                // Every partition artifact was read, so every partition is
                // counted even if its own completion never got recorded
                let (sn, total) = (sample.sn.clone(), self.plan.total());
                self.track(&sample.sn, move |p| p.record_partitions_done(&sn, 0..total))
                    .await?;
            }
            MergeStrategy::Live => {
                let requests: Vec<PartitionRequest> = self
                    .plan
                    .partitions()
                    .map(|p| self.request(sample, p))
                    .collect();
                self.merge
                    .merge_contig_live(self.tool.as_ref(), &sample.sn, contig, &requests)
                    .await?;
            }
        }
        Ok(())
    }

    async fn merge_sample(&self, sample: &Sample) -> Result<()> {
        self.merge.merge_sample(&sample.sn).await?;
        let sn = sample.sn.clone();
        self.track(&sample.sn, move |p| p.record_merge_done(&sn)).await?;
        Ok(())
    }

    async fn cleanup(&self, graph: &TaskGraph, sample: &Sample) -> Result<()> {
        if self.cleanup {
            let sn = &sample.sn;
            let intermediates: Vec<String> = graph
                .tasks()
                .iter()
                .filter(|t| t.key.sample() == sn.as_str())
                .filter(|t| {
                    matches!(t.kind, TaskKind::MapAndCount { .. } | TaskKind::MergeContig { .. })
                })
                .filter_map(|t| t.output.clone())
                .collect();

            for key in &intermediates {
                self.storage.delete(key).await?;
            }
            let (raw, index) = self.input_keys(sample);
            self.storage.remove_local(&raw).await?;
            self.storage.remove_local(&index).await?;
            tracing::info!("Sample {}: removed {} intermediate artifacts", sn, intermediates.len());
        }
        let sn = sample.sn.clone();
        self.track(&sample.sn, move |p| p.record_finished(&sn)).await?;
        Ok(())
    }
}

impl<T: CountingTool> TaskHandler for TaskExecutor<T> {
    async fn is_complete(&self, graph: &TaskGraph, id: TaskId) -> Result<bool> {
        let task = graph.task(id);
        let sn = task.sample.sn.clone();
        match &task.kind {
            TaskKind::Download => {
                let record = self.track(&sn, {
                    let sn = sn.clone();
                    move |p| p.find(&sn)
                })
                .await?;
                let done = record.map_or(false, |r| r.download_done);
                let (raw, index) = self.input_keys(&task.sample);
                Ok(done && self.storage.is_staged(&raw).await && self.storage.is_staged(&index).await)
            }
            TaskKind::Cleanup => {
                let record = self.track(&sn, {
                    let sn = sn.clone();
                    move |p| p.find(&sn)
                })
                .await?;
                Ok(record.map_or(false, |r| r.cleanup_done))
            }
            TaskKind::MapAndCount { partition } => {
                let Some(key) = &task.output else {
                    return Ok(false);
                };
                if !self.storage.exists(key).await? {
                    return Ok(false);
                }
                // A published artifact counts as done whether or not its
                // completion was recorded
                let partition = *partition;
                self.track(&sn, {
                    let sn = sn.clone();
                    move |p| p.record_partition_done(&sn, partition)
                })
                .await?;
                Ok(true)
            }
            _ => match &task.output {
                Some(key) => self.storage.exists(key).await,
                None => Ok(false),
            },
        }
    }

    async fn execute(&self, graph: &TaskGraph, id: TaskId) -> Result<()> {
        let task = graph.task(id);
        let sample = task.sample.as_ref();
        match &task.kind {
            TaskKind::Download => self.download(sample).await,
            TaskKind::MapAndCount { partition } => {
                let output = task
                    .output
                    .as_deref()
                    .ok_or_else(|| PipelineError::graph(format!("{} has no output key", task.key)))?;
                self.map_and_count(sample, *partition, output).await
            }
            TaskKind::MergeContig { contig, strategy } => {
                self.merge_contig(graph, id, sample, contig, *strategy).await
            }
            TaskKind::MergeSample => self.merge_sample(sample).await,
            TaskKind::Cleanup => self.cleanup(graph, sample).await,
        }
    }

    async fn on_sample_failed(&self, sample: &str, error: &PipelineError) {
        let (sn, reason) = (sample.to_string(), error.to_string());
        if let Err(e) = self.track(sample, move |p| p.record_failed(&sn, &reason)).await {
            tracing::error!("Sample {}: cannot record failure: {}", sample, e);
        }
    }
}
