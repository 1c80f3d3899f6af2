//! Run progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tasks that ran to success
    pub tasks_succeeded: AtomicU64,

    /// Tasks whose output already existed
    pub tasks_skipped: AtomicU64,

    /// Tasks that failed terminally
    pub tasks_failed: AtomicU64,

    /// Attempts beyond the first
    pub task_retries: AtomicU64,

    /// Samples marked failed
    pub samples_failed: AtomicU64,

    /// Partition artifacts produced by the counting tool
    pub partitions_counted: AtomicU64,

    /// Hit records consumed by live merges
    pub hits_streamed: AtomicU64,

    /// Records outside the contig or edit-distance range
    pub hits_dropped: AtomicU64,

    /// Bytes downloaded into the staging area
    pub bytes_staged: AtomicU64,

    /// Bytes uploaded to the store
    pub bytes_published: AtomicU64,

    /// Transfers that exhausted their retries
    pub transfer_failures: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    /// Time spent downloading inputs (microseconds)
    pub download_us: AtomicU64,

    /// Time spent in the counting tool (microseconds)
    pub count_us: AtomicU64,

    /// Time spent merging contigs (microseconds)
    pub merge_contig_us: AtomicU64,

    /// Time spent merging samples (microseconds)
    pub merge_sample_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_task_succeeded(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_retry(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sample_failed(&self) {
        self.samples_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_partition_counted(&self) {
        self.partitions_counted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record hit records consumed and dropped by a live merge.
    pub fn add_hits(&self, streamed: u64, dropped: u64) {
        self.hits_streamed.fetch_add(streamed, Ordering::Relaxed);
        self.hits_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Record records dropped while parsing partition artifacts.
    pub fn add_hits_dropped(&self, dropped: u64) {
        self.hits_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn add_bytes_staged(&self, bytes: u64) {
        self.bytes_staged.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_published(&self, bytes: u64) {
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_transfer_failure(&self) {
        self.transfer_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent downloading inputs.
    pub fn add_download_time(&self, duration: Duration) {
        self.download_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent in the counting tool.
    pub fn add_count_time(&self, duration: Duration) {
        self.count_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent merging one contig.
    pub fn add_merge_contig_time(&self, duration: Duration) {
        self.merge_contig_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent merging one sample.
    pub fn add_merge_sample_time(&self, duration: Duration) {
        self.merge_sample_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Finished tasks (run or skipped) per second.
    pub fn tasks_per_second(&self) -> f64 {
        let done = self.tasks_succeeded.load(Ordering::Relaxed)
            + self.tasks_skipped.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |v: &AtomicU64| v.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_skipped: self.tasks_skipped.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            task_retries: self.task_retries.load(Ordering::Relaxed),
            samples_failed: self.samples_failed.load(Ordering::Relaxed),
            partitions_counted: self.partitions_counted.load(Ordering::Relaxed),
            hits_streamed: self.hits_streamed.load(Ordering::Relaxed),
            hits_dropped: self.hits_dropped.load(Ordering::Relaxed),
            bytes_staged: self.bytes_staged.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            transfer_failures: self.transfer_failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            tasks_per_second: self.tasks_per_second(),
            download_secs: secs(&self.download_us),
            count_secs: secs(&self.count_us),
            merge_contig_secs: secs(&self.merge_contig_us),
            merge_sample_secs: secs(&self.merge_sample_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_succeeded: u64,
    pub tasks_skipped: u64,
    pub tasks_failed: u64,
    pub task_retries: u64,
    pub samples_failed: u64,
    pub partitions_counted: u64,
    pub hits_streamed: u64,
    pub hits_dropped: u64,
    pub bytes_staged: u64,
    pub bytes_published: u64,
    pub transfer_failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub tasks_per_second: f64,
    /// Total time spent downloading (seconds, summed across tasks)
    pub download_secs: f64,
    /// Total time spent counting (seconds, summed across tasks)
    pub count_secs: f64,
    /// Total time spent in contig merges (seconds, summed across tasks)
    pub merge_contig_secs: f64,
    /// Total time spent in sample merges (seconds, summed across tasks)
    pub merge_sample_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    fn stage_total_secs(&self) -> f64 {
        self.download_secs + self.count_secs + self.merge_contig_secs + self.merge_sample_secs
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.stage_total_secs();
        let pct = |v: f64| if total > 0.0 { v / total * 100.0 } else { 0.0 };

        write!(
            f,
            "Tasks: {} done, {} skipped, {} failed, {} retried | Partitions: {} | \
             Staged: {:.2} GB | Published: {:.2} GB | Rate: {:.1} tasks/s | \
             Failed samples: {} | Elapsed: {:.1}s | \
             Time: Download {:.0}% | Count {:.0}% | Contig merge {:.0}% | Sample merge {:.0}%",
            self.tasks_succeeded,
            self.tasks_skipped,
            self.tasks_failed,
            self.task_retries,
            self.partitions_counted,
            self.bytes_staged as f64 / GB,
            self.bytes_published as f64 / GB,
            self.tasks_per_second,
            self.samples_failed,
            self.elapsed.as_secs_f64(),
            pct(self.download_secs),
            pct(self.count_secs),
            pct(self.merge_contig_secs),
            pct(self.merge_sample_secs),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_tasks: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_tasks: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_tasks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let done = snapshot.tasks_succeeded + snapshot.tasks_skipped + snapshot.tasks_failed;
                    let progress = if self.total_tasks > 0 {
                        done as f64 / self.total_tasks as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Tasks succeeded: {}", snapshot.tasks_succeeded);
        println!("Tasks skipped: {}", snapshot.tasks_skipped);
        println!("Tasks failed: {}", snapshot.tasks_failed);
        println!("Retries: {}", snapshot.task_retries);
        println!("Partitions counted: {}", snapshot.partitions_counted);
        if snapshot.hits_streamed > 0 {
            println!(
                "Live hits: {} streamed, {} dropped",
                snapshot.hits_streamed, snapshot.hits_dropped
            );
        }
        println!("Data staged: {:.2} GB", snapshot.bytes_staged as f64 / GB);
        println!("Data published: {:.2} GB", snapshot.bytes_published as f64 / GB);
        println!("Failed samples: {}", snapshot.samples_failed);

        let total = snapshot.stage_total_secs();
        if total > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            println!("Download:      {:>7.1}s ({:>5.1}%)", snapshot.download_secs, snapshot.download_secs / total * 100.0);
            println!("Count:         {:>7.1}s ({:>5.1}%)", snapshot.count_secs, snapshot.count_secs / total * 100.0);
            println!("Contig merge:  {:>7.1}s ({:>5.1}%)", snapshot.merge_contig_secs, snapshot.merge_contig_secs / total * 100.0);
            println!("Sample merge:  {:>7.1}s ({:>5.1}%)", snapshot.merge_sample_secs, snapshot.merge_sample_secs / total * 100.0);
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_bytes_staged(1000);
        metrics.add_bytes_staged(500);

        assert_eq!(metrics.bytes_staged.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_task_succeeded();
        metrics.add_task_succeeded();
        metrics.add_task_skipped();
        metrics.add_task_retry();
        metrics.add_hits(10, 2);
        metrics.add_hits_dropped(1);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.tasks_succeeded, 2);
        assert_eq!(snapshot.tasks_skipped, 1);
        assert_eq!(snapshot.task_retries, 1);
        assert_eq!(snapshot.hits_streamed, 10);
        assert_eq!(snapshot.hits_dropped, 3);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_download_time(Duration::from_millis(100));
        metrics.add_count_time(Duration::from_millis(50));
        metrics.add_merge_contig_time(Duration::from_millis(25));
        metrics.add_merge_sample_time(Duration::from_millis(75));

        let snapshot = metrics.snapshot();

        assert!((snapshot.download_secs - 0.1).abs() < 0.001);
        assert!((snapshot.count_secs - 0.05).abs() < 0.001);
        assert!((snapshot.merge_contig_secs - 0.025).abs() < 0.001);
        assert!((snapshot.merge_sample_secs - 0.075).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.add_task_succeeded();
        }
        metrics.add_task_failed();
        metrics.add_sample_failed();
        metrics.add_download_time(Duration::from_secs(1));
        metrics.add_count_time(Duration::from_secs(3));

        let display = format!("{}", metrics.snapshot());

        assert!(display.contains("100 done"));
        assert!(display.contains("1 failed"));
        assert!(display.contains("Failed samples: 1"));
        assert!(display.contains("Download 25%"));
        assert!(display.contains("Count 75%"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.add_partition_counted();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["partitions_counted"], 1);
        assert!(json["elapsed"].is_f64());
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_task_succeeded();
        assert_eq!(metrics.tasks_per_second(), 0.0);
    }

    #[test]
    fn test_metrics_reporter_new() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 0, 1000);

        assert_eq!(reporter.interval_secs, 1);
        assert_eq!(reporter.total_tasks, 1000);
    }
}
