//! Configuration for the read-depth pipeline.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input configuration
    pub input: InputConfig,

    /// Partitioning configuration
    #[serde(default)]
    pub partitions: PartitionConfig,

    /// Merge configuration
    #[serde(default)]
    pub merge: MergeConfig,

    /// Remote object store and local staging configuration
    pub storage: StorageConfig,

    /// Progress record configuration
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Per-task-kind resource requirements and priorities
    #[serde(default)]
    pub resources: ResourceConfig,

    /// External counting tool
    pub counter: CounterConfig,
}

/// Input data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Tab-separated manifest mapping sample -> raw data key -> index key
    pub manifest_path: PathBuf,

    /// Whitespace-separated `name size` table defining contig order
    pub contig_table_path: PathBuf,

    /// Reference identifier (e.g. "hg38")
    #[serde(default)]
    pub reference: Option<String>,

    /// Masked reference handed to the counting tool
    #[serde(default)]
    pub masked_reference_path: Option<PathBuf>,
}

/// Partition planning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Number of mapped-region partitions per sample
    #[serde(default = "default_mapped_partitions")]
    pub mapped: u32,

    /// Explicit unmapped-partition count (overrides the divisor)
    #[serde(default)]
    pub unmapped: Option<u32>,

    /// Divisor K: unmapped = max(mapped / K, 1)
    #[serde(default = "default_unmapped_divisor")]
    pub unmapped_divisor: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            mapped: default_mapped_partitions(),
            unmapped: None,
            unmapped_divisor: default_unmapped_divisor(),
        }
    }
}

/// How batch merges discover their partition artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputMatching {
    /// Use the partition keys the graph declared as dependencies
    #[default]
    Explicit,
    /// List the sample's partition prefix in the object store
    Prefix,
}

/// Merge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Merge contigs straight from the raw input instead of partition artifacts
    #[serde(default)]
    pub live_merge: bool,

    /// How partition artifacts are located for batch merges
    #[serde(default)]
    pub input_matching: InputMatching,

    /// Base pairs per count bin
    #[serde(default = "default_bin_size")]
    pub bin_size: u64,

    /// Largest edit distance tracked; higher ones are dropped
    #[serde(default = "default_max_edit_distance")]
    pub max_edit_distance: u16,

    /// Buffered hit records before a live merge folds them into the matrix
    #[serde(default = "default_max_basepairs_in_mem")]
    pub max_basepairs_in_mem: usize,

    /// Partition artifacts fetched concurrently per contig merge
    #[serde(default = "default_stage_concurrency")]
    pub stage_concurrency: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            live_merge: false,
            input_matching: InputMatching::Explicit,
            bin_size: default_bin_size(),
            max_edit_distance: default_max_edit_distance(),
            max_basepairs_in_mem: default_max_basepairs_in_mem(),
            stage_concurrency: default_stage_concurrency(),
        }
    }
}

/// Object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local filesystem root standing in for the remote store.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket holding pipeline artifacts
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix within the bucket
    #[serde(default)]
    pub prefix: Option<String>,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint (MinIO, LocalStack, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Local staging area mirroring remote keys
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Simultaneous transfers allowed across all tasks
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// Retry configuration for transient transfer failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl StorageConfig {
    /// Check if artifacts live on the local filesystem.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Key prefix applied to pipeline-generated artifacts.
    pub fn key_prefix(&self) -> Option<&str> {
        if self.is_local() {
            None
        } else {
            self.prefix.as_deref().filter(|p| !p.is_empty())
        }
    }

    /// Get the store location as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }
}

/// Progress record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Directory holding one JSON record per sample
    #[serde(default = "default_progress_dir")]
    pub dir: PathBuf,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            dir: default_progress_dir(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// CPU cores available to tasks
    #[serde(default = "default_total_cores")]
    pub total_cores: u32,

    /// Memory available to tasks in MB
    #[serde(default = "default_total_memory_mb")]
    pub total_memory_mb: u64,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for merge work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Delete intermediate artifacts once the sample artifact exists
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Task-level retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Enable periodic metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            total_cores: default_total_cores(),
            total_memory_mb: default_total_memory_mb(),
            worker_threads: None,
            rayon_threads: None,
            cleanup: true,
            retry: RetryConfig::default(),
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts (including the first)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(20) as u32;
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Resource requirement and priority for one task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResources {
    /// CPU cores reserved while the task runs
    pub cores: u32,

    /// Memory reserved while the task runs, in MB
    pub memory_mb: u64,

    /// Higher runs first among ready tasks
    #[serde(default)]
    pub priority: i32,
}

/// Per-task-kind resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_download_resources")]
    pub download: TaskResources,

    #[serde(default = "default_count_resources")]
    pub map_and_count: TaskResources,

    #[serde(default = "default_merge_contig_resources")]
    pub merge_contig: TaskResources,

    #[serde(default = "default_merge_sample_resources")]
    pub merge_sample: TaskResources,

    #[serde(default = "default_cleanup_resources")]
    pub cleanup: TaskResources,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            download: default_download_resources(),
            map_and_count: default_count_resources(),
            merge_contig: default_merge_contig_resources(),
            merge_sample: default_merge_sample_resources(),
            cleanup: default_cleanup_resources(),
        }
    }
}

impl ResourceConfig {
    fn iter(&self) -> impl Iterator<Item = (&'static str, &TaskResources)> {
        [
            ("download", &self.download),
            ("map_and_count", &self.map_and_count),
            ("merge_contig", &self.merge_contig),
            ("merge_sample", &self.merge_sample),
            ("cleanup", &self.cleanup),
        ]
        .into_iter()
    }
}

/// External counting tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Executable to invoke
    pub program: String,

    /// Extra arguments placed before the generated ones
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "json" => Self::from_json(&contents),
            // YAML is a superset of JSON
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PipelineError::config(e.to_string()))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PipelineError::config(e.to_string()))
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        match (&self.storage.local_path, &self.storage.bucket) {
            (Some(_), Some(_)) => {
                return Err(PipelineError::config(
                    "Cannot specify both storage.local_path and storage.bucket",
                ));
            }
            (None, None) => {
                return Err(PipelineError::config(
                    "Must specify either storage.local_path or storage.bucket",
                ));
            }
            _ => {}
        }

        if self.partitions.mapped < 1 {
            return Err(PipelineError::config("partitions.mapped must be >= 1"));
        }
        if self.partitions.unmapped_divisor < 1 {
            return Err(PipelineError::config("partitions.unmapped_divisor must be >= 1"));
        }
        if self.merge.bin_size == 0 {
            return Err(PipelineError::config("merge.bin_size must be > 0"));
        }
        if self.merge.stage_concurrency == 0 {
            return Err(PipelineError::config("merge.stage_concurrency must be > 0"));
        }
        if self.merge.max_basepairs_in_mem == 0 {
            return Err(PipelineError::config("merge.max_basepairs_in_mem must be > 0"));
        }
        if self.storage.max_concurrent_transfers == 0 {
            return Err(PipelineError::config("storage.max_concurrent_transfers must be > 0"));
        }
        if self.processing.total_cores == 0 || self.processing.total_memory_mb == 0 {
            return Err(PipelineError::config(
                "processing.total_cores and processing.total_memory_mb must be > 0",
            ));
        }
        for (name, res) in self.resources.iter() {
            if res.cores == 0 {
                return Err(PipelineError::config(format!(
                    "resources.{}.cores must be > 0",
                    name
                )));
            }
        }
        if self.counter.program.trim().is_empty() {
            return Err(PipelineError::config("counter.program must not be empty"));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_mapped_partitions() -> u32 { 500 }
fn default_unmapped_divisor() -> u32 { 100 }
fn default_bin_size() -> u64 { 1 }
fn default_max_edit_distance() -> u16 { 3 }
fn default_max_basepairs_in_mem() -> usize { 10_000_000 }
fn default_stage_concurrency() -> usize { 8 }
fn default_region() -> String { "us-east-1".to_string() }
fn default_staging_dir() -> PathBuf { PathBuf::from("/tmp/wssd-staging") }
fn default_max_concurrent_transfers() -> usize { 16 }
fn default_progress_dir() -> PathBuf { PathBuf::from("progress") }
fn default_total_cores() -> u32 { 8 }
fn default_total_memory_mb() -> u64 { 32_000 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 30 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }
fn default_download_resources() -> TaskResources { TaskResources { cores: 1, memory_mb: 1_000, priority: 10 } }
fn default_count_resources() -> TaskResources { TaskResources { cores: 2, memory_mb: 4_000, priority: 20 } }
fn default_merge_contig_resources() -> TaskResources { TaskResources { cores: 1, memory_mb: 4_000, priority: 30 } }
fn default_merge_sample_resources() -> TaskResources { TaskResources { cores: 1, memory_mb: 8_000, priority: 40 } }
fn default_cleanup_resources() -> TaskResources { TaskResources { cores: 1, memory_mb: 500, priority: 50 } }

#[cfg(test)]
pub(crate) fn test_config(local_path: &str, staging: &Path, progress: &Path) -> Config {
    Config {
        input: InputConfig {
            manifest_path: PathBuf::from("manifest.tsv"),
            contig_table_path: PathBuf::from("contigs.txt"),
            reference: Some("test".to_string()),
            masked_reference_path: None,
        },
        partitions: PartitionConfig {
            mapped: 4,
            unmapped: None,
            unmapped_divisor: 100,
        },
        merge: MergeConfig::default(),
        storage: StorageConfig {
            local_path: Some(local_path.to_string()),
            bucket: None,
            prefix: None,
            region: default_region(),
            endpoint_url: None,
            staging_dir: staging.to_path_buf(),
            max_concurrent_transfers: 4,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
        },
        progress: ProgressConfig {
            dir: progress.to_path_buf(),
        },
        processing: ProcessingConfig {
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            enable_metrics: false,
            ..ProcessingConfig::default()
        },
        resources: ResourceConfig::default(),
        counter: CounterConfig {
            program: "wssd-count".to_string(),
            args: Vec::new(),
        },
    }
}
