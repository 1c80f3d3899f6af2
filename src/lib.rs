//! WSSD read-depth pipeline
//!
//! Coordinates a sharded read-depth computation over a cohort of sequencing
//! samples: every sample's raw data is split into partitions, each partition
//! is counted by an external tool, and the partial counts are merged into one
//! artifact per contig and finally one artifact per sample.
//!
//! # Architecture
//!
//! - **Inputs**: sample manifest and reference contig table
//! - **I/O**: object store access with a local staging mirror
//! - **Progress**: durable per-sample progress records for resumption
//! - **Merge**: count accumulation, artifact codecs and the merge engine
//! - **Runner**: the external counting tool behind a trait
//! - **Pipeline**: partition planning, the task graph and the scheduler
//!
//! # Usage
//!
//! ```no_run
//! use wssd_pipeline::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(std::path::Path::new("config.yaml"))?;
//!     let report = run_pipeline(config).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod inputs;
pub mod io;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod runner;

pub use config::Config;
pub use error::{PipelineError, Result as PipelineResult};
pub use inputs::{ContigTable, Manifest, Sample};
pub use io::{KeyLayout, Storage};
pub use merge::MergeEngine;
pub use pipeline::{
    build_graph, GraphInputs, MergeStrategy, Metrics, PartitionPlan, RunReport, SampleOutcome,
    Scheduler, SchedulerConfig, TaskExecutor, TaskGraph,
};
pub use progress::{FileProgressStore, ProgressRecord, ProgressTracker};
pub use runner::{CountingTool, ProcessTool};

use anyhow::{Context, Result};
use std::sync::Arc;

/// Load the manifest and contig table named by the configuration.
pub fn load_inputs(config: &Config) -> Result<(Manifest, ContigTable)> {
    let manifest = Manifest::from_path(&config.input.manifest_path).with_context(|| {
        format!(
            "loading manifest {}",
            config.input.manifest_path.display()
        )
    })?;
    let contigs = ContigTable::from_path(&config.input.contig_table_path).with_context(|| {
        format!(
            "loading contig table {}",
            config.input.contig_table_path.display()
        )
    })?;
    tracing::info!(
        "Loaded {} samples and {} contigs",
        manifest.len(),
        contigs.len()
    );
    Ok((manifest, contigs))
}

/// Key layout for the configured store.
pub fn key_layout(config: &Config) -> KeyLayout {
    KeyLayout::new(config.storage.key_prefix(), config.storage.bucket.as_deref())
}

/// Plan partitions and expand the task graph without running anything.
pub fn plan_graph(
    config: &Config,
    manifest: &Manifest,
    contigs: &ContigTable,
) -> Result<(PartitionPlan, TaskGraph)> {
    let plan = PartitionPlan::from_config(&config.partitions)?;
    let layout = key_layout(config);
    let inputs = GraphInputs {
        contigs,
        plan,
        layout: &layout,
        resources: &config.resources,
        strategy: MergeStrategy::select(config.merge.live_merge),
    };
    let graph = build_graph(manifest.samples(), &inputs)?;
    Ok((plan, graph))
}

/// Run the full pipeline with the given configuration.
///
/// Configuration and input errors abort the run. Task failures only fail the
/// owning sample and are reported in the returned [`RunReport`].
pub async fn run_pipeline(config: Config) -> Result<RunReport> {
    config.validate()?;

    tracing::info!("Starting WSSD pipeline");
    tracing::info!("Artifacts in {}", config.storage.path_display());

    let (manifest, contigs) = load_inputs(&config)?;
    let contigs = Arc::new(contigs);
    let (plan, graph) = plan_graph(&config, &manifest, &contigs)?;
    tracing::info!(
        "Partition plan: {} mapped + {} unmapped per sample",
        plan.mapped,
        plan.unmapped
    );
    for (stage, count) in graph.tasks_by_stage() {
        tracing::info!("  {:<20} {}", stage, count);
    }

    let metrics = Metrics::new();

    let store = io::create_object_store(&config.storage)?;
    let storage = Arc::new(
        Storage::new(
            store,
            config.storage.staging_dir.clone(),
            config.storage.retry.clone(),
            config.storage.max_concurrent_transfers,
        )
        .with_metrics(metrics.clone()),
    );

    let progress_store = FileProgressStore::open(&config.progress.dir).with_context(|| {
        format!("opening progress records in {}", config.progress.dir.display())
    })?;
    let progress = ProgressTracker::new(Arc::new(progress_store));
    // Failures from an earlier run must not block this one
    let names: Vec<String> = manifest.samples().iter().map(|s| s.sn.clone()).collect();
    let cleared = progress.clone();
    tokio::task::spawn_blocking(move || names.iter().try_for_each(|sn| cleared.clear_failure(sn)))
        .await??;

    let layout = key_layout(&config);
    let merge = MergeEngine::new(
        storage.clone(),
        layout.clone(),
        contigs.clone(),
        config.merge.clone(),
        metrics.clone(),
    );
    let tool = Arc::new(ProcessTool::from_config(&config.counter));
    let executor = TaskExecutor::new(storage, progress, merge, tool, layout, plan, metrics.clone())
        .with_reference(config.input.masked_reference_path.clone())
        .with_cleanup(config.processing.cleanup);

    let scheduler = Scheduler::new(
        Arc::new(executor),
        Arc::new(graph),
        metrics,
        SchedulerConfig::from_processing(&config.processing),
    );

    tracing::info!("Starting task scheduling...");
    let report = scheduler.run().await;

    tracing::info!("Pipeline complete: {}", report);
    for (sn, outcome) in &report.samples {
        if let SampleOutcome::Failed { task, error } = outcome {
            tracing::error!("Sample {} failed at {}: {}", sn, task, error);
        }
    }

    Ok(report)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
