//! WSSD pipeline CLI
//!
//! Runs the sharded read-depth pipeline over a cohort of samples.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wssd_pipeline::{
    build_runtime, init_rayon, load_inputs, plan_graph, run_pipeline, Config, FileProgressStore,
    ProgressTracker,
};

#[derive(Parser)]
#[command(name = "wssd-pipeline")]
#[command(about = "Sharded read-depth counting and merging over sample cohorts", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the core budget shared by running tasks
    #[arg(long, global = true)]
    cores: Option<u32>,

    /// Merge contigs straight from the raw input instead of partition artifacts
    #[arg(long, global = true)]
    live_merge: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Print the partition plan and task graph without running anything
    Plan,

    /// Print progress records for every manifest sample
    Status,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli.config, cli.cores, cli.live_merge)?;
            let all_succeeded = run_command(config)?;
            if !all_succeeded {
                std::process::exit(1);
            }
        }

        Some(Commands::Plan) => {
            let config = load_config(&cli.config, cli.cores, cli.live_merge)?;
            plan_command(&config)?;
        }

        Some(Commands::Status) => {
            let config = load_config(&cli.config, cli.cores, cli.live_merge)?;
            status_command(&config)?;
        }

        Some(Commands::Validate) => {
            load_config(&cli.config, cli.cores, cli.live_merge)?;
            println!("Configuration is valid");
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path, cores: Option<u32>, live_merge: bool) -> Result<Config> {
    let mut config = Config::from_file(path)?;

    // Apply overrides
    if let Some(c) = cores {
        config.processing.total_cores = c;
    }
    if live_merge {
        config.merge.live_merge = true;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config: Config) -> Result<bool> {
    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(async { run_pipeline(config).await })?;

    let failed = report.failed_samples();
    if !failed.is_empty() {
        eprintln!("{} sample(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(report.all_succeeded())
}

fn plan_command(config: &Config) -> Result<()> {
    let (manifest, contigs) = load_inputs(config)?;
    let (plan, graph) = plan_graph(config, &manifest, &contigs)?;

    println!("\n=== Partition Plan ===");
    println!("Mapped partitions:   {}", plan.mapped);
    println!("Unmapped partitions: {}", plan.unmapped);
    println!(
        "Merge strategy:      {}",
        if config.merge.live_merge { "live" } else { "batch" }
    );

    println!("\n=== Task Graph ===");
    println!("Samples: {}", manifest.len());
    println!("Contigs: {}", contigs.len());
    for (stage, count) in graph.tasks_by_stage() {
        println!("  {:<20} {}", stage, count);
    }
    println!("Total tasks: {}", graph.len());

    println!("\n=== Resource Budget ===");
    println!(
        "{} cores, {} MB",
        config.processing.total_cores, config.processing.total_memory_mb
    );
    println!("=====================\n");

    Ok(())
}

fn status_command(config: &Config) -> Result<()> {
    let (manifest, _) = load_inputs(config)?;
    let tracker = ProgressTracker::new(std::sync::Arc::new(FileProgressStore::open(
        &config.progress.dir,
    )?));

    println!(
        "{:<16} {:<10} {:>12} {:<8} {:<8} {:<8}  {}",
        "sample", "state", "partitions", "merged", "cleaned", "failed", "host"
    );
    for sample in manifest.samples() {
        let Some(record) = tracker.find(&sample.sn)? else {
            println!("{:<16} {:<10}", sample.sn, "pending");
            continue;
        };
        println!(
            "{:<16} {:<10} {:>5}/{:<6} {:<8} {:<8} {:<8}  {}",
            record.sn,
            record.state(),
            record.partitions_done,
            record.total_partitions,
            record.merge_done,
            record.cleanup_done,
            record.failed,
            record.host.as_deref().unwrap_or("-")
        );
        if let Some(reason) = &record.failure_reason {
            println!("    reason: {}", reason);
        }
    }

    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# WSSD Pipeline Configuration

# === INPUT: Samples and reference ===
input:
  # Tab-separated manifest with header: sn  path  index
  manifest_path: "manifest.tsv"

  # Whitespace-separated "name size" rows, one per contig, in output order
  contig_table_path: "hg38.contigs.txt"

  # Reference identifier
  reference: "hg38"

  # Masked reference handed to the counting tool
  # masked_reference_path: "/ref/hg38.masked.fa"

# === PARTITIONS: How each sample is sharded ===
partitions:
  # Mapped-region partitions per sample
  mapped: 500

  # unmapped = max(mapped / unmapped_divisor, 1)
  unmapped_divisor: 100

  # Explicit unmapped count, overrides the divisor
  # unmapped: 5

# === MERGE ===
merge:
  # Stream counts straight from the raw input instead of writing partition artifacts
  live_merge: false

  # How batch merges find partition artifacts: explicit | prefix
  input_matching: explicit

  # Base pairs per count bin
  bin_size: 1

  # Largest edit distance tracked
  max_edit_distance: 3

  # Records buffered by a live merge before folding them in
  max_basepairs_in_mem: 10000000

  # Partition artifacts fetched concurrently per contig merge
  stage_concurrency: 8

# === STORAGE: Where artifacts live ===
# Choose ONE of: local_path (local disk) OR bucket+prefix (S3)
storage:
  # Option 1: Local filesystem
  local_path: "/tmp/wssd-store"

  # Option 2: S3 (comment out local_path and uncomment these)
  # bucket: "my-bucket"
  # prefix: "wssd/run1"
  # region: "us-east-1"
  # endpoint_url: "http://localhost:4566"

  # Local mirror of staged and published objects
  staging_dir: "/tmp/wssd-staging"

  # Simultaneous transfers across all tasks
  max_concurrent_transfers: 16

  # Retry configuration for transient transfer failures
  retry:
    max_retries: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000

# === PROGRESS: Durable per-sample records ===
progress:
  dir: "/tmp/wssd-progress"

# === PROCESSING: Scheduling and runtime ===
processing:
  # Budget shared by running tasks
  total_cores: 16
  total_memory_mb: 64000

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  # Rayon thread pool size for merge work (null = num CPUs)
  # rayon_threads: 16

  # Delete partition and contig artifacts once the sample artifact exists
  cleanup: true

  # Task-level retries
  retry:
    max_retries: 3
    initial_backoff_ms: 1000
    max_backoff_ms: 60000

  # Print progress metrics during the run
  enable_metrics: true
  metrics_interval_secs: 30
  # metrics_output_path: "metrics.json"

# === RESOURCES: Per task kind (higher priority runs first) ===
resources:
  download:      { cores: 1, memory_mb: 1000, priority: 10 }
  map_and_count: { cores: 2, memory_mb: 4000, priority: 20 }
  merge_contig:  { cores: 1, memory_mb: 4000, priority: 30 }
  merge_sample:  { cores: 1, memory_mb: 8000, priority: 40 }
  cleanup:       { cores: 1, memory_mb: 500, priority: 50 }

# === COUNTER: External counting executable ===
counter:
  program: "wssd-count"
  # Extra arguments placed before the generated ones
  args: []
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["wssd-pipeline"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_overrides() {
        let cli = Cli::try_parse_from(["wssd-pipeline", "run", "--cores", "8", "--live-merge"]).unwrap();
        assert_eq!(cli.cores, Some(8));
        assert!(cli.live_merge);
        assert!(matches!(cli.command, Some(Commands::Run)));
    }

    #[test]
    fn test_cli_parse_plan_and_status() {
        let cli = Cli::try_parse_from(["wssd-pipeline", "plan", "-c", "other.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Plan)));
        assert_eq!(cli.config, PathBuf::from("other.yaml"));

        let cli = Cli::try_parse_from(["wssd-pipeline", "status"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Status)));
    }

    #[test]
    fn test_generated_config_parses() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.partitions.mapped, 500);
        assert_eq!(config.resources.cleanup.priority, 50);
    }
}
