//! Dependency-aware task scheduling under a resource budget.
//!
//! Each task moves `Pending -> Ready -> Running -> {Succeeded, Failed}`.
//! Ready tasks are admitted strictly by priority (ties by declaration order)
//! when the free cores and memory cover their requirement. A task that asks
//! for more than the whole budget is admitted alone once nothing else runs.
//!
//! Before scheduling, a pruning pass walks the graph from its sinks and skips
//! every task whose output already exists or that no unfinished task needs,
//! so a restarted run only redoes missing work.

use super::executor::TaskHandler;
use super::graph::{TaskGraph, TaskId, TaskKey};
use super::metrics::{Metrics, MetricsReporter};
use crate::config::{ProcessingConfig, RetryConfig, TaskResources};
use crate::error::PipelineError;
use futures::FutureExt;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cores shared by running tasks
    pub total_cores: u32,

    /// Memory shared by running tasks, in MB
    pub total_memory_mb: u64,

    /// Task-level retry policy
    pub retry: RetryConfig,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_processing(&ProcessingConfig::default())
    }
}

impl SchedulerConfig {
    pub fn from_processing(processing: &ProcessingConfig) -> Self {
        Self {
            total_cores: processing.total_cores,
            total_memory_mb: processing.total_memory_mb,
            retry: processing.retry.clone(),
            enable_metrics: processing.enable_metrics,
            metrics_interval_secs: processing.metrics_interval_secs,
            metrics_output_path: processing.metrics_output_path.clone(),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    /// Output already present, or not needed by any unfinished task
    Skipped,
    Failed,
    /// Never started because its sample failed
    Cancelled,
}

impl TaskState {
    fn is_done(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Skipped)
    }
}

/// Final result for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SampleOutcome {
    /// At least one task ran and everything finished
    Succeeded,
    /// Nothing needed to run
    AlreadyComplete,
    /// A task exhausted its attempts
    Failed { task: String, error: String },
}

impl SampleOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SampleOutcome::Failed { .. })
    }
}

/// Statistics and per-sample results from a scheduler run.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    /// Outcome per sample
    pub samples: BTreeMap<String, SampleOutcome>,

    /// Total tasks in the graph
    pub total_tasks: usize,

    /// Tasks that ran to success
    pub tasks_succeeded: usize,

    /// Tasks skipped because their output existed or was not needed
    pub tasks_skipped: usize,

    /// Tasks that failed terminally
    pub tasks_failed: usize,

    /// Tasks never started because their sample failed
    pub tasks_cancelled: usize,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.samples.values().all(SampleOutcome::is_success)
    }

    pub fn failed_samples(&self) -> Vec<&str> {
        self.samples
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(s, _)| s.as_str())
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failed_samples().len();
        write!(
            f,
            "{} samples ({} succeeded, {} failed) | {} tasks: {} run, {} skipped, {} failed, {} cancelled",
            self.samples.len(),
            self.samples.len() - failed,
            failed,
            self.total_tasks,
            self.tasks_succeeded,
            self.tasks_skipped,
            self.tasks_failed,
            self.tasks_cancelled
        )
    }
}

/// Ready queue entry: highest priority first, then lowest id.
#[derive(Debug, PartialEq, Eq)]
struct ReadyTask {
    priority: i32,
    id: TaskId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Free cores and memory.
#[derive(Debug)]
struct Budget {
    cores: i64,
    memory_mb: i64,
}

impl Budget {
    fn fits(&self, r: &TaskResources) -> bool {
        self.cores >= r.cores as i64 && self.memory_mb >= r.memory_mb as i64
    }

    fn take(&mut self, r: &TaskResources) {
        self.cores -= r.cores as i64;
        self.memory_mb -= r.memory_mb as i64;
    }

    fn give(&mut self, r: &TaskResources) {
        self.cores += r.cores as i64;
        self.memory_mb += r.memory_mb as i64;
    }
}

enum Outcome {
    Succeeded { attempts: usize },
    Skipped,
    Failed { error: PipelineError, attempts: usize },
}

/// Scheduler running a task graph through a [`TaskHandler`].
pub struct Scheduler<H: TaskHandler> {
    handler: Arc<H>,
    graph: Arc<TaskGraph>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl<H: TaskHandler> Scheduler<H> {
    pub fn new(handler: Arc<H>, graph: Arc<TaskGraph>, metrics: Arc<Metrics>, config: SchedulerConfig) -> Self {
        Self {
            handler,
            graph,
            metrics,
            config,
        }
    }

    /// Decide which tasks must run. Walks ids in reverse so every dependent is
    /// decided before its dependencies.
    async fn prune(&self) -> Vec<bool> {
        let n = self.graph.len();
        let mut needed = vec![false; n];

        for id in (0..n).rev() {
            let dependents = self.graph.dependents(id);
            let wanted = dependents.is_empty() || dependents.iter().any(|&d| needed[d]);
            if !wanted {
                continue;
            }
            needed[id] = match self.handler.is_complete(&self.graph, id).await {
                Ok(complete) => !complete,
                Err(e) => {
                    tracing::warn!(
                        "Cannot check {}: {}; scheduling it",
                        self.graph.task(id).key,
                        e
                    );
                    true
                }
            };
        }
        needed
    }

    /// Run every task in the graph. Per-sample failures are reported, not
    /// propagated.
    pub async fn run(&self) -> RunReport {
        let graph = &self.graph;
        let n = graph.len();

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                n as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let needed = self.prune().await;
        let mut states = vec![TaskState::Pending; n];
        for (id, state) in states.iter_mut().enumerate() {
            if !needed[id] {
                *state = TaskState::Skipped;
                self.metrics.add_task_skipped();
            }
        }
        tracing::info!(
            "Scheduling {} of {} tasks ({} cores, {} MB)",
            needed.iter().filter(|&&x| x).count(),
            n,
            self.config.total_cores,
            self.config.total_memory_mb
        );

        let mut waiting: Vec<usize> = graph
            .tasks()
            .iter()
            .map(|t| t.deps.iter().filter(|&&d| !states[d].is_done()).count())
            .collect();

        let mut ready = BinaryHeap::new();
        for task in graph.tasks() {
            if states[task.id] == TaskState::Pending && waiting[task.id] == 0 {
                states[task.id] = TaskState::Ready;
                ready.push(ReadyTask {
                    priority: task.priority(),
                    id: task.id,
                });
            }
        }

        let mut budget = Budget {
            cores: self.config.total_cores as i64,
            memory_mb: self.config.total_memory_mb as i64,
        };
        let mut running: JoinSet<Outcome> = JoinSet::new();
        let mut running_keys: HashSet<TaskKey> = HashSet::new();
        let mut spawned: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut failures: BTreeMap<String, (String, String)> = BTreeMap::new();

        loop {
            // Admit in strict priority order
            while let Some(top) = ready.peek() {
                let task = graph.task(top.id);
                if states[task.id] != TaskState::Ready {
                    ready.pop();
                    continue;
                }
                if running_keys.contains(&task.key) {
                    break;
                }
                if !budget.fits(&task.resources) && !running.is_empty() {
                    break;
                }
                ready.pop();

                budget.take(&task.resources);
                running_keys.insert(task.key.clone());
                states[task.id] = TaskState::Running;
                tracing::debug!("Starting {}", task.key);

                let handler = self.handler.clone();
                let graph = self.graph.clone();
                let retry = self.config.retry.clone();
                let metrics = self.metrics.clone();
                let id = task.id;
                let handle = running.spawn(async move {
                    let attempt = AssertUnwindSafe(run_task(handler, graph, id, retry, metrics))
                        .catch_unwind()
                        .await;
                    attempt.unwrap_or_else(|_| Outcome::Failed {
                        error: PipelineError::graph("task panicked"),
                        attempts: 1,
                    })
                });
                spawned.insert(handle.id(), id);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let Some((id, outcome)) = settle(&mut spawned, joined) else {
                continue;
            };

            let task = graph.task(id);
            budget.give(&task.resources);
            running_keys.remove(&task.key);

            match outcome {
                Outcome::Succeeded { attempts } => {
                    states[id] = TaskState::Succeeded;
                    self.metrics.add_task_succeeded();
                    tracing::debug!("{} succeeded after {} attempt(s)", task.key, attempts);
                }
                Outcome::Skipped => {
                    states[id] = TaskState::Skipped;
                    self.metrics.add_task_skipped();
                    tracing::debug!("{} already complete", task.key);
                }
                Outcome::Failed { error, attempts } => {
                    states[id] = TaskState::Failed;
                    self.metrics.add_task_failed();
                    let sn = task.key.sample().to_string();
                    tracing::error!(
                        "{} failed after {} attempt(s): {}; giving up on sample {}",
                        task.key,
                        attempts,
                        error,
                        sn
                    );

                    // Cascading cancellation for everything of this sample not yet started
                    for other in graph.tasks() {
                        if other.key.sample() == sn
                            && matches!(states[other.id], TaskState::Pending | TaskState::Ready)
                        {
                            states[other.id] = TaskState::Cancelled;
                        }
                    }

                    if !failures.contains_key(&sn) {
                        self.metrics.add_sample_failed();
                        self.handler.on_sample_failed(&sn, &error).await;
                        failures.insert(sn, (task.key.to_string(), error.to_string()));
                    }
                    continue;
                }
            }

            for &dep in graph.dependents(id) {
                waiting[dep] = waiting[dep].saturating_sub(1);
                if waiting[dep] == 0 && states[dep] == TaskState::Pending {
                    let dependent = graph.task(dep);
                    states[dep] = TaskState::Ready;
                    ready.push(ReadyTask {
                        priority: dependent.priority(),
                        id: dep,
                    });
                }
            }
        }

        for state in states.iter_mut() {
            if matches!(state, TaskState::Pending | TaskState::Ready) {
                *state = TaskState::Cancelled;
            }
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let report = self.report(&states, failures);

        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                n as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        report
    }

    fn report(&self, states: &[TaskState], failures: BTreeMap<String, (String, String)>) -> RunReport {
        let mut report = RunReport {
            total_tasks: states.len(),
            ..Default::default()
        };
        let mut ran: HashSet<&str> = HashSet::new();

        for task in self.graph.tasks() {
            let sn = task.key.sample();
            match states[task.id] {
                TaskState::Succeeded => {
                    report.tasks_succeeded += 1;
                    ran.insert(sn);
                }
                TaskState::Skipped => report.tasks_skipped += 1,
                TaskState::Failed => report.tasks_failed += 1,
                TaskState::Cancelled => report.tasks_cancelled += 1,
                TaskState::Pending | TaskState::Ready | TaskState::Running => {}
            }
            report
                .samples
                .entry(sn.to_string())
                .or_insert(SampleOutcome::AlreadyComplete);
        }

        for (sn, outcome) in report.samples.iter_mut() {
            if let Some((task, error)) = failures.get(sn) {
                *outcome = SampleOutcome::Failed {
                    task: task.clone(),
                    error: error.clone(),
                };
            } else if ran.contains(sn.as_str()) {
                *outcome = SampleOutcome::Succeeded;
            }
        }
        report
    }
}

/// Map a joined task back to its graph id. A task that never produced an
/// outcome (cancelled by the runtime) counts as failed so its budget and
/// sample are settled like any other failure.
fn settle(
    spawned: &mut HashMap<tokio::task::Id, TaskId>,
    joined: Result<(tokio::task::Id, Outcome), JoinError>,
) -> Option<(TaskId, Outcome)> {
    match joined {
        Ok((tid, outcome)) => match spawned.remove(&tid) {
            Some(id) => Some((id, outcome)),
            None => {
                tracing::error!("Joined unknown task {}", tid);
                None
            }
        },
        Err(e) => match spawned.remove(&e.id()) {
            Some(id) => Some((
                id,
                Outcome::Failed {
                    error: PipelineError::graph(format!("task did not finish: {}", e)),
                    attempts: 1,
                },
            )),
            None => {
                tracing::error!("Unknown task failed to join: {}", e);
                None
            }
        },
    }
}

/// Run one task with the idempotent short-circuit and retries.
async fn run_task<H: TaskHandler>(
    handler: Arc<H>,
    graph: Arc<TaskGraph>,
    id: TaskId,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
) -> Outcome {
    let task = graph.task(id);
    let mut attempt = 0;

    loop {
        match handler.is_complete(&graph, id).await {
            Ok(true) if attempt == 0 => return Outcome::Skipped,
            Ok(true) => return Outcome::Succeeded { attempts: attempt },
            Ok(false) => {}
            Err(e) => tracing::warn!("Cannot check {}: {}; running it", task.key, e),
        }

        attempt += 1;
        let error = match handler.execute(&graph, id).await {
            Ok(()) => return Outcome::Succeeded { attempts: attempt },
            Err(e) => e,
        };

        if attempt >= error.attempt_budget(retry.max_retries) {
            return Outcome::Failed {
                error,
                attempts: attempt,
            };
        }

        if matches!(error, PipelineError::Merge { .. }) && !dependencies_complete(&*handler, &graph, id).await {
            tracing::warn!("{} failed: {}; inputs are gone, not retrying", task.key, error);
            return Outcome::Failed {
                error,
                attempts: attempt,
            };
        }

        let backoff: Duration = retry.backoff_after(attempt);
        metrics.add_task_retry();
        tracing::warn!(
            "{} attempt {} failed: {}, retrying in {}ms",
            task.key,
            attempt,
            error,
            backoff.as_millis()
        );
        tokio::time::sleep(backoff).await;
    }
}

async fn dependencies_complete<H: TaskHandler>(handler: &H, graph: &TaskGraph, id: TaskId) -> bool {
    for &dep in &graph.task(id).deps {
        match handler.is_complete(graph, dep).await {
            Ok(true) => {}
            _ => return false,
        }
    }
    true
}
