//! Pipeline orchestration: partition planning, the task graph, and the
//! scheduler that drives it.

mod executor;
mod graph;
mod metrics;
mod planner;
mod scheduler;

#[cfg(test)]
mod pipeline_integration_tests;

pub use executor::{TaskExecutor, TaskHandler};
pub use graph::{
    build_graph, GraphBuilder, GraphInputs, MergeStrategy, Task, TaskGraph, TaskId, TaskKey, TaskKind,
};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use planner::{plan, PartitionPlan};
pub use scheduler::{RunReport, SampleOutcome, Scheduler, SchedulerConfig, TaskState};
