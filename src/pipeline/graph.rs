//! Task graph construction.
//!
//! Every sample expands into the same topology:
//!
//! ```text
//! download -> mapAndCount(p) for each partition -> mergeContig(c) for each contig
//!          -> mergeSample -> cleanup
//! ```
//!
//! With live merging, `mapAndCount` tasks are not created and each
//! `mergeContig` depends on `download` directly. Task ids are assigned in
//! declaration order and dependencies always point at earlier ids, so id order
//! is a topological order.

use super::planner::PartitionPlan;
use crate::config::{ResourceConfig, TaskResources};
use crate::error::{PipelineError, Result};
use crate::inputs::{ContigTable, Sample};
use crate::io::KeyLayout;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type TaskId = usize;

/// Unique identity of a unit of work. At most one task per key ever runs at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    Download { sample: String },
    MapAndCount { sample: String, partition: u32 },
    MergeContig { sample: String, contig: String },
    MergeSample { sample: String },
    Cleanup { sample: String },
}

impl TaskKey {
    pub fn sample(&self) -> &str {
        match self {
            TaskKey::Download { sample }
            | TaskKey::MapAndCount { sample, .. }
            | TaskKey::MergeContig { sample, .. }
            | TaskKey::MergeSample { sample }
            | TaskKey::Cleanup { sample } => sample,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Download { sample } => write!(f, "download({})", sample),
            TaskKey::MapAndCount { sample, partition } => {
                write!(f, "mapAndCount({}, {})", sample, partition)
            }
            TaskKey::MergeContig { sample, contig } => write!(f, "mergeContig({}, {})", sample, contig),
            TaskKey::MergeSample { sample } => write!(f, "mergeSample({})", sample),
            TaskKey::Cleanup { sample } => write!(f, "cleanup({})", sample),
        }
    }
}

/// Which realization of the contig merge produces contig artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// Read materialized partition artifacts
    Batch,
    /// Stream counts straight from the staged raw input
    Live,
}

impl MergeStrategy {
    /// The single place the two contig merge producers are chosen between.
    pub fn select(live_merge: bool) -> Self {
        if live_merge {
            MergeStrategy::Live
        } else {
            MergeStrategy::Batch
        }
    }
}

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Download,
    MapAndCount { partition: u32 },
    MergeContig { contig: String, strategy: MergeStrategy },
    MergeSample,
    Cleanup,
}

impl TaskKind {
    pub fn stage_name(&self) -> &'static str {
        match self {
            TaskKind::Download => "download",
            TaskKind::MapAndCount { .. } => "mapAndCount",
            TaskKind::MergeContig {
                strategy: MergeStrategy::Batch,
                ..
            } => "mergeContig(batch)",
            TaskKind::MergeContig {
                strategy: MergeStrategy::Live,
                ..
            } => "mergeContig(live)",
            TaskKind::MergeSample => "mergeSample",
            TaskKind::Cleanup => "cleanup",
        }
    }
}

/// One schedulable unit.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub key: TaskKey,
    pub kind: TaskKind,
    pub sample: Arc<Sample>,
    /// Tasks that must succeed first
    pub deps: Vec<TaskId>,
    /// Remote artifact this task produces, if any
    pub output: Option<String>,
    pub resources: TaskResources,
}

impl Task {
    pub fn priority(&self) -> i32 {
        self.resources.priority
    }
}

fn same_deps(a: &[TaskId], b: &[TaskId]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    a.dedup();
    b.sort_unstable();
    b.dedup();
    a == b
}

/// Incrementally declares tasks, deduplicating compatible redeclarations.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    tasks: Vec<Task>,
    by_key: HashMap<TaskKey, TaskId>,
    by_output: HashMap<String, TaskId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a task and return its id.
    ///
    /// Redeclaring an existing key or output with the same dependencies returns
    /// the existing task; any other collision is a graph error.
    pub fn add(
        &mut self,
        key: TaskKey,
        kind: TaskKind,
        sample: Arc<Sample>,
        deps: Vec<TaskId>,
        output: Option<String>,
        resources: TaskResources,
    ) -> Result<TaskId> {
        if let Some(&dep) = deps.iter().find(|&&d| d >= self.tasks.len()) {
            return Err(PipelineError::graph(format!(
                "{} depends on undeclared task {}",
                key, dep
            )));
        }

        if let Some(&existing) = self.by_key.get(&key) {
            let task = &self.tasks[existing];
            if task.kind == kind && task.output == output && same_deps(&task.deps, &deps) {
                return Ok(existing);
            }
            return Err(PipelineError::graph(format!(
                "{} declared twice with different definitions",
                key
            )));
        }

        if let Some(out) = &output {
            if let Some(&existing) = self.by_output.get(out) {
                let task = &self.tasks[existing];
                if same_deps(&task.deps, &deps) {
                    return Ok(existing);
                }
                return Err(PipelineError::graph(format!(
                    "output {} produced by both {} and {} with incompatible dependencies",
                    out, task.key, key
                )));
            }
        }

        let id = self.tasks.len();
        self.by_key.insert(key.clone(), id);
        if let Some(out) = &output {
            self.by_output.insert(out.clone(), id);
        }
        self.tasks.push(Task {
            id,
            key,
            kind,
            sample,
            deps,
            output,
            resources,
        });
        Ok(id)
    }

    pub fn build(self) -> TaskGraph {
        let mut dependents = vec![Vec::new(); self.tasks.len()];
        for task in &self.tasks {
            for &dep in &task.deps {
                dependents[dep].push(task.id);
            }
        }
        TaskGraph {
            tasks: self.tasks,
            dependents,
        }
    }
}

/// Inputs that shape every sample's tasks.
pub struct GraphInputs<'a> {
    pub contigs: &'a ContigTable,
    pub plan: PartitionPlan,
    pub layout: &'a KeyLayout,
    pub resources: &'a ResourceConfig,
    pub strategy: MergeStrategy,
}

/// Expand the fixed topology for every sample.
pub fn build_graph(samples: &[Sample], inputs: &GraphInputs<'_>) -> Result<TaskGraph> {
    let mut builder = GraphBuilder::new();
    for sample in samples {
        add_sample(&mut builder, Arc::new(sample.clone()), inputs)?;
    }
    let graph = builder.build();
    tracing::info!(
        "Task graph: {} tasks for {} samples ({:?} merge)",
        graph.len(),
        samples.len(),
        inputs.strategy
    );
    Ok(graph)
}

fn add_sample(builder: &mut GraphBuilder, sample: Arc<Sample>, inputs: &GraphInputs<'_>) -> Result<()> {
    let sn = sample.sn.clone();
    let res = inputs.resources;

    let download = builder.add(
        TaskKey::Download { sample: sn.clone() },
        TaskKind::Download,
        sample.clone(),
        Vec::new(),
        None,
        res.download,
    )?;

    let merge_deps = match inputs.strategy {
        MergeStrategy::Batch => inputs
            .plan
            .partitions()
            .map(|partition| {
                builder.add(
                    TaskKey::MapAndCount {
                        sample: sn.clone(),
                        partition,
                    },
                    TaskKind::MapAndCount { partition },
                    sample.clone(),
                    vec![download],
                    Some(inputs.layout.partition(&sn, partition)),
                    res.map_and_count,
                )
            })
            .collect::<Result<Vec<_>>>()?,
        MergeStrategy::Live => vec![download],
    };

    let mut contig_tasks = Vec::with_capacity(inputs.contigs.len());
    for contig in inputs.contigs.iter() {
        contig_tasks.push(builder.add(
            TaskKey::MergeContig {
                sample: sn.clone(),
                contig: contig.name.clone(),
            },
            TaskKind::MergeContig {
                contig: contig.name.clone(),
                strategy: inputs.strategy,
            },
            sample.clone(),
            merge_deps.clone(),
            Some(inputs.layout.contig(&sn, &contig.name)),
            res.merge_contig,
        )?);
    }

    let merge_sample = builder.add(
        TaskKey::MergeSample { sample: sn.clone() },
        TaskKind::MergeSample,
        sample.clone(),
        contig_tasks,
        Some(inputs.layout.sample(&sn)),
        res.merge_sample,
    )?;

    builder.add(
        TaskKey::Cleanup { sample: sn },
        TaskKind::Cleanup,
        sample,
        vec![merge_sample],
        None,
        res.cleanup,
    )?;
    Ok(())
}

/// Immutable task graph.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    dependents: Vec<Vec<TaskId>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in declaration (topological) order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        &self.dependents[id]
    }

    /// Output keys of a task's dependencies, in dependency order.
    pub fn dependency_outputs(&self, id: TaskId) -> Vec<String> {
        self.tasks[id]
            .deps
            .iter()
            .filter_map(|&d| self.tasks[d].output.clone())
            .collect()
    }

    /// Task counts per stage, in pipeline order.
    pub fn tasks_by_stage(&self) -> Vec<(&'static str, usize)> {
        let mut counts: Vec<(&'static str, usize)> = Vec::new();
        for task in &self.tasks {
            let stage = task.kind.stage_name();
            match counts.iter_mut().find(|(s, _)| *s == stage) {
                Some((_, n)) => *n += 1,
                None => counts.push((stage, 1)),
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::planner::plan;

    fn sample(sn: &str) -> Sample {
        Sample {
            sn: sn.to_string(),
            raw_key: format!("raw/{}.cram", sn),
            index_key: format!("raw/{}.crai", sn),
        }
    }

    fn graph(strategy: MergeStrategy, samples: &[Sample]) -> TaskGraph {
        let contigs = ContigTable::parse("chr1 100\nchr2 50\n").unwrap();
        let layout = KeyLayout::new(None, None);
        let resources = ResourceConfig::default();
        let inputs = GraphInputs {
            contigs: &contigs,
            plan: plan(4, 100, None).unwrap(),
            layout: &layout,
            resources: &resources,
            strategy,
        };
        build_graph(samples, &inputs).unwrap()
    }

    #[test]
    fn test_batch_topology() {
        let g = graph(MergeStrategy::Batch, &[sample("S1")]);
        // download + 5 partitions + 2 contigs + mergeSample + cleanup
        assert_eq!(g.len(), 10);
        assert_eq!(
            g.tasks_by_stage(),
            vec![
                ("download", 1),
                ("mapAndCount", 5),
                ("mergeContig(batch)", 2),
                ("mergeSample", 1),
                ("cleanup", 1)
            ]
        );

        let chr1 = g
            .tasks()
            .iter()
            .find(|t| matches!(&t.kind, TaskKind::MergeContig { contig, .. } if contig == "chr1"))
            .unwrap();
        // Every partition, not just ones touching chr1
        assert_eq!(chr1.deps, vec![1, 2, 3, 4, 5]);
        assert_eq!(g.dependency_outputs(chr1.id).len(), 5);
        assert_eq!(chr1.output.as_deref(), Some("contigs/S1/S1.chr1.wssd"));

        for task in g.tasks() {
            assert!(task.deps.iter().all(|&d| d < task.id));
        }
    }

    #[test]
    fn test_live_topology_has_no_partition_tasks() {
        let g = graph(MergeStrategy::Live, &[sample("S1")]);
        assert_eq!(g.len(), 5);
        assert!(g
            .tasks()
            .iter()
            .all(|t| !matches!(t.kind, TaskKind::MapAndCount { .. })));
        for task in g.tasks() {
            if let TaskKind::MergeContig { strategy, .. } = task.kind {
                assert_eq!(strategy, MergeStrategy::Live);
                assert_eq!(task.deps, vec![0]);
            }
        }
    }

    #[test]
    fn test_strategy_selector() {
        assert_eq!(MergeStrategy::select(true), MergeStrategy::Live);
        assert_eq!(MergeStrategy::select(false), MergeStrategy::Batch);
    }

    #[test]
    fn test_samples_independent() {
        let g = graph(MergeStrategy::Batch, &[sample("S1"), sample("S2")]);
        assert_eq!(g.len(), 20);
        for task in g.tasks() {
            for &dep in &task.deps {
                assert_eq!(g.task(dep).key.sample(), task.key.sample());
            }
        }
        assert_eq!(g.dependents(0).len(), 5);
    }

    #[test]
    fn test_compatible_redeclaration_deduplicated() {
        let mut b = GraphBuilder::new();
        let s = Arc::new(sample("S1"));
        let res = ResourceConfig::default();
        let key = TaskKey::Download { sample: "S1".to_string() };

        let a = b
            .add(key.clone(), TaskKind::Download, s.clone(), vec![], None, res.download)
            .unwrap();
        let again = b
            .add(key, TaskKind::Download, s, vec![], None, res.download)
            .unwrap();
        assert_eq!(a, again);
        assert_eq!(b.build().len(), 1);
    }

    #[test]
    fn test_competing_producers_rejected() {
        let mut b = GraphBuilder::new();
        let s = Arc::new(sample("S1"));
        let res = ResourceConfig::default();
        let out = Some("contigs/S1/S1.chr1.wssd".to_string());

        let download = b
            .add(
                TaskKey::Download { sample: "S1".to_string() },
                TaskKind::Download,
                s.clone(),
                vec![],
                None,
                res.download,
            )
            .unwrap();
        let count = b
            .add(
                TaskKey::MapAndCount {
                    sample: "S1".to_string(),
                    partition: 0,
                },
                TaskKind::MapAndCount { partition: 0 },
                s.clone(),
                vec![download],
                Some("partitions/S1/p0".to_string()),
                res.map_and_count,
            )
            .unwrap();

        b.add(
            TaskKey::MergeContig {
                sample: "S1".to_string(),
                contig: "chr1".to_string(),
            },
            TaskKind::MergeContig {
                contig: "chr1".to_string(),
                strategy: MergeStrategy::Batch,
            },
            s.clone(),
            vec![count],
            out.clone(),
            res.merge_contig,
        )
        .unwrap();

        // Same key redeclared as the live variant
        let err = b
            .add(
                TaskKey::MergeContig {
                    sample: "S1".to_string(),
                    contig: "chr1".to_string(),
                },
                TaskKind::MergeContig {
                    contig: "chr1".to_string(),
                    strategy: MergeStrategy::Live,
                },
                s.clone(),
                vec![download],
                out.clone(),
                res.merge_contig,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Graph { .. }));

        // Different key, same output, different dependencies
        let err = b
            .add(
                TaskKey::MergeSample { sample: "S1".to_string() },
                TaskKind::MergeSample,
                s,
                vec![download],
                out,
                res.merge_sample,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Graph { .. }));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut b = GraphBuilder::new();
        let err = b
            .add(
                TaskKey::Cleanup { sample: "S1".to_string() },
                TaskKind::Cleanup,
                Arc::new(sample("S1")),
                vec![3],
                None,
                ResourceConfig::default().cleanup,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Graph { .. }));
    }
}
