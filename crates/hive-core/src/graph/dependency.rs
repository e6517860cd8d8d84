//! Dependency graph for task readiness and cycle analysis.
//!
//! Design:
//! - Forward edges: task -> tasks it unblocks
//! - Reverse edges: task -> tasks blocking it
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! The graph is derived data. It is rebuilt from the current record set for
//! every query and never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::domain::{Priority, TaskId, TaskRecord, TaskStatus};

/// Default ceiling on DFS path length during cycle detection.
pub const DEFAULT_MAX_DEPTH: usize = 10_000;

static NO_EDGES: BTreeSet<TaskId> = BTreeSet::new();

/// Dependency graph over a snapshot of task records.
///
/// - `edges`: TaskId -> set of TaskIds it unblocks
/// - `reverse_edges`: TaskId -> set of TaskIds that must complete first
///
/// A blocker declared from either side (`blocked_by` on the dependent,
/// `blocks` on the blocker) lands in both maps.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<TaskId, TaskRecord>,
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
    max_depth: usize,
}

impl DependencyGraph {
    /// Create an empty dependency graph.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            reverse_edges: BTreeMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Build the graph in one pass over the records.
    ///
    /// A duplicated `task_id` keeps the last record seen.
    pub fn build<I>(records: I) -> Self
    where
        I: IntoIterator<Item = TaskRecord>,
    {
        let mut graph = Self::new();
        let mut pairs = Vec::new();
        for record in records {
            let id = record.task_id.clone();
            for blocker in &record.dependencies.blocked_by {
                pairs.push((id.clone(), blocker.clone()));
            }
            for dependent in &record.dependencies.blocks {
                pairs.push((dependent.clone(), id.clone()));
            }
            graph.edges.entry(id.clone()).or_default();
            graph.reverse_edges.entry(id.clone()).or_default();
            graph.nodes.insert(id, record);
        }
        for (task, depends_on) in pairs {
            graph.add_dependency(task, depends_on);
        }
        graph
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Add a dependency: `task` waits for `depends_on`.
    ///
    /// Updates both maps:
    /// - edges: depends_on -> {task}
    /// - reverse_edges: task -> {depends_on}
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
        self.reverse_edges.entry(task).or_default().insert(depends_on);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.nodes.get(task_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.nodes.values()
    }

    /// Tasks that must complete before `task_id`.
    pub fn blockers(&self, task_id: &TaskId) -> &BTreeSet<TaskId> {
        self.reverse_edges.get(task_id).unwrap_or(&NO_EDGES)
    }

    /// Tasks waiting on `task_id`.
    pub fn dependents(&self, task_id: &TaskId) -> &BTreeSet<TaskId> {
        self.edges.get(task_id).unwrap_or(&NO_EDGES)
    }

    /// A blocker is resolved only if it is a known, completed record.
    fn is_resolved(&self, task_id: &TaskId) -> bool {
        self.nodes
            .get(task_id)
            .is_some_and(|record| record.status == TaskStatus::Completed)
    }

    pub fn is_ready(&self, record: &TaskRecord) -> bool {
        record.status == TaskStatus::Active
            && !record.blocked
            && record.owner.is_none()
            && self
                .blockers(&record.task_id)
                .iter()
                .all(|blocker| self.is_resolved(blocker))
    }

    /// Ids of every task eligible for work, in id order.
    pub fn ready_set(&self) -> Vec<TaskId> {
        self.ready_records()
            .into_iter()
            .map(|record| record.task_id.clone())
            .collect()
    }

    pub fn ready_records(&self) -> Vec<&TaskRecord> {
        self.nodes
            .values()
            .filter(|record| self.is_ready(record))
            .collect()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    /// Report every cycle reachable by an iterative DFS over `edges`.
    ///
    /// Each cycle starts at its smallest id; duplicates are dropped. A path
    /// longer than the depth ceiling stops descending on that branch only.
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut color: HashMap<&TaskId, Color> = HashMap::new();
        let mut found: BTreeSet<Vec<TaskId>> = BTreeSet::new();

        for root in self.edges.keys() {
            if color.get(root).copied().unwrap_or(Color::White) != Color::White {
                continue;
            }
            color.insert(root, Color::Gray);
            let mut path: Vec<&TaskId> = vec![root];
            let mut stack = vec![self.dependents(root).iter()];

            while let Some(successors) = stack.last_mut() {
                match successors.next() {
                    Some(next) => match color.get(next).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            if let Some(start) = path.iter().position(|id| *id == next) {
                                found.insert(normalize_cycle(&path[start..]));
                            }
                        }
                        Color::White => {
                            if path.len() >= self.max_depth {
                                warn!(
                                    task_id = %next,
                                    max_depth = self.max_depth,
                                    "dependency chain exceeds depth ceiling, skipping branch"
                                );
                                continue;
                            }
                            color.insert(next, Color::Gray);
                            path.push(next);
                            stack.push(self.dependents(next).iter());
                        }
                        Color::Black => {}
                    },
                    None => {
                        stack.pop();
                        if let Some(done) = path.pop() {
                            color.insert(done, Color::Black);
                        }
                    }
                }
            }
        }

        found.into_iter().collect()
    }

    pub fn has_cycles(&self) -> bool {
        !self.detect_cycles().is_empty()
    }

    /// Explain why `task_id` is (or is not) blocked.
    pub fn blocking_info(&self, task_id: &TaskId) -> BlockingInfo {
        let cycles = self.detect_cycles();
        self.blocking_info_with(task_id, &cycles)
    }

    fn blocking_info_with(&self, task_id: &TaskId, cycles: &[Vec<TaskId>]) -> BlockingInfo {
        let Some(record) = self.nodes.get(task_id) else {
            return BlockingInfo {
                task_id: task_id.clone(),
                is_blocked: true,
                reasons: vec![BlockReason::NotFound],
                blocking_tasks: BTreeSet::new(),
                in_cycle: false,
            };
        };

        let mut reasons = Vec::new();
        let mut blocking_tasks = BTreeSet::new();

        if record.blocked || record.status == TaskStatus::Blocked {
            reasons.push(BlockReason::Explicit {
                reason: record.blocking_reason.clone(),
            });
        }

        // BFS through unresolved blockers only.
        let mut queue = VecDeque::from([(task_id, 0usize)]);
        let mut seen: HashSet<&TaskId> = HashSet::from([task_id]);
        while let Some((current, depth)) = queue.pop_front() {
            for blocker in self.blockers(current) {
                if !seen.insert(blocker) {
                    continue;
                }
                match self.nodes.get(blocker) {
                    None => {
                        blocking_tasks.insert(blocker.clone());
                        reasons.push(BlockReason::UnknownDependency {
                            task_id: blocker.clone(),
                        });
                    }
                    Some(dep) if dep.status == TaskStatus::Completed => {}
                    Some(dep) => {
                        blocking_tasks.insert(blocker.clone());
                        reasons.push(BlockReason::UnresolvedDependency {
                            task_id: blocker.clone(),
                            status: dep.status,
                            depth: depth + 1,
                        });
                        queue.push_back((blocker, depth + 1));
                    }
                }
            }
        }

        let mut in_cycle = false;
        for cycle in cycles.iter().filter(|cycle| cycle.contains(task_id)) {
            in_cycle = true;
            reasons.push(BlockReason::Cycle {
                members: cycle.clone(),
            });
        }

        BlockingInfo {
            task_id: task_id.clone(),
            is_blocked: !reasons.is_empty(),
            reasons,
            blocking_tasks,
            in_cycle,
        }
    }

    /// Per-task dependency report over the whole graph.
    pub fn summary(&self) -> DependencySummary {
        let cycles = self.detect_cycles();
        let tasks = self
            .nodes
            .values()
            .map(|record| {
                let info = self.blocking_info_with(&record.task_id, &cycles);
                TaskSummary {
                    task_id: record.task_id.clone(),
                    status: record.status,
                    priority: record.priority,
                    blocks: self.dependents(&record.task_id).iter().cloned().collect(),
                    blocked_by: self.blockers(&record.task_id).iter().cloned().collect(),
                    effectively_blocked: info.is_blocked,
                    blocking_reasons: info.reasons.iter().map(ToString::to_string).collect(),
                    in_cycle: info.in_cycle,
                }
            })
            .collect();

        DependencySummary {
            total_tasks: self.nodes.len(),
            has_cycles: !cycles.is_empty(),
            cycles,
            tasks,
        }
    }
}

fn normalize_cycle(members: &[&TaskId]) -> Vec<TaskId> {
    let start = members
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    members[start..]
        .iter()
        .chain(members[..start].iter())
        .map(|id| (*id).clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    NotFound,
    Explicit {
        reason: Option<String>,
    },
    UnresolvedDependency {
        task_id: TaskId,
        status: TaskStatus,
        depth: usize,
    },
    UnknownDependency {
        task_id: TaskId,
    },
    Cycle {
        members: Vec<TaskId>,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::NotFound => f.write_str("task not found"),
            BlockReason::Explicit { reason: Some(r) } => write!(f, "explicitly blocked: {r}"),
            BlockReason::Explicit { reason: None } => f.write_str("explicitly blocked"),
            BlockReason::UnresolvedDependency {
                task_id,
                status,
                depth,
            } if *depth > 1 => write!(f, "transitive dependency {task_id} is {status}"),
            BlockReason::UnresolvedDependency {
                task_id, status, ..
            } => write!(f, "dependency {task_id} is {status}"),
            BlockReason::UnknownDependency { task_id } => {
                write!(f, "dependency {task_id} does not exist")
            }
            BlockReason::Cycle { members } => {
                let ids: Vec<&str> = members.iter().map(TaskId::as_str).collect();
                write!(f, "part of dependency cycle: {}", ids.join(" -> "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockingInfo {
    pub task_id: TaskId,
    pub is_blocked: bool,
    pub reasons: Vec<BlockReason>,
    pub blocking_tasks: BTreeSet<TaskId>,
    pub in_cycle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub priority: Priority,
    pub blocks: Vec<TaskId>,
    pub blocked_by: Vec<TaskId>,
    pub effectively_blocked: bool,
    pub blocking_reasons: Vec<String>,
    pub in_cycle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySummary {
    pub total_tasks: usize,
    pub has_cycles: bool,
    pub cycles: Vec<Vec<TaskId>>,
    pub tasks: Vec<TaskSummary>,
}
