//! TaskScheduler - ready なタスクを優先度順に 1 つずつ dispatch する
//!
//! # 1 サイクルの流れ
//! 1. store から全レコードを読み、DependencyGraph の ready 集合を作る
//! 2. attempted 済みを除いて並べ替え、先頭を選ぶ
//! 3. attempted に入れてから dispatch（成功・失敗に関わらず同サイクル内で再選択しない）
//! 4. `max_dispatches` 回試すか候補が尽きるまで繰り返す
//!
//! 失敗は `skipped` に記録されるだけで、サイクルは必ず `CycleSummary` を返す。

use std::cmp::Ordering;
use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{HiveError, TaskId, TaskRecord};
use crate::graph::DependencyGraph;
use crate::ports::TaskStore;

/// Scheduler order: priority first, then oldest `last_updated`, then id.
///
/// A missing timestamp sorts after every real one.
pub fn schedule_order(a: &TaskRecord, b: &TaskRecord) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| match (a.last_updated, b.last_updated) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.task_id.cmp(&b.task_id))
}

pub fn sort_candidates(candidates: &mut [&TaskRecord]) {
    candidates.sort_by(|a, b| schedule_order(a, b));
}

/// What the scheduler hands a selected task to.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, record: &TaskRecord) -> Result<(), HiveError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    MaxDispatches,
    NoCandidates,
    StoreUnavailable { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub dispatched: Vec<TaskId>,
    pub skipped: Vec<SkippedTask>,
    pub attempts: usize,
    pub stop_reason: StopReason,
}

pub struct TaskScheduler {
    max_dispatches: usize,
    attempted: HashSet<TaskId>,
}

impl TaskScheduler {
    pub fn new(max_dispatches: usize) -> Self {
        Self {
            max_dispatches,
            attempted: HashSet::new(),
        }
    }

    pub fn max_dispatches(&self) -> usize {
        self.max_dispatches
    }

    pub fn was_attempted(&self, task_id: &TaskId) -> bool {
        self.attempted.contains(task_id)
    }

    /// Exclude `task_id` from selection until the next cycle.
    pub fn mark_attempted(&mut self, task_id: TaskId) -> bool {
        self.attempted.insert(task_id)
    }

    /// Best ready, not-yet-attempted record in `graph`.
    pub fn select_next<'g>(&self, graph: &'g DependencyGraph) -> Option<&'g TaskRecord> {
        graph
            .ready_records()
            .into_iter()
            .filter(|record| !self.attempted.contains(&record.task_id))
            .min_by(|a, b| schedule_order(a, b))
    }

    pub async fn run_cycle(
        &mut self,
        store: &dyn TaskStore,
        dispatcher: &dyn Dispatch,
    ) -> CycleSummary {
        self.attempted.clear();
        let mut dispatched = Vec::new();
        let mut skipped = Vec::new();
        let mut attempts = 0;

        let stop_reason = loop {
            if attempts >= self.max_dispatches {
                break StopReason::MaxDispatches;
            }

            let records = match store.list_all().await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "task store unavailable, ending cycle");
                    break StopReason::StoreUnavailable {
                        message: e.to_string(),
                    };
                }
            };
            let graph = DependencyGraph::build(records);
            let Some(record) = self.select_next(&graph) else {
                break StopReason::NoCandidates;
            };

            self.attempted.insert(record.task_id.clone());
            attempts += 1;
            match dispatcher.dispatch(record).await {
                Ok(()) => {
                    debug!(task_id = %record.task_id, priority = %record.priority, "dispatched");
                    dispatched.push(record.task_id.clone());
                }
                Err(e) => {
                    debug!(task_id = %record.task_id, error = %e, "dispatch skipped");
                    skipped.push(SkippedTask {
                        task_id: record.task_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        };

        info!(
            dispatched = dispatched.len(),
            skipped = skipped.len(),
            attempts,
            stop_reason = ?stop_reason,
            "scheduling cycle finished"
        );
        CycleSummary {
            dispatched,
            skipped,
            attempts,
            stop_reason,
        }
    }
}
