//! ParallelOrchestrator - ready なタスクに ExecutionLoop を並列で割り当てる
//!
//! # フロー
//! 1. store → DependencyGraph → scheduler 順で次の候補を選ぶ（バッチ内で attempted 管理）
//! 2. Claimer で claim（owner は `<holder>:<loop_id>`）。失敗は skipped に記録
//! 3. JoinSet に ExecutionLoop を spawn。空きスロットがある間は 1-2 を繰り返す
//! 4. ループが終端に達したら ticket を finalize（lease 解放・owner クリア・結果の反映）
//!
//! deadline に達したら全ループに stop を送り、`stop_grace` 待っても終わらないものは abort する。
//! abort されたループは blocked にせず解放だけ行い、cancelled として報告する。
//! panic したループはその場でスロットを空け、blocked（理由に panicked）にして failed として報告する。
//! `weave_until` の shutdown future（Ctrl-C など）も deadline と同じ扱いになる。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::app::claim::{ClaimTicket, Claimer, Resolution};
use crate::app::execution_loop::{ExecutionLoop, LoopConfig, LoopHandle};
use crate::app::scheduler::{SkippedTask, TaskScheduler};
use crate::domain::{HiveError, LoopId, LoopState, LoopStatus, TaskId};
use crate::graph::DependencyGraph;
use crate::ports::{Clock, IterationExecutor, SystemClock};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_parallel: usize,
    pub deadline: Duration,
    pub stop_grace: Duration,
    pub holder: String,
    pub loop_config: LoopConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            deadline: Duration::from_secs(4 * 3600),
            stop_grace: Duration::from_secs(30),
            holder: "hive".to_string(),
            loop_config: LoopConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub loops: BTreeMap<LoopId, LoopState>,
    pub skipped: Vec<SkippedTask>,
    pub status_counts: BTreeMap<LoopStatus, usize>,
    pub elapsed_secs: f64,
    pub deadline_hit: bool,
    pub interrupted: bool,
}

impl BatchReport {
    fn new() -> Self {
        Self {
            loops: BTreeMap::new(),
            skipped: Vec::new(),
            status_counts: BTreeMap::new(),
            elapsed_secs: 0.0,
            deadline_hit: false,
            interrupted: false,
        }
    }

    fn record(&mut self, state: LoopState) {
        *self.status_counts.entry(state.status).or_default() += 1;
        self.loops.insert(state.loop_id.clone(), state);
    }
}

struct RunningLoop {
    handle: LoopHandle,
    ticket: ClaimTicket,
}

pub struct ParallelOrchestrator {
    claimer: Claimer,
    executor: Arc<dyn IterationExecutor>,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
}

impl ParallelOrchestrator {
    pub fn new(
        claimer: Claimer,
        executor: Arc<dyn IterationExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            claimer,
            executor,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one batch to completion or deadline.
    ///
    /// Only the initial store read is fatal. Later read failures stop new work
    /// from starting but let running loops finish.
    pub async fn weave(&self) -> Result<BatchReport, HiveError> {
        self.weave_until(std::future::pending()).await
    }

    /// Like [`weave`](Self::weave), but `shutdown` resolving acts as an early deadline.
    pub async fn weave_until<F>(&self, shutdown: F) -> Result<BatchReport, HiveError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let started = Instant::now();
        let deadline = started + self.config.deadline;
        let max_parallel = self.config.max_parallel.max(1);
        let mut scheduler = TaskScheduler::new(usize::MAX);
        let mut running: HashMap<task::Id, RunningLoop> = HashMap::new();
        let mut joins: JoinSet<LoopState> = JoinSet::new();
        let mut report = BatchReport::new();
        let mut first_read = true;
        let mut exhausted = false;

        info!(
            max_parallel,
            deadline_secs = self.config.deadline.as_secs(),
            holder = %self.config.holder,
            "weave started"
        );

        loop {
            while !exhausted && running.len() < max_parallel && Instant::now() < deadline {
                let graph = match self.claimer.store().list_all().await {
                    Ok(records) => DependencyGraph::build(records),
                    Err(e) if first_read => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "task store unavailable, no new loops will start");
                        exhausted = true;
                        break;
                    }
                };
                first_read = false;

                let Some(task_id) = scheduler.select_next(&graph).map(|r| r.task_id.clone())
                else {
                    break;
                };
                scheduler.mark_attempted(task_id.clone());

                match self.start_loop(&task_id, &mut joins).await {
                    Ok((id, entry)) => {
                        running.insert(id, entry);
                    }
                    Err(e) => {
                        info!(task_id = %task_id, reason = %e, "claim skipped");
                        report.skipped.push(SkippedTask {
                            task_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = joins.join_next_with_id() => {
                    if let Some(joined) = joined {
                        self.settle(&mut running, &mut report, joined).await;
                    }
                    if joins.is_empty() {
                        self.release_leftovers(&mut running, &mut report).await;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    report.deadline_hit = true;
                    self.shut_down(&mut running, &mut joins, &mut report).await;
                    break;
                }
                _ = &mut shutdown => {
                    report.interrupted = true;
                    self.shut_down(&mut running, &mut joins, &mut report).await;
                    break;
                }
            }
        }

        report.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            loops = report.loops.len(),
            skipped = report.skipped.len(),
            deadline_hit = report.deadline_hit,
            interrupted = report.interrupted,
            elapsed_secs = report.elapsed_secs,
            "weave finished"
        );
        Ok(report)
    }

    async fn start_loop(
        &self,
        task_id: &TaskId,
        joins: &mut JoinSet<LoopState>,
    ) -> Result<(task::Id, RunningLoop), HiveError> {
        let loop_id = LoopId::derive(self.clock.now(), task_id);
        let owner = format!("{}:{}", self.config.holder, loop_id);
        let ticket = self.claimer.claim(task_id, &owner).await?;

        let execution = ExecutionLoop::with_clock(
            loop_id.clone(),
            task_id.clone(),
            self.config.loop_config.clone(),
            Arc::clone(&self.executor),
            Arc::clone(&self.clock),
        );
        let handle = execution.handle();
        let id = joins.spawn(execution.run()).id();
        info!(task_id = %task_id, loop_id = %loop_id, "loop started");
        Ok((id, RunningLoop { handle, ticket }))
    }

    async fn settle(
        &self,
        running: &mut HashMap<task::Id, RunningLoop>,
        report: &mut BatchReport,
        joined: Result<(task::Id, LoopState), JoinError>,
    ) {
        let id = match &joined {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        let Some(entry) = running.remove(&id) else {
            warn!(task = %id, "finished loop was not tracked");
            return;
        };

        match joined {
            Ok((_, state)) => {
                self.finalize(entry.ticket, &state).await;
                report.record(state);
            }
            Err(e) if e.is_panic() => {
                let mut state = entry.handle.snapshot();
                let message = panic_message(e);
                warn!(
                    loop_id = %state.loop_id,
                    task_id = %state.task_id,
                    panic = %message,
                    "loop panicked"
                );
                state.error_log.push(format!("panicked: {message}"));
                state.finish(LoopStatus::Failed, self.clock.now());
                let reason = format!("loop {} panicked: {message}", state.loop_id);
                let resolution = Resolution::Blocked {
                    reason: reason.clone(),
                };
                self.finish_claim(entry.ticket, &state, resolution, &reason).await;
                report.record(state);
            }
            Err(_) => self.release_cancelled(entry, report).await,
        }
    }

    async fn shut_down(
        &self,
        running: &mut HashMap<task::Id, RunningLoop>,
        joins: &mut JoinSet<LoopState>,
        report: &mut BatchReport,
    ) {
        warn!(
            running = running.len(),
            grace_secs = self.config.stop_grace.as_secs(),
            "stopping loops"
        );
        for entry in running.values() {
            entry.handle.stop();
        }

        let grace_end = Instant::now() + self.config.stop_grace;
        loop {
            tokio::select! {
                joined = joins.join_next_with_id() => match joined {
                    Some(joined) => self.settle(running, report, joined).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(grace_end) => {
                    joins.abort_all();
                    while let Some(joined) = joins.join_next_with_id().await {
                        self.settle(running, report, joined).await;
                    }
                    break;
                }
            }
        }

        self.release_leftovers(running, report).await;
    }

    /// Entries left without a joinable task. Released as cancelled.
    async fn release_leftovers(
        &self,
        running: &mut HashMap<task::Id, RunningLoop>,
        report: &mut BatchReport,
    ) {
        for (_, entry) in running.drain() {
            self.release_cancelled(entry, report).await;
        }
    }

    async fn release_cancelled(&self, entry: RunningLoop, report: &mut BatchReport) {
        let mut state = entry.handle.snapshot();
        state.finish(LoopStatus::Cancelled, self.clock.now());
        warn!(loop_id = %state.loop_id, status = %state.status, "loop aborted");
        self.finalize(entry.ticket, &state).await;
        report.record(state);
    }

    async fn finalize(&self, ticket: ClaimTicket, state: &LoopState) {
        if let Some(err) = state.error() {
            warn!(
                loop_id = %state.loop_id,
                task_id = %state.task_id,
                kind = ?err.kind(),
                error = %err,
                "loop ended without completion"
            );
        }
        let summary = format!("loop {} ended with status: {}", state.loop_id, state.status);
        let resolution = match state.status {
            LoopStatus::Completed => Resolution::Completed,
            LoopStatus::Failed | LoopStatus::CircuitBreak => Resolution::Blocked {
                reason: summary.clone(),
            },
            _ => Resolution::ReleaseOnly,
        };
        self.finish_claim(ticket, state, resolution, &summary).await;
    }

    async fn finish_claim(
        &self,
        ticket: ClaimTicket,
        state: &LoopState,
        resolution: Resolution,
        note: &str,
    ) {
        if let Err(e) = self.claimer.finalize(ticket, resolution, note).await {
            warn!(
                loop_id = %state.loop_id,
                task_id = %state.task_id,
                error = %e,
                "failed to finalize claim"
            );
        }
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}
