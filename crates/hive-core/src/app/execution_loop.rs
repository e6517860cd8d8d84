//! ExecutionLoop - 1 タスクに対する反復実行ループ
//!
//! # 1 ステップの判定順
//! 1. stop 要求 → cancelled
//! 2. 連続失敗が閾値以上 → circuit_break
//! 3. ループ全体の timeout 超過 → timeout
//! 4. イテレーション上限 → failed
//! 5. 1 時間の rate limit に達していれば待って 1 に戻る（イテレーションは消費しない）。
//!    待ち時間は `min(窓の残り, backoff, ループの残り時間)` で、backoff は最低 1 秒
//! 6. executor を `min(iteration_timeout, 残り時間)` で実行
//! 7. 成功なら連続失敗をリセットし、完了マーカーがあれば completed
//! 8. 失敗なら連続失敗と error_log に加算
//! 9. cooldown（最終イテレーション後と breaker 発動直後は省略）
//!
//! 時間計測は `tokio::time::Instant` で行うので、テストでは paused clock で進められる。
//! 停止は協調的で、stop はステップの先頭と sleep 中にだけ観測される。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::state::preview;
use crate::domain::{HiveError, IterationRecord, LoopId, LoopState, LoopStatus, TaskId};
use crate::ports::{Clock, IterationExecutor, IterationOutput, IterationRequest, SystemClock};

pub const DEFAULT_COMPLETION_MARKERS: [&str; 3] =
    ["LOOP_COMPLETE", "ALL_TASKS_DONE", "EXIT_SIGNAL"];

const RATE_WINDOW: Duration = Duration::from_secs(3600);
const MIN_RATE_BACKOFF: Duration = Duration::from_secs(1);
const ERROR_LOG_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub timeout: Duration,
    pub iteration_timeout: Duration,
    pub cooldown: Duration,
    pub rate_limit_per_hour: u32,
    pub rate_limit_backoff: Duration,
    pub circuit_breaker_threshold: u32,
    pub completion_markers: Vec<String>,
    pub history_limit: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            timeout: Duration::from_secs(3600),
            iteration_timeout: Duration::from_secs(900),
            cooldown: Duration::from_secs(5),
            rate_limit_per_hour: 100,
            rate_limit_backoff: Duration::from_secs(60),
            circuit_breaker_threshold: 5,
            completion_markers: DEFAULT_COMPLETION_MARKERS.map(String::from).to_vec(),
            history_limit: 100,
        }
    }
}

impl LoopConfig {
    fn find_marker(&self, output: &str) -> Option<&str> {
        let haystack = output.to_lowercase();
        self.completion_markers
            .iter()
            .find(|marker| !marker.is_empty() && haystack.contains(&marker.to_lowercase()))
            .map(String::as_str)
    }
}

/// Observer and stop switch for a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    loop_id: LoopId,
    stop_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<LoopState>,
}

impl LoopHandle {
    pub fn loop_id(&self) -> &LoopId {
        &self.loop_id
    }

    /// Request a cooperative stop. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn snapshot(&self) -> LoopState {
        self.state_rx.borrow().clone()
    }
}

pub struct ExecutionLoop {
    config: LoopConfig,
    executor: Arc<dyn IterationExecutor>,
    clock: Arc<dyn Clock>,
    state: LoopState,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<LoopState>,
    state_rx: watch::Receiver<LoopState>,
}

impl ExecutionLoop {
    pub fn new(
        loop_id: LoopId,
        task_id: TaskId,
        config: LoopConfig,
        executor: Arc<dyn IterationExecutor>,
    ) -> Self {
        Self::with_clock(loop_id, task_id, config, executor, Arc::new(SystemClock))
    }

    pub fn with_clock(
        loop_id: LoopId,
        task_id: TaskId,
        config: LoopConfig,
        executor: Arc<dyn IterationExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = LoopState::new(
            loop_id,
            task_id,
            config.max_iterations,
            config.history_limit,
            clock.now(),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(state.clone());
        Self {
            config,
            executor,
            clock,
            state,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            state_tx,
            state_rx,
        }
    }

    pub fn loop_id(&self) -> &LoopId {
        &self.state.loop_id
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            loop_id: self.state.loop_id.clone(),
            stop_tx: Arc::clone(&self.stop_tx),
            state_rx: self.state_rx.clone(),
        }
    }

    /// Run until a terminal state and return the final state.
    pub async fn run(mut self) -> LoopState {
        let started = Instant::now();
        let mut window_started = started;
        self.state.status = LoopStatus::Running;
        self.state.start_time = Some(self.clock.now());
        self.publish();
        info!(
            loop_id = %self.state.loop_id,
            task_id = %self.state.task_id,
            max_iterations = self.config.max_iterations,
            "execution loop started"
        );

        let status = loop {
            if self.stop_requested() {
                break LoopStatus::Cancelled;
            }

            if self.state.consecutive_failures >= self.config.circuit_breaker_threshold {
                warn!(
                    loop_id = %self.state.loop_id,
                    failures = self.state.consecutive_failures,
                    "circuit breaker tripped"
                );
                break LoopStatus::CircuitBreak;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                break LoopStatus::Timeout;
            }

            if self.state.current_iteration >= self.config.max_iterations {
                self.state
                    .error_log
                    .push("max iterations reached without completion".to_string());
                break LoopStatus::Failed;
            }

            if window_started.elapsed() >= RATE_WINDOW {
                window_started = Instant::now();
                self.state.calls_in_current_hour = 0;
                self.state.hour_window_start = self.clock.now();
            }
            if self.state.calls_in_current_hour >= self.config.rate_limit_per_hour {
                // Never zero, so the wait always yields.
                let wait = RATE_WINDOW
                    .saturating_sub(window_started.elapsed())
                    .min(self.config.rate_limit_backoff.max(MIN_RATE_BACKOFF))
                    .min(self.config.timeout - elapsed);
                warn!(
                    loop_id = %self.state.loop_id,
                    wait_secs = wait.as_secs_f64(),
                    "rate limit reached, waiting"
                );
                if self.sleep_or_stop(wait).await {
                    break LoopStatus::Cancelled;
                }
                continue;
            }

            let bound = self
                .config
                .iteration_timeout
                .min(self.config.timeout - elapsed);
            let output = self.execute_iteration(bound).await;

            if output.success {
                self.state.consecutive_failures = 0;
                if let Some(marker) = self.config.find_marker(&output.output) {
                    info!(loop_id = %self.state.loop_id, marker, "completion marker found");
                    break LoopStatus::Completed;
                }
            } else {
                self.state.consecutive_failures += 1;
                self.state.error_log.push(format!(
                    "Iteration {}: {}",
                    self.state.current_iteration,
                    truncate(&output.output, ERROR_LOG_CHARS)
                ));
            }
            self.publish();

            let last_iteration = self.state.current_iteration >= self.config.max_iterations;
            let breaker_tripped =
                self.state.consecutive_failures >= self.config.circuit_breaker_threshold;
            if last_iteration || breaker_tripped {
                continue;
            }
            if self.sleep_or_stop(self.config.cooldown).await {
                break LoopStatus::Cancelled;
            }
        };

        self.state.finish(status, self.clock.now());
        self.publish();
        info!(
            loop_id = %self.state.loop_id,
            task_id = %self.state.task_id,
            status = %self.state.status,
            iterations = self.state.current_iteration,
            "execution loop finished"
        );
        self.state
    }

    async fn execute_iteration(&mut self, bound: Duration) -> IterationOutput {
        let iteration = self.state.current_iteration + 1;
        let request = IterationRequest {
            loop_id: self.state.loop_id.clone(),
            task_id: self.state.task_id.clone(),
            iteration,
            max_iterations: self.config.max_iterations,
        };
        let started_at = self.clock.now();
        debug!(loop_id = %self.state.loop_id, iteration, "iteration started");

        // timeout で future を drop する。CommandExecutor なら子プロセスも kill される
        let output = match tokio::time::timeout(bound, self.executor.execute(request)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => IterationOutput::failure(e.to_string()),
            Err(_) => IterationOutput::failure(
                HiveError::Timeout(format!("iteration {iteration} after {}s", bound.as_secs_f64()))
                    .to_string(),
            ),
        };

        self.state.current_iteration = iteration;
        self.state.calls_in_current_hour += 1;
        self.state.set_last_output(&output.output);
        self.state.push_history(IterationRecord {
            iteration,
            success: output.success,
            started_at,
            finished_at: self.clock.now(),
            output_preview: preview(&output.output),
        });
        debug!(
            loop_id = %self.state.loop_id,
            iteration,
            success = output.success,
            "iteration finished"
        );
        output
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Returns true when stopped during the wait.
    async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.stop_requested();
        }
        let stopped = tokio::select! {
            Ok(_) = self.stop_rx.wait_for(|stop| *stop) => true,
            _ = tokio::time::sleep(duration) => false,
        };
        stopped || self.stop_requested()
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    type Respond = Box<dyn Fn(u32) -> Result<IterationOutput, HiveError> + Send + Sync>;

    struct Scripted {
        delay: Duration,
        respond: Respond,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(
            respond: impl Fn(u32) -> Result<IterationOutput, HiveError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                delay: Duration::ZERO,
                respond: Box::new(respond),
                calls: Mutex::default(),
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl IterationExecutor for Scripted {
        async fn execute(&self, request: IterationRequest) -> Result<IterationOutput, HiveError> {
            self.calls.lock().unwrap().push(Instant::now());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.respond)(request.iteration)
        }
    }

    fn config() -> LoopConfig {
        LoopConfig {
            max_iterations: 10,
            cooldown: Duration::from_secs(1),
            ..LoopConfig::default()
        }
    }

    fn build(config: LoopConfig, executor: Arc<Scripted>) -> ExecutionLoop {
        let task_id = TaskId::new("t1");
        ExecutionLoop::new(LoopId::derive(Utc::now(), &task_id), task_id, config, executor)
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_trips_after_exactly_threshold_failures() {
        let exec = Arc::new(Scripted::new(|_| Err(HiveError::Execution("boom".into()))));
        let state = build(
            LoopConfig {
                circuit_breaker_threshold: 3,
                ..config()
            },
            exec.clone(),
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::CircuitBreak);
        assert_eq!(state.current_iteration, 3);
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.error_log.len(), 3);
        assert!(state.error_log[0].starts_with("Iteration 1: "));
        assert_eq!(exec.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_on_third_iteration_completes() {
        let exec = Arc::new(Scripted::new(|i| {
            Ok(if i == 3 {
                IterationOutput::success("all good, loop_complete")
            } else {
                IterationOutput::success("working")
            })
        }));
        let state = build(config(), exec).run().await;

        assert_eq!(state.status, LoopStatus::Completed);
        assert_eq!(state.current_iteration, 3);
        assert_eq!(state.history.len(), 3);
        assert!(state.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let exec = Arc::new(Scripted::new(|i| {
            Ok(if i % 2 == 0 {
                IterationOutput::success("ok")
            } else {
                IterationOutput::failure("flaky")
            })
        }));
        let state = build(
            LoopConfig {
                max_iterations: 6,
                circuit_breaker_threshold: 2,
                ..config()
            },
            exec,
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::Failed);
        assert_eq!(state.current_iteration, 6);
        assert_eq!(
            state.error_log.last().map(String::as_str),
            Some("max iterations reached without completion")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_run_cancels_without_iterating() {
        let exec = Arc::new(Scripted::new(|_| Ok(IterationOutput::success("x"))));
        let execution = build(config(), exec.clone());
        execution.handle().stop();
        let state = execution.run().await;

        assert_eq!(state.status, LoopStatus::Cancelled);
        assert_eq!(state.current_iteration, 0);
        assert!(exec.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_cooldown() {
        let exec = Arc::new(Scripted::new(|_| Ok(IterationOutput::success("x"))));
        let execution = build(
            LoopConfig {
                cooldown: Duration::from_secs(600),
                ..config()
            },
            exec,
        );
        let handle = execution.handle();
        let join = tokio::spawn(execution.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.snapshot().current_iteration, 1);
        assert_eq!(handle.snapshot().status, LoopStatus::Running);
        handle.stop();

        let state = join.await.unwrap();
        assert_eq!(state.status, LoopStatus::Cancelled);
        assert_eq!(state.current_iteration, 1);
        assert_eq!(handle.snapshot().status, LoopStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_timeout_counts_as_failure() {
        let exec = Arc::new(
            Scripted::new(|_| Ok(IterationOutput::success("late")))
                .delayed(Duration::from_secs(30)),
        );
        let state = build(
            LoopConfig {
                iteration_timeout: Duration::from_secs(2),
                circuit_breaker_threshold: 2,
                ..config()
            },
            exec,
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::CircuitBreak);
        assert_eq!(state.error_log[0], "Iteration 1: timed out: iteration 1 after 2s");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_timeout_bounds_the_last_iteration() {
        let exec = Arc::new(
            Scripted::new(|_| Ok(IterationOutput::success("slow"))).delayed(Duration::from_secs(2)),
        );
        let state = build(
            LoopConfig {
                timeout: Duration::from_secs(5),
                cooldown: Duration::ZERO,
                ..config()
            },
            exec,
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::Timeout);
        assert_eq!(state.current_iteration, 3);
        assert!(!state.history[2].success);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_instead_of_failing() {
        let exec = Arc::new(Scripted::new(|_| Ok(IterationOutput::success("x"))));
        let start = Instant::now();
        let state = build(
            LoopConfig {
                max_iterations: 3,
                timeout: Duration::from_secs(3 * 3600),
                rate_limit_per_hour: 2,
                rate_limit_backoff: Duration::from_secs(600),
                cooldown: Duration::ZERO,
                ..config()
            },
            exec.clone(),
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::Failed);
        assert_eq!(state.current_iteration, 3);
        let calls = exec.calls.lock().unwrap();
        // Backoff repeats until the hour window rolls over.
        assert!(calls[2] - start >= RATE_WINDOW);
        assert!(calls[1] - start < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn last_allowed_call_fails_without_waiting_for_the_window() {
        let exec = Arc::new(Scripted::new(|_| Ok(IterationOutput::success("x"))));
        let start = Instant::now();
        let state = build(
            LoopConfig {
                max_iterations: 2,
                timeout: Duration::from_secs(600),
                rate_limit_per_hour: 2,
                cooldown: Duration::ZERO,
                ..config()
            },
            exec,
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::Failed);
        assert_eq!(state.current_iteration, 2);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_wait_is_bounded_by_the_loop_timeout() {
        let exec = Arc::new(Scripted::new(|_| Ok(IterationOutput::success("x"))));
        let start = Instant::now();
        let state = build(
            LoopConfig {
                timeout: Duration::from_secs(600),
                rate_limit_per_hour: 1,
                rate_limit_backoff: Duration::from_secs(3600),
                cooldown: Duration::ZERO,
                ..config()
            },
            exec,
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::Timeout);
        assert_eq!(state.current_iteration, 1);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(600) && waited < Duration::from_secs(601));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_backoff_still_waits_for_the_window() {
        let exec = Arc::new(Scripted::new(|_| Ok(IterationOutput::success("x"))));
        let start = Instant::now();
        let state = build(
            LoopConfig {
                max_iterations: 3,
                timeout: Duration::from_secs(3 * 3600),
                rate_limit_per_hour: 1,
                rate_limit_backoff: Duration::ZERO,
                cooldown: Duration::ZERO,
                ..config()
            },
            exec.clone(),
        )
        .run()
        .await;

        assert_eq!(state.status, LoopStatus::Failed);
        assert_eq!(state.current_iteration, 3);
        let calls = exec.calls.lock().unwrap();
        let second = calls[1] - start;
        assert!(second >= RATE_WINDOW && second < RATE_WINDOW + Duration::from_secs(1));
        assert!(calls[2] - start >= RATE_WINDOW * 2);
    }

    #[test]
    fn markers_match_case_insensitively() {
        let config = LoopConfig::default();
        assert_eq!(config.find_marker("...All_Tasks_Done..."), Some("ALL_TASKS_DONE"));
        assert_eq!(config.find_marker("still going"), None);
    }
}
