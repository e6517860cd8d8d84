//! State - 実行ループの状態
//!
//! # 状態遷移
//! - pending → running → {completed, failed, cancelled, timeout, circuit_break}
//! - 終端状態からは遷移しない

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::HiveError;
use super::ids::{LoopId, TaskId};

/// `last_output` に保持するプレビューの最大文字数
pub const OUTPUT_PREVIEW_CHARS: usize = 500;

/// LoopStatus は ExecutionLoop の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    CircuitBreak,
}

impl LoopStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LoopStatus::Pending | LoopStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoopStatus::Pending => "pending",
            LoopStatus::Running => "running",
            LoopStatus::Completed => "completed",
            LoopStatus::Failed => "failed",
            LoopStatus::Cancelled => "cancelled",
            LoopStatus::Timeout => "timeout",
            LoopStatus::CircuitBreak => "circuit_break",
        }
    }
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1 イテレーション分の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_preview: String,
}

/// LoopState は 1 つの ExecutionLoop の観測可能な状態
///
/// 書き込むのは所有ループのみ。外部からは LoopHandle 経由のスナップショットで読む。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub loop_id: LoopId,
    pub task_id: TaskId,
    pub status: LoopStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub consecutive_failures: u32,
    pub calls_in_current_hour: u32,
    pub hour_window_start: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_output: Option<String>,
    pub error_log: Vec<String>,
    pub history: VecDeque<IterationRecord>,
    #[serde(skip)]
    history_limit: usize,
}

impl LoopState {
    pub fn new(
        loop_id: LoopId,
        task_id: TaskId,
        max_iterations: u32,
        history_limit: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            loop_id,
            task_id,
            status: LoopStatus::Pending,
            current_iteration: 0,
            max_iterations,
            consecutive_failures: 0,
            calls_in_current_hour: 0,
            hour_window_start: now,
            start_time: None,
            end_time: None,
            last_output: None,
            error_log: Vec::new(),
            history: VecDeque::with_capacity(history_limit.min(128)),
            history_limit: history_limit.max(1),
        }
    }

    /// 履歴に追加し、上限を超えた古いエントリを捨てる
    pub fn push_history(&mut self, record: IterationRecord) {
        let limit = self.history_limit.max(1);
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn set_last_output(&mut self, output: &str) {
        self.last_output = Some(preview(output));
    }

    /// 終端状態へ遷移する。既に終端なら何もしない。
    pub fn finish(&mut self, status: LoopStatus, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.end_time = Some(now);
    }

    /// 完了しなかった終端状態を HiveError で表す。それ以外は None
    pub fn error(&self) -> Option<HiveError> {
        match self.status {
            LoopStatus::Failed => Some(HiveError::Execution(
                self.error_log
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "loop failed".to_string()),
            )),
            LoopStatus::CircuitBreak => Some(HiveError::CircuitBreak {
                failures: self.consecutive_failures,
            }),
            LoopStatus::Timeout => Some(HiveError::Timeout(format!(
                "loop {} after {} iteration(s)",
                self.loop_id, self.current_iteration
            ))),
            _ => None,
        }
    }
}

/// 先頭 `OUTPUT_PREVIEW_CHARS` 文字に切り詰める（char 境界を守る）
pub fn preview(text: &str) -> String {
    match text.char_indices().nth(OUTPUT_PREVIEW_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
