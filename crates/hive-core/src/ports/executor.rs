//! IterationExecutor port - 1 イテレーション分の作業を実行する
//!
//! 実行体（エージェント、コマンド、コンテナ）は外部。ExecutionLoop は
//! timeout 付きでこの trait を呼び、future を drop することで打ち切る。

use async_trait::async_trait;

use crate::domain::{HiveError, LoopId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationRequest {
    pub loop_id: LoopId,
    pub task_id: TaskId,
    /// 1 始まり
    pub iteration: u32,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutput {
    pub success: bool,
    pub output: String,
}

impl IterationOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// `Err` は失敗イテレーションとして数えられ、circuit breaker に加算される。
#[async_trait]
pub trait IterationExecutor: Send + Sync {
    async fn execute(&self, request: IterationRequest) -> Result<IterationOutput, HiveError>;
}
