//! TaskStore port - タスクレコードの読み書き
//!
//! レコードの保存形式（JSON ファイル、外部トラッカーなど）は実装側の関心事。
//! core は一覧・単体読み込み・部分更新と、owner の排他取得だけを使う。

use async_trait::async_trait;

use crate::domain::{HiveError, TaskId, TaskPatch, TaskRecord};

/// TaskStore はタスクレコードの正本
///
/// # 設計原則
/// - core はレコードを削除しない
/// - `write` は部分更新（`TaskPatch` に含まれるフィールドだけを変える）
/// - 存在しない task_id は `HiveError::NotFound`
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<TaskRecord>, HiveError>;

    async fn read(&self, task_id: &TaskId) -> Result<TaskRecord, HiveError>;

    async fn write(&self, task_id: &TaskId, patch: TaskPatch) -> Result<(), HiveError>;

    /// Apply `patch` only if the record has no owner, as one atomic step.
    ///
    /// Returns `Ok(None)` when applied, or the current owner when the record is taken.
    async fn claim_owner(
        &self,
        task_id: &TaskId,
        patch: TaskPatch,
    ) -> Result<Option<String>, HiveError>;
}
