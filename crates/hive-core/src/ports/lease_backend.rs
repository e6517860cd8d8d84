//! LeaseBackend port - 排他 lease の取得と解放
//!
//! # 実装
//! - **LeaseStore**: プロセス内のテーブル（coordinator 本体、テスト）
//! - **CoordinatorClient**: HTTP 経由でリモート coordinator に問い合わせる
//!
//! coordinator に到達できない場合は `HiveError::CoordinatorUnavailable` を返す。
//! 呼び出し側はこれを見て owner フィールドによる排他にフォールバックする。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ClaimOutcome, HiveError, LeaseId};

#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// 競合は `Ok(ClaimOutcome::Conflict)`。エラーではない。
    async fn claim(
        &self,
        resource_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, HiveError>;

    /// 解放できたら `true`。既に無い場合は `false`。
    async fn release(&self, resource_id: &str) -> Result<bool, HiveError>;

    async fn release_lease(&self, lease_id: LeaseId) -> Result<bool, HiveError>;
}
