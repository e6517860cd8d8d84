//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Claimer**: lease + owner フィールドによるタスクの排他取得
//! - **TaskScheduler**: 優先度順の 1 サイクル dispatch
//! - **ClaimDispatcher**: claim して外部ワーカーへ引き渡す Dispatch 実装
//! - **ExecutionLoop**: 1 タスクの反復実行（rate limit / circuit breaker / timeout）
//! - **ParallelOrchestrator**: 複数ループの並列実行と claim のライフサイクル管理
//! - **LeaseReaper**: 期限切れ lease の回収

pub mod claim;
pub mod dispatch;
pub mod execution_loop;
pub mod orchestrator;
pub mod reaper_loop;
pub mod scheduler;

// 主要な型を再エクスポート
pub use self::claim::{ClaimTicket, Claimer, Resolution};
pub use self::dispatch::ClaimDispatcher;
pub use self::execution_loop::{DEFAULT_COMPLETION_MARKERS, ExecutionLoop, LoopConfig, LoopHandle};
pub use self::orchestrator::{BatchReport, OrchestratorConfig, ParallelOrchestrator};
pub use self::reaper_loop::LeaseReaper;
pub use self::scheduler::{
    CycleSummary, Dispatch, SkippedTask, StopReason, TaskScheduler, schedule_order,
    sort_candidates,
};
