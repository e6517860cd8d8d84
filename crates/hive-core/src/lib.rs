//! hive-core
//!
//! Core building blocks for coordinating agents over a shared task list.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, lease, state, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, LeaseBackend, IterationExecutor, Clock, IdGenerator）
//! - **graph**: 依存グラフ（ready 判定、循環検出、blocking 情報）
//! - **lease**: lease テーブル、HTTP コーディネーター、クライアント
//! - **app**: アプリケーションロジック（claim, scheduler, execution_loop, orchestrator, reaper）
//! - **impls**: 実装（InMemoryTaskStore, JsonFileTaskStore, CommandExecutor）
//! - **config**: 設定（JSON ファイル + 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod lease;
pub mod ports;

pub use self::config::HiveConfig;
pub use self::domain::{ErrorKind, HiveError};
