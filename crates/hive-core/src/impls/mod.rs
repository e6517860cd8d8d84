//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・組み込み用の正本
//! - **JsonFileTaskStore**: CLI が使う JSON ファイルの正本
//! - **CommandExecutor**: 外部コマンドで 1 イテレーションを実行する

pub mod command_executor;
pub mod inmem_store;
pub mod json_store;

pub use self::command_executor::CommandExecutor;
pub use self::inmem_store::InMemoryTaskStore;
pub use self::json_store::JsonFileTaskStore;
