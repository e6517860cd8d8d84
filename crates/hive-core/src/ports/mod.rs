//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。core のロジックはここにある trait
//! だけに依存し、store / coordinator / 実行体の実装は差し替え可能にしておく。

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod lease_backend;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{IterationExecutor, IterationOutput, IterationRequest};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lease_backend::LeaseBackend;
pub use self::task_store::TaskStore;
