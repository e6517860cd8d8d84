//! IdGenerator port - lease ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）。時刻部分は Clock から取る。

use crate::domain::LeaseId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は lease ごとに一意な ID を生成
pub trait IdGenerator: Send + Sync {
    fn generate_lease_id(&self) -> LeaseId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡すと timestamp 部分が固定され、ランダム部分だけが変わる。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_lease_id(&self) -> LeaseId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        LeaseId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
