//! ClaimDispatcher - scheduler から渡されたタスクを claim して外部ワーカーに引き渡す
//!
//! claim した ticket は `hand_off` され、owner と lease はそのまま残る。
//! 解放は引き継いだワーカー（あるいは lease の期限切れ）が行う。

use async_trait::async_trait;
use tracing::info;

use crate::app::claim::Claimer;
use crate::app::scheduler::Dispatch;
use crate::domain::{HiveError, TaskRecord};

pub struct ClaimDispatcher {
    claimer: Claimer,
    agent: String,
    dry_run: bool,
}

impl ClaimDispatcher {
    pub fn new(claimer: Claimer, agent: impl Into<String>) -> Self {
        Self {
            claimer,
            agent: agent.into(),
            dry_run: false,
        }
    }

    /// Select and report without claiming anything.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
impl Dispatch for ClaimDispatcher {
    async fn dispatch(&self, record: &TaskRecord) -> Result<(), HiveError> {
        if self.dry_run {
            info!(task_id = %record.task_id, agent = %self.agent, "dry run: would claim");
            return Ok(());
        }
        let ticket = self.claimer.claim(&record.task_id, &self.agent).await?;
        let lease = ticket.hand_off();
        info!(
            task_id = %record.task_id,
            agent = %self.agent,
            lease_id = ?lease.map(|l| l.lease_id.to_string()),
            "task handed off"
        );
        Ok(())
    }
}
