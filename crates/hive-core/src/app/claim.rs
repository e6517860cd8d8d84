//! Claimer - タスクの排他取得と解放
//!
//! # フロー
//! 1. lease backend があれば lease を取る（Conflict ならスキップ、到達不能なら警告して続行）
//! 2. `TaskStore::claim_owner` で owner が空の場合だけ owner と note を書き込む（読み込みと書き込みは 1 操作）
//! 3. owner が既にあれば取った lease を返してスキップ
//!
//! 取得に成功すると `ClaimTicket` が返る。ticket は `finalize` で消費されるので、
//! 解放はちょうど 1 回だけ起きる。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::{ClaimOutcome, HiveError, Lease, TaskId, TaskPatch, TaskStatus};
use crate::ports::{Clock, LeaseBackend, SystemClock, TaskStore};

/// A held claim. Must be passed back to [`Claimer::finalize`] or handed off.
#[derive(Debug)]
#[must_use = "a claim ticket must be finalized or handed off"]
pub struct ClaimTicket {
    task_id: TaskId,
    owner: String,
    lease: Option<Lease>,
}

impl ClaimTicket {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Keep the claim in place for an external worker to pick up.
    pub fn hand_off(self) -> Option<Lease> {
        self.lease
    }
}

/// What finalizing does to the record besides releasing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Blocked { reason: String },
    ReleaseOnly,
}

#[derive(Clone)]
pub struct Claimer {
    store: Arc<dyn TaskStore>,
    leases: Option<Arc<dyn LeaseBackend>>,
    lease_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Claimer {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            leases: None,
            lease_ttl: Duration::from_secs(3600),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_leases(mut self, leases: Arc<dyn LeaseBackend>, ttl: Duration) -> Self {
        self.leases = Some(leases);
        self.lease_ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// `Err(HiveError::Conflict)` means someone else holds it; skip the task.
    pub async fn claim(&self, task_id: &TaskId, owner: &str) -> Result<ClaimTicket, HiveError> {
        let lease = match &self.leases {
            Some(leases) => self.claim_lease(leases.as_ref(), task_id, owner).await?,
            None => None,
        };

        let now = self.clock.now();
        let patch = TaskPatch::new()
            .owner(owner)
            .touched(now)
            .note(format!("{} claimed by {owner}", now.to_rfc3339()));
        match self.store.claim_owner(task_id, patch).await {
            Ok(None) => {}
            Ok(Some(current)) => {
                debug!(task_id = %task_id, current_owner = %current, "task already owned");
                self.release_lease(task_id, lease.as_ref()).await;
                return Err(HiveError::Conflict {
                    resource_id: task_id.to_string(),
                    current_holder: current,
                    expires_at: lease.as_ref().map(|l| l.expires_at).unwrap_or(now),
                });
            }
            Err(e) => {
                self.release_lease(task_id, lease.as_ref()).await;
                return Err(e);
            }
        }

        info!(task_id = %task_id, owner, leased = lease.is_some(), "task claimed");
        Ok(ClaimTicket {
            task_id: task_id.clone(),
            owner: owner.to_string(),
            lease,
        })
    }

    async fn claim_lease(
        &self,
        leases: &dyn LeaseBackend,
        task_id: &TaskId,
        owner: &str,
    ) -> Result<Option<Lease>, HiveError> {
        match leases.claim(task_id.as_str(), owner, self.lease_ttl).await {
            Ok(ClaimOutcome::Granted(lease)) => Ok(Some(lease)),
            Ok(ClaimOutcome::Conflict {
                current_holder,
                expires_at,
                ..
            }) => Err(HiveError::Conflict {
                resource_id: task_id.to_string(),
                current_holder,
                expires_at,
            }),
            Err(e) if e.is_unavailable() => {
                warn!(
                    task_id = %task_id,
                    error = %e,
                    "lease coordinator unavailable, falling back to owner field"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn release_lease(&self, task_id: &TaskId, lease: Option<&Lease>) {
        let (Some(leases), Some(lease)) = (&self.leases, lease) else {
            return;
        };
        match leases.release_lease(lease.lease_id).await {
            Ok(true) => debug!(task_id = %task_id, lease_id = %lease.lease_id, "lease released"),
            Ok(false) => warn!(
                task_id = %task_id,
                lease_id = %lease.lease_id,
                "lease already gone at release"
            ),
            Err(e) => warn!(task_id = %task_id, error = %e, "failed to release lease"),
        }
    }

    /// Release the claim and record the outcome on the task.
    pub async fn finalize(
        &self,
        ticket: ClaimTicket,
        resolution: Resolution,
        note: &str,
    ) -> Result<(), HiveError> {
        self.release_lease(&ticket.task_id, ticket.lease.as_ref()).await;

        let now = self.clock.now();
        let mut patch = TaskPatch::new()
            .clear_owner()
            .touched(now)
            .note(format!("{} {note}", now.to_rfc3339()));
        match &resolution {
            Resolution::Completed => patch = patch.status(TaskStatus::Completed),
            Resolution::Blocked { reason } => patch = patch.block(reason.clone()),
            Resolution::ReleaseOnly => {}
        }
        self.store.write(&ticket.task_id, patch).await?;
        info!(task_id = %ticket.task_id, ?resolution, "claim released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LeaseId, TaskRecord};
    use crate::impls::InMemoryTaskStore;
    use crate::lease::{LeaseSettings, LeaseStore};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl LeaseBackend for Unreachable {
        async fn claim(&self, _: &str, _: &str, _: Duration) -> Result<ClaimOutcome, HiveError> {
            Err(HiveError::CoordinatorUnavailable("connection refused".into()))
        }
        async fn release(&self, _: &str) -> Result<bool, HiveError> {
            Err(HiveError::CoordinatorUnavailable("connection refused".into()))
        }
        async fn release_lease(&self, _: LeaseId) -> Result<bool, HiveError> {
            Err(HiveError::CoordinatorUnavailable("connection refused".into()))
        }
    }

    fn store_with(records: Vec<TaskRecord>) -> Arc<InMemoryTaskStore> {
        Arc::new(InMemoryTaskStore::with_records(records))
    }

    #[tokio::test]
    async fn claim_writes_owner_and_finalize_clears_it() {
        let store = store_with(vec![TaskRecord::new("t1", TaskStatus::Active)]);
        let claimer = Claimer::new(store.clone());
        let id = TaskId::new("t1");

        let ticket = claimer.claim(&id, "hive:loop-1").await.unwrap();
        assert_eq!(
            store.read(&id).await.unwrap().owner.as_deref(),
            Some("hive:loop-1")
        );

        claimer
            .finalize(ticket, Resolution::Completed, "done")
            .await
            .unwrap();
        let record = store.read(&id).await.unwrap();
        assert!(record.owner.is_none());
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.notes.len(), 2);
    }

    #[tokio::test]
    async fn owned_record_is_skipped_and_lease_returned() {
        let store = store_with(vec![
            TaskRecord::new("t1", TaskStatus::Active).with_owner("someone"),
        ]);
        let leases = Arc::new(LeaseStore::new(LeaseSettings::default()));
        let claimer = Claimer::new(store).with_leases(leases.clone(), Duration::from_secs(60));

        let err = claimer.claim(&TaskId::new("t1"), "me").await.unwrap_err();
        let HiveError::Conflict { current_holder, .. } = err else {
            panic!("expected a conflict, got {err:?}");
        };
        assert_eq!(current_holder, "someone");
        assert!(leases.status("t1").await.is_none());
    }

    #[tokio::test]
    async fn lease_conflict_skips_without_touching_record() {
        let store = store_with(vec![TaskRecord::new("t1", TaskStatus::Active)]);
        let leases = Arc::new(LeaseStore::new(LeaseSettings::default()));
        leases.claim("t1", "other", None, false).await.unwrap();
        let claimer = Claimer::new(store.clone()).with_leases(leases, Duration::from_secs(60));

        let err = claimer.claim(&TaskId::new("t1"), "me").await.unwrap_err();
        assert!(matches!(err, HiveError::Conflict { .. }));
        assert!(store.read(&TaskId::new("t1")).await.unwrap().owner.is_none());
    }

    #[tokio::test]
    async fn unavailable_coordinator_falls_back_to_owner_field() {
        let store = store_with(vec![TaskRecord::new("t1", TaskStatus::Active)]);
        let claimer = Claimer::new(store.clone())
            .with_leases(Arc::new(Unreachable), Duration::from_secs(60));

        let ticket = claimer.claim(&TaskId::new("t1"), "me").await.unwrap();
        assert!(ticket.lease().is_none());
        claimer
            .finalize(
                ticket,
                Resolution::Blocked {
                    reason: "loop x ended with status: failed".into(),
                },
                "loop ended",
            )
            .await
            .unwrap();

        let record = store.read(&TaskId::new("t1")).await.unwrap();
        assert!(record.blocked);
        assert_eq!(
            record.blocking_reason.as_deref(),
            Some("loop x ended with status: failed")
        );
    }

    #[tokio::test]
    async fn concurrent_fallback_claims_have_one_winner() {
        let store = store_with(vec![TaskRecord::new("t1", TaskStatus::Active)]);
        let first = Claimer::new(store.clone())
            .with_leases(Arc::new(Unreachable), Duration::from_secs(60));
        let second = first.clone();
        let id = TaskId::new("t1");

        let (a, b) = tokio::join!(first.claim(&id, "hive:a"), second.claim(&id, "hive:b"));
        let (winner, loser) = match (a, b) {
            (Ok(ticket), Err(e)) | (Err(e), Ok(ticket)) => (ticket, e),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        let HiveError::Conflict { current_holder, .. } = loser else {
            panic!("expected a conflict, got {loser:?}");
        };
        assert_eq!(current_holder, winner.owner());
        assert_eq!(store.read(&id).await.unwrap().owner.as_deref(), Some(winner.owner()));
        assert_eq!(store.read(&id).await.unwrap().notes.len(), 1);
    }

    #[tokio::test]
    async fn finalize_releases_the_lease_once() {
        let store = store_with(vec![TaskRecord::new("t1", TaskStatus::Active)]);
        let leases = Arc::new(LeaseStore::new(LeaseSettings::default()));
        let claimer = Claimer::new(store).with_leases(leases.clone(), Duration::from_secs(60));

        let ticket = claimer.claim(&TaskId::new("t1"), "me").await.unwrap();
        assert_eq!(leases.status("t1").await.unwrap().holder, "me");
        claimer
            .finalize(ticket, Resolution::ReleaseOnly, "cancelled")
            .await
            .unwrap();
        assert!(leases.status("t1").await.is_none());
    }
}
