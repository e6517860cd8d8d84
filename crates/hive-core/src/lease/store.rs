//! In-process lease table.
//!
//! Design:
//! - One `tokio::sync::Mutex` guards the whole table; claim's check-then-set
//!   happens under it, so claims are linearizable per resource.
//! - Expiry is lazy: every access evicts an expired lease before answering.
//!   The reaper loop calls `sweep_expired` to bound memory between accesses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{ClaimOutcome, HiveError, Lease, LeaseId};
use crate::ports::{Clock, IdGenerator, LeaseBackend, SystemClock, UlidGenerator};

/// TTL bounds for claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    pub default_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl LeaseSettings {
    pub fn validate_ttl(&self, ttl: Duration) -> Result<Duration, HiveError> {
        if ttl < self.min_ttl || ttl > self.max_ttl {
            return Err(HiveError::Validation(format!(
                "ttl_seconds must be between {} and {}, got {}",
                self.min_ttl.as_secs(),
                self.max_ttl.as_secs(),
                ttl.as_secs_f64()
            )));
        }
        Ok(ttl)
    }

    /// Clamp into `[min_ttl, max_ttl]`. Used by `extend`.
    pub fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.min_ttl, self.max_ttl)
    }
}

/// Lease table state.
#[derive(Default)]
struct LeaseTable {
    /// Active lease per resource (single source of truth).
    by_resource: HashMap<String, Lease>,

    /// Lease id -> resource, for release by id.
    by_id: HashMap<LeaseId, String>,
}

impl LeaseTable {
    /// Drop the lease on `resource_id` if it has expired at `now`.
    fn evict_if_expired(&mut self, resource_id: &str, now: DateTime<Utc>) {
        let expired = self
            .by_resource
            .get(resource_id)
            .is_some_and(|lease| lease.is_expired(now));
        if expired {
            self.remove_resource(resource_id);
        }
    }

    fn remove_resource(&mut self, resource_id: &str) -> Option<Lease> {
        let lease = self.by_resource.remove(resource_id)?;
        self.by_id.remove(&lease.lease_id);
        Some(lease)
    }

    fn insert(&mut self, lease: Lease) {
        self.by_id.insert(lease.lease_id, lease.resource_id.clone());
        self.by_resource.insert(lease.resource_id.clone(), lease);
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .by_resource
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.resource_id.clone())
            .collect();
        for resource_id in &expired {
            self.remove_resource(resource_id);
        }
        expired.len()
    }
}

/// Shared handle to the lease table. Clones share the same table.
#[derive(Clone)]
pub struct LeaseStore {
    state: Arc<Mutex<LeaseTable>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    settings: LeaseSettings,
}

impl LeaseStore {
    pub fn new(settings: LeaseSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: LeaseSettings, clock: Arc<dyn Clock>) -> Self {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        Self {
            state: Arc::new(Mutex::new(LeaseTable::default())),
            clock,
            ids,
            settings,
        }
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Grant `resource_id` to `holder`, or report who holds it.
    ///
    /// `force` replaces an existing lease instead of conflicting.
    pub async fn claim(
        &self,
        resource_id: &str,
        holder: &str,
        ttl: Option<Duration>,
        force: bool,
    ) -> Result<ClaimOutcome, HiveError> {
        if resource_id.trim().is_empty() {
            return Err(HiveError::Validation("resource_id must not be empty".into()));
        }
        if holder.trim().is_empty() {
            return Err(HiveError::Validation("holder must not be empty".into()));
        }
        let ttl = self
            .settings
            .validate_ttl(ttl.unwrap_or(self.settings.default_ttl))?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| HiveError::Validation(format!("ttl out of range: {e}")))?;

        let mut table = self.state.lock().await;
        let now = self.clock.now();
        table.evict_if_expired(resource_id, now);

        if let Some(existing) = table.by_resource.get(resource_id) {
            if !force {
                debug!(
                    resource_id,
                    holder,
                    current_holder = %existing.holder,
                    "claim conflict"
                );
                return Ok(ClaimOutcome::Conflict {
                    current_holder: existing.holder.clone(),
                    claimed_at: existing.created_at,
                    expires_at: existing.expires_at,
                });
            }
            info!(
                resource_id,
                holder,
                previous_holder = %existing.holder,
                "forced claim replaces existing lease"
            );
            table.remove_resource(resource_id);
        }

        let lease = Lease {
            lease_id: self.ids.generate_lease_id(),
            resource_id: resource_id.to_string(),
            holder: holder.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };
        table.insert(lease.clone());
        info!(resource_id, holder, lease_id = %lease.lease_id, "lease granted");
        Ok(ClaimOutcome::Granted(lease))
    }

    /// Returns the released lease, if there was an active one.
    pub async fn release_resource(&self, resource_id: &str) -> Option<Lease> {
        let mut table = self.state.lock().await;
        table.evict_if_expired(resource_id, self.clock.now());
        let released = table.remove_resource(resource_id);
        if released.is_some() {
            info!(resource_id, "lease released");
        }
        released
    }

    pub async fn release_by_id(&self, lease_id: LeaseId) -> Option<Lease> {
        let mut table = self.state.lock().await;
        let resource_id = table.by_id.get(&lease_id)?.clone();
        table.evict_if_expired(&resource_id, self.clock.now());
        let released = table.remove_resource(&resource_id);
        if released.is_some() {
            info!(resource_id = %resource_id, lease_id = %lease_id, "lease released by id");
        }
        released
    }

    /// Push `expires_at` to now + ttl (clamped). `NotFound` if nothing active.
    pub async fn extend(
        &self,
        resource_id: &str,
        ttl: Option<Duration>,
    ) -> Result<Lease, HiveError> {
        let ttl = self
            .settings
            .clamp_ttl(ttl.unwrap_or(self.settings.default_ttl));
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| HiveError::Validation(format!("ttl out of range: {e}")))?;

        let mut table = self.state.lock().await;
        let now = self.clock.now();
        table.evict_if_expired(resource_id, now);
        let lease = table
            .by_resource
            .get_mut(resource_id)
            .ok_or_else(|| {
                HiveError::NotFound(format!("no active claim found for '{resource_id}'"))
            })?;
        lease.expires_at = now + ttl;
        debug!(resource_id, expires_at = %lease.expires_at, "lease extended");
        Ok(lease.clone())
    }

    pub async fn status(&self, resource_id: &str) -> Option<Lease> {
        let mut table = self.state.lock().await;
        table.evict_if_expired(resource_id, self.clock.now());
        table.by_resource.get(resource_id).cloned()
    }

    /// All active leases, ordered by resource id.
    pub async fn list(&self) -> Vec<Lease> {
        let mut table = self.state.lock().await;
        table.sweep(self.clock.now());
        let mut leases: Vec<Lease> = table.by_resource.values().cloned().collect();
        leases.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        leases
    }

    pub async fn active_count(&self) -> usize {
        let mut table = self.state.lock().await;
        table.sweep(self.clock.now());
        table.by_resource.len()
    }

    /// Evict every expired lease. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut table = self.state.lock().await;
        table.sweep(self.clock.now())
    }
}

#[async_trait]
impl LeaseBackend for LeaseStore {
    async fn claim(
        &self,
        resource_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, HiveError> {
        LeaseStore::claim(self, resource_id, holder, Some(ttl), false).await
    }

    async fn release(&self, resource_id: &str) -> Result<bool, HiveError> {
        Ok(self.release_resource(resource_id).await.is_some())
    }

    async fn release_lease(&self, lease_id: LeaseId) -> Result<bool, HiveError> {
        Ok(self.release_by_id(lease_id).await.is_some())
    }
}
