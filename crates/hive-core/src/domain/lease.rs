//! Leases: exclusive, time-bounded ownership of a task id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::HiveError;
use super::ids::LeaseId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub resource_id: String,
    pub holder: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Expiry is inclusive: a lease is gone at exactly `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Result of a claim attempt. A conflict is an expected answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted(Lease),
    Conflict {
        current_holder: String,
        claimed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted(_))
    }

    /// Turn a conflict into `HiveError::Conflict` for callers using `?`.
    pub fn into_result(self, resource_id: &str) -> Result<Lease, HiveError> {
        match self {
            ClaimOutcome::Granted(lease) => Ok(lease),
            ClaimOutcome::Conflict {
                current_holder,
                expires_at,
                ..
            } => Err(HiveError::Conflict {
                resource_id: resource_id.to_string(),
                current_holder,
                expires_at,
            }),
        }
    }
}
