//! Domain identifiers.
//!
//! Two families live here:
//! - `TaskId`: externally assigned, stable string ids carried by task records.
//! - `Id<T>`: ULID-backed ids minted by this crate (leases), kept apart at
//!   compile time by a phantom marker type.
//!
//! `LoopId` is its own newtype because it is derived from creation time and
//! task identity rather than minted randomly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Identifier of a task record. Assigned outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Marker trait for ULID-backed ids. Provides the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID-backed id, rendered as `<prefix><ULID>` on the wire.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

// Manual impls: derive would require `T: Clone`/`T: Copy` on the marker.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when an id string has the wrong prefix or a bad ULID body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed id: {0}")]
pub struct ParseIdError(pub String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(T::prefix())
            .ok_or_else(|| ParseIdError(s.to_string()))?;
        let ulid = Ulid::from_string(body).map_err(|_| ParseIdError(s.to_string()))?;
        Ok(Self::from_ulid(ulid))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeaseMarker {}

impl IdMarker for LeaseMarker {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Identifier of one lease grant. Never reused across grants.
pub type LeaseId = Id<LeaseMarker>;

/// Identifier of an execution loop.
///
/// Format: `loop-<YYYYmmdd-HHMMSS>-<8 hex>`, where the hex suffix hashes the
/// nanosecond creation time together with the task id, so two loops started
/// in the same second for different tasks (or the same task) do not collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopId(String);

impl LoopId {
    pub fn derive(created_at: DateTime<Utc>, task_id: &TaskId) -> Self {
        let nanos = created_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| created_at.timestamp_micros().saturating_mul(1_000));
        let mut hasher = Sha256::new();
        hasher.update(nanos.to_be_bytes());
        hasher.update(b"-");
        hasher.update(task_id.as_str().as_bytes());
        let digest = hasher.finalize();
        let short: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
        Self(format!(
            "loop-{}-{short}",
            created_at.format("%Y%m%d-%H%M%S")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lease_id_round_trips_through_its_display_form() {
        let id = LeaseId::from_ulid(Ulid::new());
        let text = id.to_string();
        assert!(text.starts_with("lease-"));
        let parsed: LeaseId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn lease_id_rejects_foreign_prefix() {
        let ulid = Ulid::new();
        let err = format!("task-{ulid}").parse::<LeaseId>().unwrap_err();
        assert!(err.0.starts_with("task-"));
    }

    #[test]
    fn lease_id_serializes_as_plain_string() {
        let id = LeaseId::from_ulid(Ulid::new());
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }

    #[test]
    fn loop_ids_differ_per_task_and_per_instant() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::nanoseconds(1);
        let a = TaskId::new("alpha");
        let b = TaskId::new("beta");

        let id_a0 = LoopId::derive(t0, &a);
        assert!(id_a0.as_str().starts_with("loop-20240101-120000-"));
        assert_ne!(id_a0, LoopId::derive(t0, &b));
        assert_ne!(id_a0, LoopId::derive(t1, &a));
        assert_eq!(id_a0, LoopId::derive(t0, &a));
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<LeaseId>(), std::mem::size_of::<Ulid>());
    }
}
