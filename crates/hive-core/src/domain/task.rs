//! Task records: the unit of work workers compete for.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::errors::HiveError;
use super::ids::TaskId;

/// Upper bound on unrecognised fields carried in `TaskRecord::extensions`.
pub const MAX_EXTENSION_FIELDS: usize = 64;

/// Lifecycle status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Pending,
    Blocked,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. `Ord` puts `Critical` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependency metadata declared on a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub blocked_by: BTreeSet<TaskId>,
    #[serde(default)]
    pub blocks: BTreeSet<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    #[serde(default)]
    pub related: BTreeSet<TaskId>,
}

/// A task record as read from the store.
///
/// The fields this crate depends on are typed; anything else the store
/// carries is kept verbatim in `extensions` (bounded by
/// [`MAX_EXTENSION_FIELDS`]) so records survive a read/write cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,

    /// `Some` means claimed, regardless of `status`.
    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_reason: Option<String>,

    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Dependencies,

    /// Unparsable values deserialize to `None` (sorted as newest).
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Append-only progress notes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,

    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<TaskId>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            owner: None,
            blocked: false,
            blocking_reason: None,
            priority: Priority::default(),
            tags: BTreeSet::new(),
            dependencies: Dependencies::default(),
            last_updated: None,
            notes: Vec::new(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_blocked_by<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies
            .blocked_by
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_blocks<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.blocks.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn explicitly_blocked(mut self, reason: impl Into<String>) -> Self {
        self.blocked = true;
        self.blocking_reason = Some(reason.into());
        self
    }

    pub fn is_claimed(&self) -> bool {
        self.owner.is_some()
    }

    /// Check structural constraints the rest of the crate relies on.
    pub fn validate(&self) -> Result<(), HiveError> {
        if self.task_id.is_empty() {
            return Err(HiveError::Validation("task_id must not be empty".into()));
        }
        if self.extensions.len() > MAX_EXTENSION_FIELDS {
            return Err(HiveError::Validation(format!(
                "task {} carries {} extension fields (max {MAX_EXTENSION_FIELDS})",
                self.task_id,
                self.extensions.len()
            )));
        }
        let deps = &self.dependencies;
        if let Some(empty) = deps
            .blocked_by
            .iter()
            .chain(deps.blocks.iter())
            .chain(deps.related.iter())
            .chain(deps.parent.iter())
            .find(|id| id.is_empty())
        {
            return Err(HiveError::Validation(format!(
                "task {} has an empty dependency id {empty:?}",
                self.task_id
            )));
        }
        Ok(())
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(owner) = patch.owner {
            self.owner = owner;
        }
        if let Some(blocked) = patch.blocked {
            self.blocked = blocked;
        }
        if let Some(reason) = patch.blocking_reason {
            self.blocking_reason = reason;
        }
        if let Some(at) = patch.last_updated {
            self.last_updated = Some(at);
        }
        if let Some(note) = patch.append_note {
            self.notes.push(note);
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        _ => None,
    })
}

/// Partial update for a task record.
///
/// Nested `Option`s distinguish "leave as is" (`None`) from "set to null"
/// (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub owner: Option<Option<String>>,
    pub blocked: Option<bool>,
    pub blocking_reason: Option<Option<String>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub append_note: Option<String>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(Some(owner.into()));
        self
    }

    pub fn clear_owner(mut self) -> Self {
        self.owner = Some(None);
        self
    }

    pub fn block(mut self, reason: impl Into<String>) -> Self {
        self.blocked = Some(true);
        self.blocking_reason = Some(Some(reason.into()));
        self
    }

    pub fn touched(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.append_note = Some(note.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn deserializes_minimal_record_with_defaults() {
        let record: TaskRecord =
            serde_json::from_str(r#"{"task_id": "a", "status": "active"}"#).unwrap();
        assert_eq!(record.task_id, TaskId::new("a"));
        assert_eq!(record.priority, Priority::Medium);
        assert!(!record.blocked);
        assert!(record.owner.is_none());
        assert!(record.dependencies.blocked_by.is_empty());
    }

    #[rstest]
    #[case::garbage(r#""not a date""#)]
    #[case::number("12345")]
    #[case::null("null")]
    fn unparsable_timestamps_become_none(#[case] raw: &str) {
        let json = format!(r#"{{"task_id": "a", "status": "active", "last_updated": {raw}}}"#);
        let record: TaskRecord = serde_json::from_str(&json).unwrap();
        assert!(record.last_updated.is_none());
    }

    #[test]
    fn parses_zulu_timestamp() {
        let record: TaskRecord = serde_json::from_str(
            r#"{"task_id": "a", "status": "active", "last_updated": "2024-01-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(
            record.last_updated,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = r#"{"task_id": "a", "status": "active", "target_repo": "x/y", "phase": 2}"#;
        let record: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.extensions.len(), 2);
        assert_eq!(record.extensions["target_repo"], "x/y");

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["phase"], 2);
    }

    #[test]
    fn validate_rejects_oversized_extension_map() {
        let mut record = TaskRecord::new("a", TaskStatus::Active);
        for i in 0..=MAX_EXTENSION_FIELDS {
            record
                .extensions
                .insert(format!("field_{i}"), serde_json::json!(i));
        }
        assert!(matches!(record.validate(), Err(HiveError::Validation(_))));
    }

    #[test]
    fn validate_rejects_empty_dependency_id() {
        let record = TaskRecord::new("a", TaskStatus::Active).with_blocked_by([""]);
        assert!(matches!(record.validate(), Err(HiveError::Validation(_))));
    }

    #[test]
    fn priority_orders_critical_first() {
        let mut prios = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        prios.sort();
        assert_eq!(
            prios,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn patch_distinguishes_clear_from_untouched() {
        let mut record = TaskRecord::new("a", TaskStatus::Active).with_owner("w1");

        record.apply(TaskPatch::new().status(TaskStatus::Completed));
        assert_eq!(record.owner.as_deref(), Some("w1"));

        record.apply(TaskPatch::new().clear_owner().note("released"));
        assert!(record.owner.is_none());
        assert_eq!(record.notes, vec!["released".to_string()]);
    }
}
