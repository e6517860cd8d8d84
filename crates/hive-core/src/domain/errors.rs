//! Errors - エラー型と分類
//!
//! すべての失敗は `HiveError` に集約し、`ErrorKind` で運用上の分類を返す。
//! サイクルはエラーではなくデータ（`cycles` / `in_cycle`）として扱う。

use chrono::{DateTime, Utc};
use thiserror::Error;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（coordinator / store の障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("resource {resource_id} is held by {current_holder} until {expires_at}")]
    Conflict {
        resource_id: String,
        current_holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("circuit breaker open after {failures} consecutive failures")]
    CircuitBreak { failures: u32 },

    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("task store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::Conflict { .. } | HiveError::Execution(_) | HiveError::Timeout(_) => {
                ErrorKind::Transient
            }
            HiveError::NotFound(_)
            | HiveError::Validation(_)
            | HiveError::CircuitBreak { .. }
            | HiveError::Config(_) => ErrorKind::Permanent,
            HiveError::CoordinatorUnavailable(_) | HiveError::Store(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Whether the caller should degrade to the owner-field fallback.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, HiveError::CoordinatorUnavailable(_))
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(err: serde_json::Error) -> Self {
        HiveError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::conflict(
        HiveError::Conflict {
            resource_id: "t1".into(),
            current_holder: "w1".into(),
            expires_at: Utc::now(),
        },
        ErrorKind::Transient
    )]
    #[case::execution(HiveError::Execution("boom".into()), ErrorKind::Transient)]
    #[case::breaker(HiveError::CircuitBreak { failures: 3 }, ErrorKind::Permanent)]
    #[case::validation(HiveError::Validation("ttl".into()), ErrorKind::Permanent)]
    #[case::unavailable(
        HiveError::CoordinatorUnavailable("refused".into()),
        ErrorKind::Infrastructure
    )]
    #[case::store(HiveError::Store("eof".into()), ErrorKind::Infrastructure)]
    fn classifies_errors(#[case] err: HiveError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn only_unavailable_triggers_fallback() {
        assert!(HiveError::CoordinatorUnavailable("x".into()).is_unavailable());
        assert!(!HiveError::NotFound("x".into()).is_unavailable());
    }
}
