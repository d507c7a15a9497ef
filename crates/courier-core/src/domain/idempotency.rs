//! Idempotency entries consulted before every handler attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Complete,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Complete => "complete",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IdempotencyStatus::Pending),
            "complete" => Some(IdempotencyStatus::Complete),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub key: String,
    pub status: IdempotencyStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Classify this entry for a caller about to start an attempt.
    ///
    /// Failed and expired entries do not block a new attempt.
    pub fn check(&self, now: DateTime<Utc>) -> IdempotencyCheck {
        if self.is_expired(now) {
            return IdempotencyCheck::Fresh;
        }
        match self.status {
            IdempotencyStatus::Complete => IdempotencyCheck::Complete(self.result.clone()),
            IdempotencyStatus::Pending => IdempotencyCheck::InFlight,
            IdempotencyStatus::Failed => IdempotencyCheck::Fresh,
        }
    }
}

/// Answer of `IdempotencyStore::begin`.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyCheck {
    /// The caller now owns the key (entry is `pending`).
    Fresh,
    /// Another attempt holds the key and has not finished.
    InFlight,
    /// Already done; the recorded result is returned.
    Complete(Option<serde_json::Value>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(status: IdempotencyStatus, ttl_secs: i64) -> IdempotencyEntry {
        IdempotencyEntry {
            key: "k".into(),
            status,
            result: Some(serde_json::json!({"ok": true})),
            error: None,
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn check_maps_status() {
        let now = Utc::now();
        assert_eq!(
            entry(IdempotencyStatus::Complete, 60).check(now),
            IdempotencyCheck::Complete(Some(serde_json::json!({"ok": true})))
        );
        assert_eq!(
            entry(IdempotencyStatus::Pending, 60).check(now),
            IdempotencyCheck::InFlight
        );
        assert_eq!(
            entry(IdempotencyStatus::Failed, 60).check(now),
            IdempotencyCheck::Fresh
        );
    }

    #[test]
    fn expired_entries_are_fresh() {
        let now = Utc::now();
        assert_eq!(
            entry(IdempotencyStatus::Pending, -1).check(now),
            IdempotencyCheck::Fresh
        );
    }
}
