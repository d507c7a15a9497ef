//! Dead-letter archive and replay records.
//!
//! Archive rows are immutable once written. They are grouped by calendar
//! month (`PartitionKey`) so retention drops whole partitions.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{DeadLetterId, ReplayId, WorkItemId};
use super::item::{Lane, NewWorkItem, WorkItem};

/// Why an item was archived. Stored as a stable snake_case code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RetriesExhausted,
    PermanentFailure,
    #[serde(rename = "governance_block")]
    GovernanceBlocked,
    UnknownEventType,
}

impl DeadLetterReason {
    pub fn as_code(self) -> &'static str {
        match self {
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::PermanentFailure => "permanent_failure",
            DeadLetterReason::GovernanceBlocked => "governance_block",
            DeadLetterReason::UnknownEventType => "unknown_event_type",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "retries_exhausted" => Some(DeadLetterReason::RetriesExhausted),
            "permanent_failure" => Some(DeadLetterReason::PermanentFailure),
            "governance_block" => Some(DeadLetterReason::GovernanceBlocked),
            "unknown_event_type" => Some(DeadLetterReason::UnknownEventType),
            _ => None,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Calendar month an archive row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> DateTime<Utc> {
        month_start(self.year, self.month)
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Table-name suffix, e.g. `y2026m03`.
    pub fn suffix(&self) -> String {
        format!("y{:04}m{:02}", self.year, self.month)
    }

    pub fn parse_suffix(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('y')?;
        let (year, month) = rest.split_once('m')?;
        let key = Self {
            year: year.parse().ok()?,
            month: month.parse().ok()?,
        };
        (1..=12).contains(&key.month).then_some(key)
    }

    /// Every row of this partition is older than `cutoff`.
    pub fn is_entirely_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.end() <= cutoff
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN);
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Immutable archive row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_id: WorkItemId,
    pub dead_letter_id: DeadLetterId,
    /// Lane the item was archived from; a replay goes back there.
    #[serde(default)]
    pub lane: Lane,
    pub stream_key: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub reason: DeadLetterReason,
    pub failure_reason: String,
    pub retry_count: u32,
    /// Budget the item had; a replay re-enqueues with the same budget.
    pub max_retries: u32,
    pub reclaim_count: u32,
    pub archived_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Snapshot `item` at the moment of archival.
    pub fn archive(
        item: &WorkItem,
        lane: Lane,
        reason: DeadLetterReason,
        failure_reason: impl Into<String>,
        archived_at: DateTime<Utc>,
    ) -> Self {
        Self {
            original_id: item.id,
            dead_letter_id: DeadLetterId::generate(),
            lane,
            stream_key: item.stream_key(),
            aggregate_type: item.aggregate_type.clone(),
            aggregate_id: item.aggregate_id.clone(),
            event_type: item.event_type.clone(),
            payload: item.payload.clone(),
            reason,
            failure_reason: failure_reason.into(),
            retry_count: item.retry_count,
            max_retries: item.max_retries,
            reclaim_count: item.reclaim_count,
            archived_at,
        }
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::of(self.archived_at)
    }

    /// The work item a replay enqueues: same payload and routing, fresh budget.
    pub fn replay_item(&self) -> NewWorkItem {
        NewWorkItem::new(
            self.aggregate_type.clone(),
            self.aggregate_id.clone(),
            self.event_type.clone(),
            self.payload.clone(),
        )
        .with_max_retries(self.max_retries)
    }
}

/// Who asked for a replay, plus optional correlation ids.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub replayed_by: String,
    pub candidate_id: Option<String>,
    pub recovery_id: Option<String>,
}

impl ReplayRequest {
    pub fn by(operator: impl Into<String>) -> Self {
        Self {
            replayed_by: operator.into(),
            ..Self::default()
        }
    }
}

/// First replay of an `original_id` wins; the row is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub original_id: WorkItemId,
    pub replay_id: ReplayId,
    pub candidate_id: Option<String>,
    pub recovery_id: Option<String>,
    /// The work item re-enqueued by this replay.
    pub new_id: WorkItemId,
    pub replayed_at: DateTime<Utc>,
    pub replayed_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub was_duplicate: bool,
    pub replay_id: ReplayId,
}

/// Drill-down row for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterView {
    pub record: DeadLetterRecord,
    pub already_replayed: bool,
    pub replay_id: Option<ReplayId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCount {
    pub reason: DeadLetterReason,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub reason: Option<DeadLetterReason>,
    pub event_type: Option<String>,
    pub stream_key: Option<String>,
}

impl DeadLetterFilter {
    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.reason.is_none_or(|r| r == record.reason)
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| t == record.event_type)
            && self
                .stream_key
                .as_deref()
                .is_none_or(|k| k == record.stream_key)
    }
}
