//! Domain identifiers (strongly-typed IDs).
//!
//! すべての ID は ULID ベースで、Phantom type により型を区別します。
//! - 時刻でソート可能（生成順序 = 辞書順）
//! - 分散生成可能（調整不要）
//!
//! Storage uses the bare ULID string; `Display` adds a readable prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait that supplies the display prefix of an id kind.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic id. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Fresh id from the current wall clock.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// The storage form (bare ULID, 26 chars).
    pub fn to_storage(&self) -> String {
        self.ulid.to_string()
    }

    /// Parse the storage form or the prefixed display form.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Item {}

impl IdMarker for Item {
    fn prefix() -> &'static str {
        "item-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeadLetter {}

impl IdMarker for DeadLetter {
    fn prefix() -> &'static str {
        "dlq-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Replay {}

impl IdMarker for Replay {
    fn prefix() -> &'static str {
        "replay-"
    }
}

/// Identifier of a work item (outbox row or queued job item).
pub type WorkItemId = Id<Item>;

/// Identifier assigned when an item is archived to the dead-letter store.
pub type DeadLetterId = Id<DeadLetter>;

/// Identifier of a replay of a dead-lettered item.
pub type ReplayId = Id<Replay>;

/// Identity of a worker / lease holder.
///
/// Always injected by the process entrypoint; nothing in the crate derives it
/// from process-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let item = WorkItemId::generate();
        let dlq = DeadLetterId::generate();
        let replay = ReplayId::generate();

        assert!(item.to_string().starts_with("item-"));
        assert!(dlq.to_string().starts_with("dlq-"));
        assert!(replay.to_string().starts_with("replay-"));
        // let _: WorkItemId = dlq; // <- does not compile
    }

    #[test]
    fn parse_accepts_storage_and_display_forms() {
        let id = WorkItemId::generate();
        assert_eq!(WorkItemId::parse(&id.to_storage()).unwrap(), id);
        assert_eq!(WorkItemId::parse(&id.to_string()).unwrap(), id);
        assert!(WorkItemId::parse("not-a-ulid").is_err());
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = WorkItemId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = WorkItemId::generate();
        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_bare_ulid() {
        let id = ReplayId::generate();
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{}\"", id.to_storage()));
        let back: ReplayId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<WorkItemId>(), size_of::<Ulid>());
    }
}
