//! Lease: a named, TTL-bounded ownership grant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder_id: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_held_by(&self, holder: &WorkerId) -> bool {
        &self.holder_id == holder
    }

    /// Can `holder` take (or re-take) this lease at `now`?
    pub fn admits(&self, holder: &WorkerId, now: DateTime<Utc>) -> bool {
        self.is_held_by(holder) || !self.is_live(now)
    }
}
