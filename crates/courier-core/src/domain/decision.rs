//! Decision model: what to do with an item after a failed attempt.
//!
//! The Decider is a pure function of (item, error). Executing the decision
//! (releasing the claim, archiving) is the runtime's job.

use std::sync::Arc;
use std::time::Duration;

use super::dead_letter::DeadLetterReason;
use super::errors::{FailureKind, HandlerError};
use super::item::WorkItem;
use super::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Release the claim; the item becomes claimable after `delay`.
    /// The store archives it instead if the retry budget is spent.
    Retry { delay: Duration, reason: String },

    /// Archive now without consuming retry budget.
    DeadLetter {
        reason: DeadLetterReason,
        message: String,
    },
}

pub trait Decider: Send + Sync {
    fn decide(&self, item: &WorkItem, error: &HandlerError) -> Decision;
}

/// Transient faults back off per `RetryPolicy`; everything else is terminal.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    backoff: Arc<Backoff>,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            backoff: Arc::new(Backoff::new(retry_policy)),
        }
    }

    pub fn default_v1() -> Self {
        Self::new(RetryPolicy::default_v1())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, item: &WorkItem, error: &HandlerError) -> Decision {
        match error.kind {
            FailureKind::Transient => {
                let next = item.retry_count + 1;
                let delay = self.backoff.next_delay(next);
                Decision::Retry {
                    delay,
                    reason: format!(
                        "retry {}/{} after {:?}: {}",
                        next, item.max_retries, delay, error.message
                    ),
                }
            }
            FailureKind::Permanent => Decision::DeadLetter {
                reason: DeadLetterReason::PermanentFailure,
                message: error.message.clone(),
            },
            FailureKind::GovernanceBlocked => Decision::DeadLetter {
                reason: DeadLetterReason::GovernanceBlocked,
                message: error.message.clone(),
            },
        }
    }
}
