//! Domain model (IDs, work items, leases, dead letters, retry rules).
//!
//! ここは I/O を持たない純粋な型とルールだけを置きます。

pub mod dead_letter;
pub mod decision;
pub mod errors;
pub mod idempotency;
pub mod ids;
pub mod item;
pub mod lease;
pub mod retry;

pub use dead_letter::{
    DeadLetterFilter, DeadLetterReason, DeadLetterRecord, DeadLetterView, PartitionKey,
    ReasonCount, ReplayOutcome, ReplayRecord, ReplayRequest,
};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{CourierError, FailureKind, HandlerError, StoreError};
pub use idempotency::{IdempotencyCheck, IdempotencyEntry, IdempotencyStatus};
pub use ids::{DeadLetterId, ReplayId, WorkItemId, WorkerId};
pub use item::{IdempotencyToken, ItemState, Lane, NewWorkItem, WorkItem};
pub use lease::Lease;
pub use retry::{Backoff, RetryPolicy};
