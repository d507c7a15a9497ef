//! Outbox appends inside a producer's `sqlx` transaction.
//!
//! Rows land in the outbox lane (`PgStore::outbox_lane`).

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::OUTBOX_TABLE;
use super::queue::insert_item;
use crate::domain::{NewWorkItem, StoreError, WorkItemId};
use crate::ports::OutboxTransaction;

#[async_trait]
impl<'c> OutboxTransaction for Transaction<'c, Postgres> {
    async fn append(&mut self, item: NewWorkItem) -> Result<WorkItemId, StoreError> {
        insert_item(&mut **self, OUTBOX_TABLE, &item).await
    }
}
