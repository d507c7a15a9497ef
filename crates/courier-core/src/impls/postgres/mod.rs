//! PgStore - PostgreSQL 上の backing store
//!
//! # 設計原則
//! - claim / complete / lease の各操作は 1 つの SQL 文（または短い transaction）
//! - 時刻比較はすべて DB の `now()` を使う（worker 間の時計ずれに依存しない）
//! - claim は `FOR UPDATE SKIP LOCKED`: 並行 claimer は互いを待たない
//! - dead-letter は月単位の range partition。retention は partition ごと DROP する

mod archive;
mod idempotency;
mod locks;
mod outbox;
mod queue;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::StoreConfig;
use crate::domain::{
    DeadLetterId, DeadLetterReason, DeadLetterRecord, Lane, PartitionKey, StoreError, WorkItem,
    WorkerId,
};

/// Job lane, served by the worker runtime.
pub(crate) const WORK_TABLE: &str = "courier_work_items";
/// Outbox lane, served by the dispatcher.
pub(crate) const OUTBOX_TABLE: &str = "courier_outbox";
pub(crate) const ARCHIVE_TABLE: &str = "courier_dead_letters";

pub(crate) fn table_for(lane: Lane) -> &'static str {
    match lane {
        Lane::Jobs => WORK_TABLE,
        Lane::Outbox => OUTBOX_TABLE,
    }
}

/// Columns of the lane tables, in `ItemRow` order.
pub(crate) const ITEM_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, \
     priority, dedup_key, retry_count, max_retries, reclaim_count, created_at, claimed_at, \
     claimed_by, processed_at, next_retry_at, error_message";

/// Columns of `courier_dead_letters`, in `DeadLetterRow` order.
pub(crate) const ARCHIVE_COLUMNS: &str = "original_id, dead_letter_id, lane, stream_key, \
     aggregate_type, aggregate_id, event_type, payload, reason, failure_reason, retry_count, \
     max_retries, reclaim_count, archived_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Seconds as the `double precision` `make_interval` expects.
pub(crate) fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

pub(crate) fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

pub(crate) fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u32(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

fn parse_id<T: crate::domain::ids::IdMarker>(
    raw: &str,
) -> Result<crate::domain::ids::Id<T>, StoreError> {
    crate::domain::ids::Id::parse(raw).map_err(|e| StoreError::Corrupt(format!("id {raw}: {e}")))
}

#[derive(Debug, FromRow)]
pub(crate) struct ItemRow {
    id: String,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: Vec<u8>,
    priority: i32,
    dedup_key: Option<String>,
    retry_count: i32,
    max_retries: i32,
    reclaim_count: i32,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<ItemRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(WorkItem {
            id: parse_id(&row.id)?,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            priority: row.priority,
            dedup_key: row.dedup_key,
            retry_count: to_u32(row.retry_count),
            max_retries: to_u32(row.max_retries),
            reclaim_count: to_u32(row.reclaim_count),
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by.map(WorkerId::new),
            processed_at: row.processed_at,
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DeadLetterRow {
    original_id: String,
    dead_letter_id: String,
    lane: String,
    stream_key: String,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: Vec<u8>,
    reason: String,
    failure_reason: String,
    retry_count: i32,
    max_retries: i32,
    reclaim_count: i32,
    archived_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = StoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let reason = DeadLetterReason::from_code(&row.reason)
            .ok_or_else(|| StoreError::Corrupt(format!("dead-letter reason {}", row.reason)))?;
        let lane = Lane::from_code(&row.lane)
            .ok_or_else(|| StoreError::Corrupt(format!("dead-letter lane {}", row.lane)))?;
        Ok(DeadLetterRecord {
            original_id: parse_id(&row.original_id)?,
            dead_letter_id: parse_id(&row.dead_letter_id)?,
            lane,
            stream_key: row.stream_key,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            reason,
            failure_reason: row.failure_reason,
            retry_count: to_u32(row.retry_count),
            max_retries: to_u32(row.max_retries),
            reclaim_count: to_u32(row.reclaim_count),
            archived_at: row.archived_at,
        })
    }
}

/// Cloneable handle over a connection pool.
///
/// A handle serves one lane table. Leases, idempotency keys and the archive
/// are shared by every lane.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lane: Lane,
    /// Archive partitions known to exist.
    partitions: Arc<Mutex<HashSet<PartitionKey>>>,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig, url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lane: Lane::Jobs,
            partitions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Same pool, serving the outbox lane.
    pub fn outbox_lane(&self) -> Self {
        Self {
            lane: Lane::Outbox,
            ..self.clone()
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub(crate) fn items_table(&self) -> &'static str {
        table_for(self.lane)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the archive partition for `key` unless it is known to exist.
    ///
    /// Runs on its own connection so the DDL commits independently of the
    /// caller's transaction.
    pub(crate) async fn ensure_partition(&self, key: PartitionKey) -> Result<(), StoreError> {
        if self.partitions.lock().await.contains(&key) {
            return Ok(());
        }

        let table = format!("{ARCHIVE_TABLE}_{}", key.suffix());
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} PARTITION OF {ARCHIVE_TABLE} \
             FOR VALUES FROM ('{}') TO ('{}')",
            key.start().to_rfc3339(),
            key.end().to_rfc3339(),
        );
        if let Err(err) = sqlx::query(&ddl).execute(&self.pool).await {
            // A concurrent creator may have won the race.
            let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
                .bind(&table)
                .fetch_one(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(err.into());
            }
        }
        debug!(partition = %table, "archive partition ready");
        self.partitions.lock().await.insert(key);
        Ok(())
    }

    pub(crate) async fn forget_partition(&self, key: PartitionKey) {
        self.partitions.lock().await.remove(&key);
    }

    /// Delete the active row and write its archive row, inside `tx`.
    /// `item` must be the row as it is now.
    pub(crate) async fn archive_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        item: &WorkItem,
        reason: DeadLetterReason,
        message: String,
    ) -> Result<DeadLetterId, StoreError> {
        let archived_at: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut **tx)
            .await?;
        self.ensure_partition(PartitionKey::of(archived_at)).await?;

        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.items_table()))
            .bind(item.id.to_storage())
            .execute(&mut **tx)
            .await?;

        let record = DeadLetterRecord::archive(item, self.lane, reason, message, archived_at);
        sqlx::query(&format!(
            "INSERT INTO {ARCHIVE_TABLE} ({ARCHIVE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(record.original_id.to_storage())
        .bind(record.dead_letter_id.to_storage())
        .bind(record.lane.as_code())
        .bind(&record.stream_key)
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.reason.as_code())
        .bind(&record.failure_reason)
        .bind(to_i32(record.retry_count))
        .bind(to_i32(record.max_retries))
        .bind(to_i32(record.reclaim_count))
        .bind(record.archived_at)
        .execute(&mut **tx)
        .await?;

        Ok(record.dead_letter_id)
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}

/// Shared fixtures for the `#[ignore]`d database tests.
///
/// Run with `COURIER_TEST_DATABASE_URL=postgres://... cargo test -- --ignored --test-threads=1`.
#[cfg(test)]
pub(crate) mod test_support {
    use super::PgStore;
    use crate::domain::NewWorkItem;

    pub const DATABASE_URL_ENV: &str = "COURIER_TEST_DATABASE_URL";

    pub async fn fresh_store() -> PgStore {
        let url = std::env::var(DATABASE_URL_ENV).expect("COURIER_TEST_DATABASE_URL not set");
        let pool = sqlx::PgPool::connect(&url).await.unwrap();
        let store = PgStore::from_pool(pool);
        store.migrate().await.unwrap();
        sqlx::query(
            "TRUNCATE courier_work_items, courier_outbox, courier_leases, \
             courier_dead_letters, courier_replays, courier_idempotency",
        )
        .execute(store.pool())
        .await
        .unwrap();
        store
    }

    pub fn new_item(aggregate_id: &str) -> NewWorkItem {
        NewWorkItem::new("order", aggregate_id, "order.shipped.v1", br#"{"ok":true}"#.to_vec())
    }
}
