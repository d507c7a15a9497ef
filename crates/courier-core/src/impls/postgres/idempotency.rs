//! IdempotencyStore for PostgreSQL.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{PgStore, secs};
use crate::domain::{IdempotencyCheck, IdempotencyEntry, IdempotencyStatus, StoreError};
use crate::ports::IdempotencyStore;

#[derive(Debug, FromRow)]
struct EntryRow {
    key: String,
    status: String,
    result: Option<serde_json::Value>,
    error: Option<String>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for IdempotencyEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let status = IdempotencyStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("idempotency status {}", row.status)))?;
        Ok(IdempotencyEntry {
            key: row.key,
            status,
            result: row.result,
            error: row.error,
            expires_at: row.expires_at,
        })
    }
}

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn begin(
        &self,
        key: &str,
        in_flight_ttl: Duration,
    ) -> Result<IdempotencyCheck, StoreError> {
        let taken: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO courier_idempotency (key, status, result, error, expires_at)
            VALUES ($1, 'pending', NULL, NULL, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
            SET status = 'pending', result = NULL, error = NULL, expires_at = EXCLUDED.expires_at
            WHERE courier_idempotency.status = 'failed'
               OR courier_idempotency.expires_at <= now()
            RETURNING key
            ",
        )
        .bind(key)
        .bind(secs(in_flight_ttl))
        .fetch_optional(&self.pool)
        .await?;

        if taken.is_some() {
            return Ok(IdempotencyCheck::Fresh);
        }
        // A live pending or complete entry blocked the upsert.
        Ok(match self.get(key).await? {
            Some(entry) if entry.status == IdempotencyStatus::Complete => {
                IdempotencyCheck::Complete(entry.result)
            }
            _ => IdempotencyCheck::InFlight,
        })
    }

    async fn mark_complete(
        &self,
        key: &str,
        result: Option<serde_json::Value>,
        retain: Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO courier_idempotency (key, status, result, error, expires_at)
            VALUES ($1, 'complete', $2, NULL, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET status = 'complete', result = EXCLUDED.result, error = NULL,
                expires_at = EXCLUDED.expires_at
            ",
        )
        .bind(key)
        .bind(result)
        .bind(secs(retain))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO courier_idempotency (key, status, result, error, expires_at)
            VALUES ($1, 'failed', NULL, $2, now())
            ON CONFLICT (key) DO UPDATE
            SET status = 'failed', error = EXCLUDED.error
            ",
        )
        .bind(key)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyEntry>, StoreError> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT key, status, result, error, expires_at FROM courier_idempotency WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(IdempotencyEntry::try_from).transpose()
    }
}
