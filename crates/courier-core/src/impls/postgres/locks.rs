//! LockManager for PostgreSQL: one conditional upsert per call.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{PgStore, secs};
use crate::domain::{Lease, StoreError, WorkerId};
use crate::ports::LockManager;

#[async_trait]
impl LockManager for PgStore {
    async fn acquire(
        &self,
        name: &str,
        holder: &WorkerId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // Compare-and-swap on (holder, expiry): the conflict branch only
        // writes when the caller already holds the lease or it has expired.
        let row: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO courier_leases (name, holder_id, acquired_at, expires_at)
            VALUES ($1, $2, now(), now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
            SET holder_id = EXCLUDED.holder_id,
                acquired_at = CASE
                    WHEN courier_leases.holder_id = EXCLUDED.holder_id
                         AND courier_leases.expires_at > now()
                    THEN courier_leases.acquired_at
                    ELSE now()
                END,
                expires_at = EXCLUDED.expires_at
            WHERE courier_leases.holder_id = EXCLUDED.holder_id
               OR courier_leases.expires_at <= now()
            RETURNING name
            ",
        )
        .bind(name)
        .bind(holder.as_str())
        .bind(secs(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn extend(
        &self,
        name: &str,
        holder: &WorkerId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE courier_leases
            SET expires_at = now() + make_interval(secs => $3)
            WHERE name = $1 AND holder_id = $2 AND expires_at > now()
            ",
        )
        .bind(name)
        .bind(holder.as_str())
        .bind(secs(ttl))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, holder: &WorkerId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM courier_leases WHERE name = $1 AND holder_id = $2")
            .bind(name)
            .bind(holder.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn holder(&self, name: &str) -> Result<Option<Lease>, StoreError> {
        let row: Option<(String, String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r"
            SELECT name, holder_id, acquired_at, expires_at
            FROM courier_leases
            WHERE name = $1 AND expires_at > now()
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(name, holder_id, acquired_at, expires_at)| Lease {
            name,
            holder_id: WorkerId::new(holder_id),
            acquired_at,
            expires_at,
        }))
    }
}
