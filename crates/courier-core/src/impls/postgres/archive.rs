//! DeadLetterStore for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::info;

use super::queue::insert_item;
use super::{ARCHIVE_COLUMNS, ARCHIVE_TABLE, DeadLetterRow, PgStore, parse_id, table_for, to_i64};
use crate::domain::{
    DeadLetterFilter, DeadLetterReason, DeadLetterRecord, DeadLetterView, PartitionKey,
    ReasonCount, ReplayId, ReplayOutcome, ReplayRecord, ReplayRequest, StoreError, WorkItemId,
};
use crate::ports::{DeadLetterStore, ReplayError};

#[derive(Debug, FromRow)]
struct ViewRow {
    #[sqlx(flatten)]
    record: DeadLetterRow,
    replay_id: Option<String>,
}

#[derive(Debug, FromRow)]
struct ReplayRow {
    original_id: String,
    replay_id: String,
    candidate_id: Option<String>,
    recovery_id: Option<String>,
    new_id: String,
    replayed_at: DateTime<Utc>,
    replayed_by: String,
}

impl TryFrom<ReplayRow> for ReplayRecord {
    type Error = StoreError;

    fn try_from(row: ReplayRow) -> Result<Self, Self::Error> {
        Ok(ReplayRecord {
            original_id: parse_id(&row.original_id)?,
            replay_id: parse_id(&row.replay_id)?,
            candidate_id: row.candidate_id,
            recovery_id: row.recovery_id,
            new_id: parse_id(&row.new_id)?,
            replayed_at: row.replayed_at,
            replayed_by: row.replayed_by,
        })
    }
}

impl PgStore {
    async fn existing_replay_id(
        &self,
        original_id: WorkItemId,
    ) -> Result<Option<ReplayId>, StoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT replay_id FROM courier_replays WHERE original_id = $1")
                .bind(original_id.to_storage())
                .fetch_optional(&self.pool)
                .await?;
        raw.as_deref().map(parse_id).transpose()
    }
}

#[async_trait]
impl DeadLetterStore for PgStore {
    async fn get_dead_letter(
        &self,
        original_id: WorkItemId,
    ) -> Result<Option<DeadLetterRecord>, StoreError> {
        let row: Option<DeadLetterRow> = sqlx::query_as(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM {ARCHIVE_TABLE} \
             WHERE original_id = $1 ORDER BY archived_at DESC LIMIT 1"
        ))
        .bind(original_id.to_storage())
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeadLetterRecord::try_from).transpose()
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        limit: usize,
    ) -> Result<Vec<DeadLetterView>, StoreError> {
        let columns = ARCHIVE_COLUMNS
            .split(',')
            .map(|c| format!("d.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows: Vec<ViewRow> = sqlx::query_as(&format!(
            r"
            SELECT {columns}, r.replay_id
            FROM {ARCHIVE_TABLE} d
            LEFT JOIN courier_replays r ON r.original_id = d.original_id
            WHERE ($1::text IS NULL OR d.reason = $1)
              AND ($2::text IS NULL OR d.event_type = $2)
              AND ($3::text IS NULL OR d.stream_key = $3)
            ORDER BY d.archived_at DESC, d.dead_letter_id DESC
            LIMIT $4
            "
        ))
        .bind(filter.reason.map(DeadLetterReason::as_code))
        .bind(&filter.event_type)
        .bind(&filter.stream_key)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let replay_id = row.replay_id.as_deref().map(parse_id).transpose()?;
                Ok(DeadLetterView {
                    record: DeadLetterRecord::try_from(row.record)?,
                    already_replayed: replay_id.is_some(),
                    replay_id,
                })
            })
            .collect()
    }

    async fn top_reasons(&self, n: usize) -> Result<Vec<ReasonCount>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            r"
            SELECT reason, count(*) AS n
            FROM {ARCHIVE_TABLE}
            GROUP BY reason
            ORDER BY n DESC, reason ASC
            LIMIT $1
            "
        ))
        .bind(to_i64(n))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(code, count)| {
                let reason = DeadLetterReason::from_code(&code)
                    .ok_or_else(|| StoreError::Corrupt(format!("dead-letter reason {code}")))?;
                Ok(ReasonCount {
                    reason,
                    count: u64::try_from(count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn replay(
        &self,
        original_id: WorkItemId,
        request: ReplayRequest,
    ) -> Result<ReplayOutcome, ReplayError> {
        if let Some(replay_id) = self.existing_replay_id(original_id).await? {
            return Ok(ReplayOutcome {
                was_duplicate: true,
                replay_id,
            });
        }

        let record = self
            .get_dead_letter(original_id)
            .await?
            .ok_or(ReplayError::NotDeadLettered(original_id))?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let new_id = insert_item(&mut *tx, table_for(record.lane), &record.replay_item()).await?;
        let replay_id = ReplayId::generate();
        let inserted = sqlx::query(
            r"
            INSERT INTO courier_replays
                (original_id, replay_id, candidate_id, recovery_id, new_id, replayed_at, replayed_by)
            VALUES ($1, $2, $3, $4, $5, now(), $6)
            ON CONFLICT (original_id) DO NOTHING
            ",
        )
        .bind(original_id.to_storage())
        .bind(replay_id.to_storage())
        .bind(&request.candidate_id)
        .bind(&request.recovery_id)
        .bind(new_id.to_storage())
        .bind(&request.replayed_by)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        if inserted.rows_affected() == 0 {
            // A concurrent replay won; drop our re-enqueued row with the tx.
            tx.rollback().await.map_err(StoreError::from)?;
            let replay_id = self
                .existing_replay_id(original_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("replay of {original_id}")))?;
            return Ok(ReplayOutcome {
                was_duplicate: true,
                replay_id,
            });
        }

        tx.commit().await.map_err(StoreError::from)?;
        info!(
            original_id = %original_id,
            replay_id = %replay_id,
            new_id = %new_id,
            lane = record.lane.as_code(),
            replayed_by = %request.replayed_by,
            "dead letter replayed"
        );
        Ok(ReplayOutcome {
            was_duplicate: false,
            replay_id,
        })
    }

    async fn get_replay(
        &self,
        original_id: WorkItemId,
    ) -> Result<Option<ReplayRecord>, StoreError> {
        let row: Option<ReplayRow> = sqlx::query_as(
            r"
            SELECT original_id, replay_id, candidate_id, recovery_id, new_id, replayed_at, replayed_by
            FROM courier_replays WHERE original_id = $1
            ",
        )
        .bind(original_id.to_storage())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ReplayRecord::try_from).transpose()
    }

    async fn drop_partitions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PartitionKey>, StoreError> {
        let children: Vec<String> = sqlx::query_scalar(
            r"
            SELECT c.relname::text
            FROM pg_inherits i
            JOIN pg_class c ON c.oid = i.inhrelid
            JOIN pg_class p ON p.oid = i.inhparent
            WHERE p.relname = $1
            ",
        )
        .bind(ARCHIVE_TABLE)
        .fetch_all(&self.pool)
        .await?;

        let prefix = format!("{ARCHIVE_TABLE}_");
        let mut expired: Vec<PartitionKey> = children
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter_map(PartitionKey::parse_suffix)
            .filter(|key| key.is_entirely_before(cutoff))
            .collect();
        expired.sort();

        for key in &expired {
            sqlx::query(&format!("DROP TABLE IF EXISTS {prefix}{}", key.suffix()))
                .execute(&self.pool)
                .await?;
            self.forget_partition(*key).await;
        }
        Ok(expired)
    }
}
