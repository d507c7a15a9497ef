//! WorkQueue for PostgreSQL.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use super::{ITEM_COLUMNS, ItemRow, PgStore, secs, to_i32, to_i64};
use crate::domain::{
    DeadLetterId, DeadLetterReason, NewWorkItem, StoreError, WorkItem, WorkItemId, WorkerId,
};
use crate::observability::QueueCounts;
use crate::ports::{FailOutcome, WorkQueue};

/// Dedup-aware insert usable on the pool or inside a producer transaction.
pub(crate) async fn insert_item<'e, E: PgExecutor<'e>>(
    executor: E,
    table: &str,
    item: &NewWorkItem,
) -> Result<WorkItemId, StoreError> {
    let id: String = sqlx::query_scalar(&format!(
        r"
        INSERT INTO {table}
            (id, aggregate_type, aggregate_id, event_type, payload, priority, dedup_key, max_retries, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
        ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL AND processed_at IS NULL
        DO UPDATE SET
            priority = GREATEST({table}.priority, EXCLUDED.priority),
            max_retries = EXCLUDED.max_retries
        RETURNING id
        "
    ))
    .bind(WorkItemId::generate().to_storage())
    .bind(&item.aggregate_type)
    .bind(&item.aggregate_id)
    .bind(&item.event_type)
    .bind(&item.payload)
    .bind(item.priority)
    .bind(&item.dedup_key)
    .bind(to_i32(item.max_retries))
    .fetch_one(executor)
    .await?;

    WorkItemId::parse(&id).map_err(|e| StoreError::Corrupt(format!("id {id}: {e}")))
}

fn sort_claimed(items: &mut [WorkItem]) {
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[async_trait]
impl WorkQueue for PgStore {
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, StoreError> {
        insert_item(&self.pool, self.items_table(), &item).await
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        batch_size: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            r"
            WITH claimable AS (
                SELECT id FROM {table}
                WHERE processed_at IS NULL
                  AND claimed_at IS NULL
                  AND (next_retry_at IS NULL OR next_retry_at <= now())
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} w
            SET claimed_at = now(), claimed_by = $1
            FROM claimable c
            WHERE w.id = c.id
            RETURNING {columns}
            ",
            table = self.items_table(),
            columns = prefixed("w", ITEM_COLUMNS),
        ))
        .bind(worker_id.as_str())
        .bind(to_i64(batch_size))
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(WorkItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        sort_claimed(&mut items);
        Ok(items)
    }

    async fn mark_processed(&self, id: WorkItemId) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            r"
            UPDATE {}
            SET processed_at = now(), error_message = NULL
            WHERE id = $1 AND processed_at IS NULL AND claimed_at IS NOT NULL
            ",
            self.items_table()
        ))
        .bind(id.to_storage())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        id: WorkItemId,
        error: String,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            r"
            UPDATE {table}
            SET retry_count = retry_count + 1,
                claimed_at = NULL,
                claimed_by = NULL,
                error_message = $2,
                next_retry_at = $3
            WHERE id = $1 AND processed_at IS NULL AND claimed_at IS NOT NULL
            RETURNING {ITEM_COLUMNS}
            ",
            table = self.items_table(),
        ))
        .bind(id.to_storage())
        .bind(&error)
        .bind(not_before)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(FailOutcome::NotClaimed);
        };
        let item = WorkItem::try_from(row)?;

        if item.retry_count > item.max_retries {
            let message = format!("retries exhausted after {} attempts: {error}", item.retry_count);
            let dead_letter_id = self
                .archive_in_tx(&mut tx, &item, DeadLetterReason::RetriesExhausted, message)
                .await?;
            tx.commit().await?;
            return Ok(FailOutcome::DeadLettered { dead_letter_id });
        }

        tx.commit().await?;
        Ok(FailOutcome::Requeued {
            retry_count: item.retry_count,
        })
    }

    async fn dead_letter(
        &self,
        id: WorkItemId,
        reason: DeadLetterReason,
        message: String,
    ) -> Result<Option<DeadLetterId>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            r"
            SELECT {ITEM_COLUMNS} FROM {table}
            WHERE id = $1 AND processed_at IS NULL AND claimed_at IS NOT NULL
            FOR UPDATE
            ",
            table = self.items_table(),
        ))
        .bind(id.to_storage())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let item = WorkItem::try_from(row)?;
        let dead_letter_id = self.archive_in_tx(&mut tx, &item, reason, message).await?;
        tx.commit().await?;
        Ok(Some(dead_letter_id))
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            r"
            UPDATE {}
            SET claimed_at = NULL, claimed_by = NULL, reclaim_count = reclaim_count + 1
            WHERE processed_at IS NULL
              AND claimed_at < now() - make_interval(secs => $1)
            ",
            self.items_table()
        ))
        .bind(secs(threshold))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn heartbeat(
        &self,
        ids: &[WorkItemId],
        worker_id: &WorkerId,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(|id| id.to_storage()).collect();
        let result = sqlx::query(&format!(
            r"
            UPDATE {}
            SET claimed_at = now()
            WHERE id = ANY($1) AND claimed_by = $2 AND processed_at IS NULL
            ",
            self.items_table()
        ))
        .bind(&ids)
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM {} WHERE id = $1",
            self.items_table()
        ))
        .bind(id.to_storage())
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkItem::try_from).transpose()
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let (pending, scheduled, claimed, processed): (i64, i64, i64, i64) = sqlx::query_as(&format!(
            r"
            SELECT
                count(*) FILTER (WHERE processed_at IS NULL AND claimed_at IS NULL
                                   AND (next_retry_at IS NULL OR next_retry_at <= now())),
                count(*) FILTER (WHERE processed_at IS NULL AND claimed_at IS NULL
                                   AND next_retry_at > now()),
                count(*) FILTER (WHERE processed_at IS NULL AND claimed_at IS NOT NULL),
                count(*) FILTER (WHERE processed_at IS NOT NULL)
            FROM {}
            ",
            self.items_table()
        ))
        .fetch_one(&self.pool)
        .await?;

        let n = |v: i64| u64::try_from(v).unwrap_or(0);
        Ok(QueueCounts {
            pending: n(pending),
            scheduled: n(scheduled),
            claimed: n(claimed),
            processed: n(processed),
        })
    }

    async fn purge_processed(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            r"
            DELETE FROM {table}
            WHERE id IN (
                SELECT id FROM {table}
                WHERE processed_at < now() - make_interval(secs => $1)
                ORDER BY processed_at
                LIMIT $2
            )
            ",
            table = self.items_table(),
        ))
        .bind(secs(older_than))
        .bind(to_i64(limit))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// `"a, b"` -> `"w.a, w.b"` for statements that join.
fn prefixed(alias: &str, columns: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::super::test_support::{fresh_store, new_item};
    use super::*;
    use crate::ports::DeadLetterStore;

    #[test]
    fn prefixed_qualifies_every_column() {
        assert_eq!(prefixed("w", "id, payload"), "w.id, w.payload");
    }

    #[tokio::test]
    #[ignore = "needs COURIER_TEST_DATABASE_URL"]
    async fn scenario_claim_complete_then_empty() {
        let store = fresh_store().await;
        let w1 = WorkerId::new("w1");
        let x = store.enqueue(new_item("1").with_dedup_key("k1")).await.unwrap();

        let claimed = store.claim(&w1, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, x);
        assert!(store.complete(x, true, None).await.unwrap());
        assert!(store.claim(&w1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "needs COURIER_TEST_DATABASE_URL"]
    async fn lanes_do_not_share_items() {
        let jobs = fresh_store().await;
        let outbox = jobs.outbox_lane();
        let w1 = WorkerId::new("w1");
        let id = outbox.enqueue(new_item("1")).await.unwrap();

        assert!(jobs.claim(&w1, 10).await.unwrap().is_empty());
        assert_eq!(outbox.claim(&w1, 10).await.unwrap()[0].id, id);
    }

    #[tokio::test]
    #[ignore = "needs COURIER_TEST_DATABASE_URL"]
    async fn scenario_exhaustion_archives_once() {
        let store = fresh_store().await;
        let w1 = WorkerId::new("w1");
        let y = store.enqueue(new_item("2").with_max_retries(2)).await.unwrap();
        for _ in 0..3 {
            assert_eq!(store.claim(&w1, 1).await.unwrap().len(), 1);
            assert!(store.complete(y, false, Some("boom".into())).await.unwrap());
        }
        assert!(store.claim(&w1, 1).await.unwrap().is_empty());
        let record = store.get_dead_letter(y).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 3);
        assert!(store.get(y).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "needs COURIER_TEST_DATABASE_URL"]
    async fn dedup_upsert_returns_existing_id() {
        let store = fresh_store().await;
        let a = store.enqueue(new_item("3").with_dedup_key("k")).await.unwrap();
        let b = store
            .enqueue(new_item("3").with_dedup_key("k").with_priority(4))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.get(a).await.unwrap().unwrap().priority, 4);
        assert_eq!(store.counts().await.unwrap().unprocessed(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs COURIER_TEST_DATABASE_URL"]
    async fn concurrent_claimers_get_disjoint_items() {
        let store = fresh_store().await;
        for n in 0..100 {
            store.enqueue(new_item(&n.to_string())).await.unwrap();
        }

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..6 {
            let store = store.clone();
            tasks.spawn(async move {
                let me = WorkerId::new(format!("w{worker}"));
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim(&me, 5).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|i| i.id));
                }
                mine
            });
        }
        let mut seen = HashSet::new();
        while let Some(ids) = tasks.join_next().await {
            for id in ids.unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    #[ignore = "needs COURIER_TEST_DATABASE_URL"]
    async fn stale_claim_is_released() {
        let store = fresh_store().await;
        let id = store.enqueue(new_item("4")).await.unwrap();
        store.claim(&WorkerId::new("crashed"), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert_eq!(store.reclaim_stale(Duration::from_secs(1)).await.unwrap(), 1);
        let again = store.claim(&WorkerId::new("w2"), 1).await.unwrap();
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].reclaim_count, 1);
    }
}
