//! WorkerRuntime - 実行ループ
//!
//! # フロー（item ごと）
//! 1. GovernanceGate::check() - deny なら即 dead-letter（governance_block）
//! 2. HandlerRegistry から handler を解決 - 未登録なら UnknownTypePolicy
//! 3. IdempotencyStore::begin() - complete 済みなら skip、in-flight なら claim を放置
//! 4. Handler 実行（別タスク + timeout。panic も transient として捕捉）
//! 5. 成功: idempotency complete → mark_processed
//! 6. 失敗: Decider → fail（backoff 付き）または dead_letter
//!
//! # ループ
//! - claim は空きスロット数までの batch、空なら poll 間隔だけ sleep
//! - store エラーは backoff してから poll cycle ごとやり直す
//! - in-flight の claim は heartbeat で延長する
//! - cancel 後は claim を止め、grace period だけ待ってから残りを abort する
//!   （abort された item は stale reclaim で戻る）

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::leadership::LeaseKeeper;
use crate::config::{IdempotencyConfig, WorkerConfig};
use crate::domain::{
    DeadLetterReason, Decider, Decision, HandlerError, IdempotencyCheck, StoreError, WorkItem,
    WorkItemId, WorkerId,
};
use crate::ports::{
    Clock, FailOutcome, GateDecision, GovernanceGate, IdempotencyStore, LockManager, WorkQueue,
    to_chrono,
};
use crate::typed::{HandlerContext, HandlerRegistry, UnknownTypePolicy};

/// What happened to one claimed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDisposition {
    Processed,
    /// Already applied under the same idempotency key; marked processed
    /// without running the handler.
    Duplicate,
    /// Another attempt holds the idempotency key. The claim is left to go
    /// stale and be reclaimed.
    InFlightElsewhere,
    Retried { retry_count: u32 },
    DeadLettered { reason: DeadLetterReason },
    /// Unknown event type under `UnknownTypePolicy::Discard`.
    Discarded,
    /// The claim was gone by the time the result was recorded.
    ClaimLost,
}

/// Totals of one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    pub skipped: u64,
    pub store_errors: u64,
    /// Items still running when the grace period ran out.
    pub abandoned: u64,
}

impl WorkerReport {
    fn record(&mut self, result: &Result<ItemDisposition, StoreError>) {
        match result {
            Ok(ItemDisposition::Processed) => self.processed += 1,
            Ok(ItemDisposition::Duplicate) => self.duplicates += 1,
            Ok(ItemDisposition::Retried { .. }) => self.retried += 1,
            Ok(ItemDisposition::DeadLettered { .. }) => self.dead_lettered += 1,
            Ok(ItemDisposition::Discarded) => self.discarded += 1,
            Ok(ItemDisposition::InFlightElsewhere | ItemDisposition::ClaimLost) => {
                self.skipped += 1
            }
            Err(_) => self.store_errors += 1,
        }
    }
}

/// Built by `WorkerBuilder`.
pub struct WorkerRuntime {
    pub(crate) worker_id: WorkerId,
    pub(crate) queue: Arc<dyn WorkQueue>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) idempotency: Arc<dyn IdempotencyStore>,
    pub(crate) gate: Arc<dyn GovernanceGate>,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: WorkerConfig,
    pub(crate) idempotency_config: IdempotencyConfig,
}

impl WorkerRuntime {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Drive one claimed item to its next state.
    ///
    /// Handler faults never surface as `Err`; only store failures do.
    pub async fn process_item(&self, item: WorkItem) -> Result<ItemDisposition, StoreError> {
        match self.gate.check(&item).await {
            Ok(GateDecision::Allow) => {}
            Ok(GateDecision::Deny { reason }) => {
                warn!(item_id = %item.id, event_type = %item.event_type, %reason, "governance gate denied item");
                return self
                    .archive(&item, DeadLetterReason::GovernanceBlocked, reason)
                    .await;
            }
            Err(err) => {
                // Fail closed: the handler does not run without an answer.
                let fault = HandlerError::transient(err.to_string());
                return self.release_for_retry(&item, &fault).await;
            }
        }

        let Some(handler) = self.registry.get(&item.event_type) else {
            return self.unknown_type(&item).await;
        };

        let token = item.idempotency_token();
        match self
            .idempotency
            .begin(token.as_str(), self.idempotency_config.in_flight_ttl())
            .await?
        {
            IdempotencyCheck::Fresh => {}
            IdempotencyCheck::Complete(_) => {
                debug!(item_id = %item.id, "already applied, suppressing duplicate");
                return Ok(if self.queue.mark_processed(item.id).await? {
                    ItemDisposition::Duplicate
                } else {
                    ItemDisposition::ClaimLost
                });
            }
            IdempotencyCheck::InFlight => {
                warn!(item_id = %item.id, "attempt in flight elsewhere, leaving claim to expire");
                return Ok(ItemDisposition::InFlightElsewhere);
            }
        }

        let ctx = HandlerContext::for_item(&item, &self.worker_id);
        let payload = item.payload.clone();
        let mut task = AbortOnDropHandle::new(tokio::spawn(async move {
            handler.handle_dyn(&payload, &ctx).await
        }));

        let outcome = match tokio::time::timeout(self.config.handler_timeout(), &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(HandlerError::transient("handler panicked"))
            }
            Ok(Err(join_err)) => Err(HandlerError::transient(format!("handler task: {join_err}"))),
            Err(_elapsed) => {
                task.abort();
                Err(HandlerError::transient(format!(
                    "handler timed out after {:?}",
                    self.config.handler_timeout()
                )))
            }
        };

        match outcome {
            Ok(output) => {
                self.idempotency
                    .mark_complete(
                        token.as_str(),
                        output,
                        self.idempotency_config.complete_retain(),
                    )
                    .await?;
                if self.queue.mark_processed(item.id).await? {
                    debug!(item_id = %item.id, event_type = %item.event_type, "processed");
                    Ok(ItemDisposition::Processed)
                } else {
                    Ok(ItemDisposition::ClaimLost)
                }
            }
            Err(fault) => {
                self.idempotency
                    .mark_failed(token.as_str(), &fault.message)
                    .await?;
                match self.decider.decide(&item, &fault) {
                    Decision::Retry { delay, reason } => {
                        warn!(item_id = %item.id, retry_count = item.retry_count, %reason, "handler failed");
                        self.fail_after(&item, fault.message, delay).await
                    }
                    Decision::DeadLetter { reason, message } => {
                        self.archive(&item, reason, message).await
                    }
                }
            }
        }
    }

    async fn unknown_type(&self, item: &WorkItem) -> Result<ItemDisposition, StoreError> {
        match self.config.unknown_type_policy {
            UnknownTypePolicy::DeadLetter => {
                let message = format!("no handler registered for {}", item.event_type);
                self.archive(item, DeadLetterReason::UnknownEventType, message)
                    .await
            }
            UnknownTypePolicy::Discard => {
                warn!(item_id = %item.id, event_type = %item.event_type, "discarding item with no handler");
                Ok(if self.queue.mark_processed(item.id).await? {
                    ItemDisposition::Discarded
                } else {
                    ItemDisposition::ClaimLost
                })
            }
        }
    }

    async fn release_for_retry(
        &self,
        item: &WorkItem,
        fault: &HandlerError,
    ) -> Result<ItemDisposition, StoreError> {
        match self.decider.decide(item, fault) {
            Decision::Retry { delay, reason } => {
                warn!(item_id = %item.id, %reason, "releasing item for retry");
                self.fail_after(item, fault.message.clone(), delay).await
            }
            Decision::DeadLetter { reason, message } => self.archive(item, reason, message).await,
        }
    }

    async fn fail_after(
        &self,
        item: &WorkItem,
        error: String,
        delay: Duration,
    ) -> Result<ItemDisposition, StoreError> {
        let not_before = self.clock.now() + to_chrono(delay);
        Ok(match self.queue.fail(item.id, error, Some(not_before)).await? {
            FailOutcome::Requeued { retry_count } => ItemDisposition::Retried { retry_count },
            FailOutcome::DeadLettered { dead_letter_id } => {
                error!(item_id = %item.id, %dead_letter_id, "retries exhausted, dead-lettered");
                ItemDisposition::DeadLettered {
                    reason: DeadLetterReason::RetriesExhausted,
                }
            }
            FailOutcome::NotClaimed => ItemDisposition::ClaimLost,
        })
    }

    async fn archive(
        &self,
        item: &WorkItem,
        reason: DeadLetterReason,
        message: String,
    ) -> Result<ItemDisposition, StoreError> {
        match self.queue.dead_letter(item.id, reason, message).await? {
            Some(dead_letter_id) => {
                error!(item_id = %item.id, event_type = %item.event_type, %reason, %dead_letter_id, "dead-lettered");
                Ok(ItemDisposition::DeadLettered { reason })
            }
            None => Ok(ItemDisposition::ClaimLost),
        }
    }

    /// Poll, process and heartbeat until `cancel` fires, then drain.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> WorkerReport {
        let mut report = WorkerReport::default();
        let slots = Arc::new(Semaphore::new(self.config.pool_size));
        let in_flight: Arc<Mutex<HashSet<WorkItemId>>> = Arc::default();
        let mut tasks: JoinSet<Result<ItemDisposition, StoreError>> = JoinSet::new();
        let mut leader: Option<LeaseKeeper> = None;

        // Heartbeats continue through the drain.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            self.worker_id.clone(),
            in_flight.clone(),
            self.config.heartbeat_every(),
            heartbeat_stop.clone(),
        ));

        info!(worker_id = %self.worker_id, pool_size = self.config.pool_size, "worker started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                record_joined(&mut report, joined);
            }
            if cancel.is_cancelled() {
                break;
            }

            if let Some(lease) = self.config.leader_lease.as_deref() {
                if leader.as_ref().is_some_and(|k| !k.is_held()) {
                    leader = None;
                }
                if leader.is_none() {
                    match LeaseKeeper::acquire(
                        self.locks.clone(),
                        self.clock.clone(),
                        lease,
                        self.worker_id.clone(),
                        self.config.lease_ttl(),
                        self.config.lease_extend_every(),
                    )
                    .await
                    {
                        Ok(Some(keeper)) => leader = Some(keeper),
                        Ok(None) => {
                            pause(&cancel, self.config.poll_interval()).await;
                            continue;
                        }
                        Err(err) => {
                            report.store_errors += 1;
                            error!(worker_id = %self.worker_id, error = %err, "leadership check failed");
                            pause(&cancel, self.config.store_backoff()).await;
                            continue;
                        }
                    }
                }
            }

            let free = slots.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(joined) = tasks.join_next() => record_joined(&mut report, joined),
                }
                continue;
            }

            let batch = free.min(self.config.batch_size);
            let claimed = match tokio::time::timeout(
                self.config.claim_timeout(),
                self.queue.claim(&self.worker_id, batch),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable("claim timed out".to_string())),
            };

            let items = match claimed {
                Ok(items) => items,
                Err(err) => {
                    report.store_errors += 1;
                    error!(worker_id = %self.worker_id, error = %err, unavailable = err.is_unavailable(), "claim failed, backing off");
                    pause(&cancel, self.config.store_backoff()).await;
                    continue;
                }
            };

            if items.is_empty() {
                debug!(worker_id = %self.worker_id, "queue empty");
                pause(&cancel, self.config.poll_interval()).await;
                continue;
            }

            report.claimed += items.len() as u64;
            for item in items {
                let Ok(permit) = slots.clone().try_acquire_owned() else {
                    break;
                };
                let runtime = self.clone();
                let in_flight = in_flight.clone();
                lock(&in_flight).insert(item.id);
                tasks.spawn(async move {
                    let id = item.id;
                    let result = runtime.process_item(item).await;
                    if let Err(err) = &result {
                        error!(item_id = %id, error = %err, "store failed while recording result");
                    }
                    lock(&in_flight).remove(&id);
                    drop(permit);
                    result
                });
            }
        }

        info!(worker_id = %self.worker_id, in_flight = tasks.len(), "worker stopping, draining");
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                record_joined(&mut report, joined);
            }
        })
        .await;
        if drained.is_err() {
            report.abandoned = tasks.len() as u64;
            warn!(worker_id = %self.worker_id, abandoned = report.abandoned, "grace period over, aborting in-flight items");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        if let Some(keeper) = leader
            && let Err(err) = keeper.release().await
        {
            warn!(worker_id = %self.worker_id, error = %err, "lease release failed");
        }

        info!(worker_id = %self.worker_id, ?report, "worker stopped");
        report
    }
}

fn record_joined(
    report: &mut WorkerReport,
    joined: Result<Result<ItemDisposition, StoreError>, tokio::task::JoinError>,
) {
    match joined {
        Ok(result) => report.record(&result),
        Err(err) if err.is_cancelled() => {}
        Err(err) => error!(error = %err, "item task failed"),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Sleep that wakes early on cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, d: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(d) => {}
    }
}

async fn heartbeat_loop(
    queue: Arc<dyn WorkQueue>,
    worker_id: WorkerId,
    in_flight: Arc<Mutex<HashSet<WorkItemId>>>,
    every: Duration,
    stop: CancellationToken,
) {
    loop {
        pause(&stop, every).await;
        if stop.is_cancelled() {
            return;
        }
        let ids: Vec<WorkItemId> = lock(&in_flight).iter().copied().collect();
        if ids.is_empty() {
            continue;
        }
        match queue.heartbeat(&ids, &worker_id).await {
            Ok(n) => debug!(worker_id = %worker_id, refreshed = n, "heartbeat"),
            Err(err) => warn!(worker_id = %worker_id, error = %err, "heartbeat failed"),
        }
    }
}
