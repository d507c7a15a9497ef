//! Outbox - producer 側の追加と dispatcher
//!
//! # プロトコル
//! 1. producer は自分の状態変更と同じ transaction の中で `Outbox::append` する
//!    （transaction の外で append すると at-least-once が崩れる）
//! 2. `OutboxDispatcher` は outbox lane から batch を claim する
//! 3. event_type ごとの DeliveryStrategy で配送（idempotency token 付き）
//! 4. 成功 → processed / transient → backoff 付きで fail / permanent → dead-letter
//!
//! 同時配送数は `max_in_flight` の semaphore で制限する。dispatcher は
//! singleton role なので lease を持ち、batch の間も LeaseKeeper が延長する。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::leadership::LeaseKeeper;
use super::worker_loop::pause;
use crate::config::DispatchConfig;
use crate::domain::{
    Backoff, DeadLetterReason, NewWorkItem, RetryPolicy, StoreError, WorkItem, WorkItemId,
    WorkerId,
};
use crate::ports::{
    Clock, DeliveryOutcome, DeliveryRequest, DeliveryStrategy, FailOutcome, LockManager,
    OutboxTransaction, SystemClock, WorkQueue, to_chrono,
};

/// Producer-side entry point.
pub struct Outbox;

impl Outbox {
    /// Append `item` inside the producer's open transaction.
    pub async fn append<T>(tx: &mut T, item: NewWorkItem) -> Result<WorkItemId, StoreError>
    where
        T: OutboxTransaction + ?Sized,
    {
        let event_type = item.event_type.clone();
        let id = tx.append(item).await?;
        debug!(item_id = %id, %event_type, "outbox append");
        Ok(id)
    }
}

/// Result of delivering one item.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivered {
    Ok,
    Retried,
    DeadLettered,
    ClaimLost,
}

/// Totals of one or more dispatch batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub claim_lost: u64,
    pub store_errors: u64,
}

impl DispatchReport {
    fn record(&mut self, result: Result<Delivered, StoreError>) {
        match result {
            Ok(Delivered::Ok) => self.delivered += 1,
            Ok(Delivered::Retried) => self.retried += 1,
            Ok(Delivered::DeadLettered) => self.dead_lettered += 1,
            Ok(Delivered::ClaimLost) => self.claim_lost += 1,
            Err(_) => self.store_errors += 1,
        }
    }

    fn absorb(&mut self, other: &DispatchReport) {
        self.claimed += other.claimed;
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.claim_lost += other.claim_lost;
        self.store_errors += other.store_errors;
    }
}

pub struct OutboxDispatcher {
    worker_id: WorkerId,
    queue: Arc<dyn WorkQueue>,
    locks: Arc<dyn LockManager>,
    routes: HashMap<String, Arc<dyn DeliveryStrategy>>,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    in_flight: Arc<Semaphore>,
    config: DispatchConfig,
}

impl OutboxDispatcher {
    /// `queue` must be the outbox lane.
    pub fn new(
        worker_id: WorkerId,
        queue: Arc<dyn WorkQueue>,
        locks: Arc<dyn LockManager>,
        config: DispatchConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            worker_id,
            queue,
            locks,
            routes: HashMap::new(),
            backoff: Backoff::new(retry),
            clock: Arc::new(SystemClock),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
        }
    }

    pub fn route(mut self, event_type: impl Into<String>, strategy: Arc<dyn DeliveryStrategy>) -> Self {
        self.routes.insert(event_type.into(), strategy);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn routed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }

    /// Claim one batch and deliver it. Returns once every delivery in the
    /// batch is recorded.
    pub async fn dispatch_once(self: &Arc<Self>) -> Result<DispatchReport, StoreError> {
        let items = self
            .queue
            .claim(&self.worker_id, self.config.batch_size)
            .await?;
        let mut report = DispatchReport {
            claimed: items.len() as u64,
            ..Default::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        let mut deliveries = JoinSet::new();
        for item in items {
            let permit = self
                .in_flight
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| StoreError::Unavailable("dispatcher closed".to_string()))?;
            let this = Arc::clone(self);
            deliveries.spawn(async move {
                let id = item.id;
                let result = this.deliver(item).await;
                drop(permit);
                if let Err(err) = &result {
                    error!(item_id = %id, error = %err, "store failed while recording delivery");
                }
                result
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(result) => report.record(result),
                Err(err) => error!(error = %err, "delivery task failed"),
            }
        }
        Ok(report)
    }

    async fn deliver(&self, item: WorkItem) -> Result<Delivered, StoreError> {
        let Some(strategy) = self.routes.get(&item.event_type) else {
            let message = format!("no delivery route for {}", item.event_type);
            return self
                .dead_letter(&item, DeadLetterReason::UnknownEventType, message)
                .await;
        };

        let request = DeliveryRequest::for_item(&item);
        let outcome =
            match tokio::time::timeout(self.config.delivery_timeout(), strategy.deliver(&request))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::Transient("delivery timed out".to_string()),
            };

        match outcome {
            DeliveryOutcome::Delivered | DeliveryOutcome::AlreadyApplied => {
                if self.queue.mark_processed(item.id).await? {
                    debug!(item_id = %item.id, event_type = %item.event_type, ?outcome, "delivered");
                    Ok(Delivered::Ok)
                } else {
                    Ok(Delivered::ClaimLost)
                }
            }
            DeliveryOutcome::Transient(reason) => {
                let delay = self.backoff.next_delay(item.retry_count + 1);
                warn!(
                    item_id = %item.id,
                    event_type = %item.event_type,
                    retry_count = item.retry_count,
                    %reason,
                    ?delay,
                    "delivery failed, will retry"
                );
                let not_before = self.clock.now() + to_chrono(delay);
                Ok(match self.queue.fail(item.id, reason, Some(not_before)).await? {
                    FailOutcome::Requeued { .. } => Delivered::Retried,
                    FailOutcome::DeadLettered { dead_letter_id } => {
                        error!(item_id = %item.id, %dead_letter_id, "delivery retries exhausted");
                        Delivered::DeadLettered
                    }
                    FailOutcome::NotClaimed => Delivered::ClaimLost,
                })
            }
            DeliveryOutcome::Permanent(reason) => {
                self.dead_letter(&item, DeadLetterReason::PermanentFailure, reason)
                    .await
            }
        }
    }

    async fn dead_letter(
        &self,
        item: &WorkItem,
        reason: DeadLetterReason,
        message: String,
    ) -> Result<Delivered, StoreError> {
        match self.queue.dead_letter(item.id, reason, message).await? {
            Some(dead_letter_id) => {
                error!(item_id = %item.id, event_type = %item.event_type, %reason, %dead_letter_id, "delivery dead-lettered");
                Ok(Delivered::DeadLettered)
            }
            None => Ok(Delivered::ClaimLost),
        }
    }

    /// Dispatch under the dispatcher lease until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> DispatchReport {
        let mut totals = DispatchReport::default();
        let mut leader: Option<LeaseKeeper> = None;
        info!(worker_id = %self.worker_id, lease = %self.config.lease_name, routes = ?self.routed_types(), "dispatcher started");

        while !cancel.is_cancelled() {
            if leader.as_ref().is_some_and(|k| !k.is_held()) {
                leader = None;
            }
            if leader.is_none() {
                match LeaseKeeper::acquire(
                    self.locks.clone(),
                    self.clock.clone(),
                    &self.config.lease_name,
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
                        totals.store_errors += 1;
                        error!(worker_id = %self.worker_id, error = %err, "dispatcher lease check failed");
                        pause(&cancel, self.config.poll_interval()).await;
                        continue;
                    }
                }
            }

            match self.dispatch_once().await {
                Ok(report) if report.claimed == 0 => {
                    pause(&cancel, self.config.poll_interval()).await;
                }
                Ok(report) => totals.absorb(&report),
                Err(err) => {
                    totals.store_errors += 1;
                    error!(worker_id = %self.worker_id, error = %err, unavailable = err.is_unavailable(), "dispatch batch failed, backing off");
                    pause(&cancel, self.config.poll_interval()).await;
                }
            }
        }

        if let Some(keeper) = leader
            && let Err(err) = keeper.release().await
        {
            warn!(worker_id = %self.worker_id, error = %err, "dispatcher lease release failed");
        }
        info!(worker_id = %self.worker_id, ?totals, "dispatcher stopped");
        totals
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::ItemState;
    use crate::impls::memory::test_support::store_at_noon;
    use crate::impls::{HttpDelivery, InMemoryStore};
    use crate::ports::{DeadLetterStore, IDEMPOTENCY_KEY_HEADER, ManualClock};

    /// Returns queued outcomes in order, then `Delivered`.
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<Vec<DeliveryOutcome>>,
        seen: Mutex<Vec<DeliveryRequest>>,
    }

    impl Scripted {
        fn with(outcomes: Vec<DeliveryOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
                seen: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl DeliveryStrategy for Scripted {
        async fn deliver(&self, request: &DeliveryRequest) -> DeliveryOutcome {
            self.seen.lock().unwrap().push(request.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(DeliveryOutcome::Delivered)
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            poll_interval_ms: 10,
            ..DispatchConfig::default()
        }
    }

    fn dispatcher(
        store: &InMemoryStore,
        clock: &Arc<ManualClock>,
        strategy: Arc<dyn DeliveryStrategy>,
    ) -> Arc<OutboxDispatcher> {
        Arc::new(
            OutboxDispatcher::new(
                WorkerId::new("dispatcher-1"),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                config(),
                RetryPolicy::fixed_exponential(Duration::from_secs(1), 2.0, Duration::from_secs(30)),
            )
            .with_clock(clock.clone())
            .route("order.shipped.v1", strategy),
        )
    }

    fn shipped(order: &str) -> NewWorkItem {
        NewWorkItem::new("order", order, "order.shipped.v1", br#"{"order":"42"}"#.to_vec())
    }

    #[tokio::test]
    async fn committed_append_is_delivered_with_its_token() {
        let (store, clock) = store_at_noon();
        let strategy = Scripted::with(vec![]);
        let dispatcher = dispatcher(&store, &clock, strategy.clone());

        let mut tx = store.transaction().await;
        let id = Outbox::append(&mut tx, shipped("42")).await.unwrap();
        tx.commit();

        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.delivered, 1);

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.state(clock.now()), ItemState::Processed);
        let seen = strategy.seen.lock().unwrap();
        assert_eq!(seen[0].idempotency_token, item.idempotency_token());
    }

    #[tokio::test]
    async fn rolled_back_append_is_never_dispatched() {
        let (store, clock) = store_at_noon();
        let dispatcher = dispatcher(&store, &clock, Scripted::with(vec![]));

        let mut tx = store.transaction().await;
        Outbox::append(&mut tx, shipped("42")).await.unwrap();
        tx.rollback();

        assert_eq!(dispatcher.dispatch_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn already_applied_counts_as_delivered() {
        let (store, clock) = store_at_noon();
        let dispatcher = dispatcher(&store, &clock, Scripted::with(vec![DeliveryOutcome::AlreadyApplied]));
        store.enqueue(shipped("1")).await.unwrap();

        assert_eq!(dispatcher.dispatch_once().await.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_after_backoff_then_succeeds() {
        let (store, clock) = store_at_noon();
        let strategy = Scripted::with(vec![DeliveryOutcome::Transient("status 503".into())]);
        let dispatcher = dispatcher(&store, &clock, strategy.clone());
        let id = store.enqueue(shipped("1")).await.unwrap();

        assert_eq!(dispatcher.dispatch_once().await.unwrap().retried, 1);
        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.error_message.as_deref(), Some("status 503"));
        assert_eq!(dispatcher.dispatch_once().await.unwrap().claimed, 0);

        clock.advance(ChronoDuration::seconds(1));
        assert_eq!(dispatcher.dispatch_once().await.unwrap().delivered, 1);
        let seen = strategy.seen.lock().unwrap();
        assert_eq!(seen[1].attempt, 2);
        assert_eq!(seen[0].idempotency_token, seen[1].idempotency_token);
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered_immediately() {
        let (store, clock) = store_at_noon();
        let dispatcher = dispatcher(
            &store,
            &clock,
            Scripted::with(vec![DeliveryOutcome::Permanent("status 400".into())]),
        );
        let id = store.enqueue(shipped("1")).await.unwrap();

        assert_eq!(dispatcher.dispatch_once().await.unwrap().dead_lettered, 1);
        let record = store.get_dead_letter(id).await.unwrap().unwrap();
        assert_eq!(record.reason, DeadLetterReason::PermanentFailure);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn unrouted_event_type_is_dead_lettered() {
        let (store, clock) = store_at_noon();
        let dispatcher = dispatcher(&store, &clock, Scripted::with(vec![]));
        let id = store
            .enqueue(NewWorkItem::new("user", "7", "user.deleted.v1", vec![]))
            .await
            .unwrap();

        assert_eq!(dispatcher.dispatch_once().await.unwrap().dead_lettered, 1);
        let record = store.get_dead_letter(id).await.unwrap().unwrap();
        assert_eq!(record.reason, DeadLetterReason::UnknownEventType);
    }

    struct Slow {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryStrategy for Slow {
        async fn deliver(&self, _: &DeliveryRequest) -> DeliveryOutcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            DeliveryOutcome::Delivered
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_max_in_flight() {
        let (store, clock) = store_at_noon();
        let slow = Arc::new(Slow {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(
            OutboxDispatcher::new(
                WorkerId::new("dispatcher-1"),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                DispatchConfig {
                    max_in_flight: 2,
                    ..config()
                },
                RetryPolicy::default(),
            )
            .with_clock(clock.clone())
            .route("order.shipped.v1", slow.clone()),
        );
        for i in 0..8 {
            store.enqueue(shipped(&i.to_string())).await.unwrap();
        }

        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report.delivered, 8);
        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn webhook_delivery_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/orders"))
            .and(header_exists(IDEMPOTENCY_KEY_HEADER))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let mut dispatch = config();
        dispatch.webhook_routes.insert(
            "order.shipped.v1".into(),
            format!("{}/hooks/orders", server.uri()),
        );
        let http = Arc::new(HttpDelivery::from_config(&dispatch).unwrap());

        let (store, clock) = store_at_noon();
        let dispatcher = dispatcher(&store, &clock, http);
        store.enqueue(shipped("42")).await.unwrap();

        assert_eq!(dispatcher.dispatch_once().await.unwrap().delivered, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_holds_the_dispatcher_lease_until_cancelled() {
        let store = InMemoryStore::new();
        let dispatcher = Arc::new(
            OutboxDispatcher::new(
                WorkerId::new("dispatcher-1"),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                config(),
                RetryPolicy::default(),
            )
            .route("order.shipped.v1", Scripted::with(vec![])),
        );
        store.enqueue(shipped("1")).await.unwrap();

        let cancel = CancellationToken::new();
        let running = tokio::spawn(dispatcher.run(cancel.clone()));
        for _ in 0..100 {
            if store.counts().await.unwrap().processed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lease = store.holder("outbox-dispatcher").await.unwrap().unwrap();
        assert_eq!(lease.holder_id.as_str(), "dispatcher-1");

        cancel.cancel();
        let totals = running.await.unwrap();
        assert_eq!(totals.delivered, 1);
        assert!(store.holder("outbox-dispatcher").await.unwrap().is_none());
    }
}
