//! courier-worker - worker runtime, outbox dispatcher, reaper and retention
//! sweep in one process.
//!
//! # フロー
//! 1. 設定を読む（引数 > `COURIER_CONFIG` > 既定値）
//! 2. `store.database_url` があれば PostgreSQL、無ければ in-memory store
//! 3. 各ループを同じ CancellationToken で起動
//! 4. Ctrl-C で cancel し、全ループの drain を待つ

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier_core::app::{OutboxDispatcher, Reaper, RetentionSweep, WorkerBuilder};
use courier_core::config::CourierConfig;
use courier_core::domain::{HandlerError, NewWorkItem, WorkerId};
use courier_core::impls::{
    HttpDelivery, InMemoryStore, LogChannel, NOTIFICATION_EVENT_TYPE, Notification,
    NotificationRouter, PgStore,
};
use courier_core::observability::init_tracing;
use courier_core::ports::{DeadLetterStore, IdempotencyStore, LockManager, WorkQueue};
use courier_core::typed::{Event, Handler, HandlerContext, HandlerOutput};
use courier_core::{CourierError, Result};

/// Config file path when no argument is given.
const CONFIG_ENV: &str = "COURIER_CONFIG";

#[derive(Debug, Serialize, Deserialize)]
struct OrderShipped {
    order_id: String,
    email: String,
}

impl Event for OrderShipped {
    const TYPE: &'static str = "order.shipped.v1";
}

/// Turns a shipment into a customer notification on the outbox lane.
struct ShipmentNotifier {
    outbox: Arc<dyn WorkQueue>,
}

#[async_trait]
impl Handler<OrderShipped> for ShipmentNotifier {
    async fn handle(&self, event: OrderShipped, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        let notification = Notification {
            channel: "log".to_string(),
            recipient: event.email,
            subject: Some(format!("Order {} shipped", event.order_id)),
            body: "Your order is on its way.".to_string(),
        };
        let item = NewWorkItem::json("order", &event.order_id, NOTIFICATION_EVENT_TYPE, &notification)
            .map_err(|e| HandlerError::permanent(e.to_string()))?
            .with_dedup_key(format!("shipped-notice:{}", ctx.item_id));
        let id = self
            .outbox
            .enqueue(item)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        Ok(Some(serde_json::json!({ "notification": id.to_string() })))
    }
}

/// The ports every loop needs, for one job lane and one outbox lane.
struct Lanes {
    jobs: Arc<dyn WorkQueue>,
    outbox: Arc<dyn WorkQueue>,
    locks: Arc<dyn LockManager>,
    idempotency: Arc<dyn IdempotencyStore>,
    archive: Arc<dyn DeadLetterStore>,
}

impl Lanes {
    fn new<S>(jobs: Arc<S>, outbox: Arc<S>) -> Self
    where
        S: WorkQueue + LockManager + IdempotencyStore + DeadLetterStore + 'static,
    {
        Self {
            jobs: jobs.clone(),
            outbox,
            locks: jobs.clone(),
            idempotency: jobs.clone(),
            archive: jobs,
        }
    }
}

fn load_config() -> Result<CourierConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok());
    let config = match path {
        Some(path) => CourierConfig::load(path)?,
        None => {
            let mut config = CourierConfig::default();
            config.apply_env();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn worker_id(config: &CourierConfig) -> WorkerId {
    if let Some(id) = &config.worker.worker_id {
        return WorkerId::new(id.clone());
    }
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "courier".to_string());
    WorkerId::new(format!("{host}-{}-{}", std::process::id(), ulid::Ulid::new()))
}

async fn open_lanes(config: &CourierConfig) -> Result<Lanes> {
    match &config.store.database_url {
        Some(url) => {
            let store = PgStore::connect(&config.store, url).await?;
            store.migrate().await?;
            let outbox = store.outbox_lane();
            info!("using postgres store");
            Ok(Lanes::new(Arc::new(store), Arc::new(outbox)))
        }
        None => {
            info!("no database_url configured, using in-memory store");
            let store = InMemoryStore::new();
            let outbox = store.outbox_lane();
            Ok(Lanes::new(Arc::new(store), Arc::new(outbox)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_tracing(&config.logging);

    let worker_id = worker_id(&config);
    let lanes = open_lanes(&config).await?;
    info!(worker_id = %worker_id, "starting courier");

    let runtime = WorkerBuilder::new()
        .config(&config)
        .worker_id(worker_id.clone())
        .queue(lanes.jobs.clone())
        .locks(lanes.locks.clone())
        .idempotency(lanes.idempotency.clone())
        .register::<OrderShipped, _>(ShipmentNotifier {
            outbox: lanes.outbox.clone(),
        })?
        .expect_event_types(&[OrderShipped::TYPE])
        .build()?;

    let http = Arc::new(
        HttpDelivery::from_config(&config.dispatch)
            .map_err(|e| CourierError::Config(e.to_string()))?,
    );
    let notifications = Arc::new(
        NotificationRouter::new(config.dispatch.unknown_channel_policy)
            .channel(Arc::new(LogChannel)),
    );
    let mut dispatcher = OutboxDispatcher::new(
        worker_id.clone(),
        lanes.outbox.clone(),
        lanes.locks.clone(),
        config.dispatch.clone(),
        config.retry.policy(),
    )
    .route(NOTIFICATION_EVENT_TYPE, notifications);
    for event_type in config.dispatch.webhook_routes.keys() {
        dispatcher = dispatcher.route(event_type.clone(), http.clone());
    }
    info!(routes = ?dispatcher.routed_types(), "outbox routes");

    let reapers = [lanes.jobs.clone(), lanes.outbox.clone()]
        .map(|lane| Reaper::from_config(lane, &config));
    let retention = RetentionSweep::new(
        worker_id.clone(),
        lanes.locks.clone(),
        lanes.archive.clone(),
        config.retention.clone(),
    )
    .lane(lanes.jobs.clone())
    .lane(lanes.outbox.clone());

    let cancel = CancellationToken::new();
    let mut loops = JoinSet::new();
    {
        let cancel = cancel.clone();
        let runtime = Arc::new(runtime);
        loops.spawn(async move {
            let report = runtime.run(cancel).await;
            info!(?report, "worker finished");
        });
    }
    {
        let cancel = cancel.clone();
        let dispatcher = Arc::new(dispatcher);
        loops.spawn(async move {
            let report = dispatcher.run(cancel).await;
            info!(?report, "dispatcher finished");
        });
    }
    for reaper in reapers {
        let cancel = cancel.clone();
        loops.spawn(async move {
            reaper.run(cancel).await;
        });
    }
    {
        let cancel = cancel.clone();
        loops.spawn(async move { retention.run(cancel).await });
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for ctrl-c, shutting down");
    }
    info!("shutdown requested");
    cancel.cancel();

    while let Some(joined) = loops.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "loop task failed");
        }
    }
    info!("courier stopped");
    Ok(())
}
