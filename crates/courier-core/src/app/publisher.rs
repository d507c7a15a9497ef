//! Publisher - fast-path broker 優先、失敗時は durable queue へ fallback
//!
//! Nothing is lost when the broker is down: the item lands in the work queue
//! and the worker runtime picks it up from there.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{NewWorkItem, StoreError, WorkItemId};
use crate::ports::{FastPathBroker, WorkQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the broker.
    Broker,
    /// Written to the durable queue under this id.
    Durable(WorkItemId),
}

pub struct Publisher {
    broker: Option<Arc<dyn FastPathBroker>>,
    queue: Arc<dyn WorkQueue>,
}

impl Publisher {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            broker: None,
            queue,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn FastPathBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Only a store failure is an error: by then both paths have failed.
    pub async fn publish(&self, item: NewWorkItem) -> Result<PublishOutcome, StoreError> {
        if let Some(broker) = &self.broker {
            if broker.is_available() {
                match broker.publish(&item).await {
                    Ok(()) => {
                        debug!(event_type = %item.event_type, "published to broker");
                        return Ok(PublishOutcome::Broker);
                    }
                    Err(error) => {
                        warn!(event_type = %item.event_type, %error, "broker publish failed, using durable queue");
                    }
                }
            } else {
                debug!(event_type = %item.event_type, "broker unavailable, using durable queue");
            }
        }

        let id = self.queue.enqueue(item).await?;
        Ok(PublishOutcome::Durable(id))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::impls::{InMemoryBroker, InMemoryStore};
    use crate::ports::BrokerError;

    fn item() -> NewWorkItem {
        NewWorkItem::new("job", "7", "report.render.v1", b"{}".to_vec())
    }

    fn publisher(store: &InMemoryStore, broker: Arc<dyn FastPathBroker>) -> Publisher {
        Publisher::new(Arc::new(store.clone())).with_broker(broker)
    }

    #[tokio::test]
    async fn healthy_broker_takes_the_item() {
        let store = InMemoryStore::new();
        let broker = Arc::new(InMemoryBroker::new());
        let outcome = publisher(&store, broker.clone()).publish(item()).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Broker);
        assert_eq!(broker.len("report.render.v1"), 1);
        assert_eq!(store.counts().await.unwrap().unprocessed(), 0);
    }

    #[tokio::test]
    async fn known_outage_falls_back_without_trying() {
        let store = InMemoryStore::new();
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);

        let outcome = publisher(&store, broker.clone()).publish(item()).await.unwrap();
        let PublishOutcome::Durable(id) = outcome else {
            panic!("expected durable fallback, got {outcome:?}");
        };
        assert!(store.get(id).await.unwrap().is_some());
        assert!(broker.is_empty("report.render.v1"));
    }

    struct Rejecting;

    #[async_trait]
    impl FastPathBroker for Rejecting {
        fn is_available(&self) -> bool {
            true
        }

        async fn publish(&self, _: &NewWorkItem) -> Result<(), BrokerError> {
            Err(BrokerError::PublishFailed("partition leader moved".into()))
        }
    }

    #[tokio::test]
    async fn publish_error_falls_back() {
        let store = InMemoryStore::new();
        let outcome = publisher(&store, Arc::new(Rejecting)).publish(item()).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Durable(_)));
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn no_broker_means_durable() {
        let store = InMemoryStore::new();
        let outcome = Publisher::new(Arc::new(store.clone())).publish(item()).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Durable(_)));
    }
}
