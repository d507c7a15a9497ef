//! InMemoryBroker - 開発用の fast-path broker
//!
//! # 学習ポイント
//! - Mutex + Notify による待機付き pop
//! - event_type ごとの複数キューの管理
//! - 可用性フラグで broker 障害を再現する（durable fallback のテスト用）

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::domain::NewWorkItem;
use crate::ports::{BrokerError, FastPathBroker};

/// InMemoryBroker は開発用の broker
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.publish(&item).await?;
/// let next = broker.pop("order.shipped.v1", Duration::from_secs(5)).await;
/// ```
pub struct InMemoryBroker {
    /// event_type ごとのキュー
    topics: Mutex<HashMap<String, VecDeque<NewWorkItem>>>,
    /// publish 時の通知用
    notify: Notify,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self, event_type: &str) -> usize {
        self.lock_topics().get(event_type).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, event_type: &str) -> bool {
        self.len(event_type) == 0
    }

    /// Wait up to `timeout` for the next message of `event_type`.
    pub async fn pop(&self, event_type: &str, timeout: Duration) -> Option<NewWorkItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self
                .lock_topics()
                .get_mut(event_type)
                .and_then(VecDeque::pop_front)
            {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<NewWorkItem>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastPathBroker for InMemoryBroker {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn publish(&self, item: &NewWorkItem) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::Unavailable);
        }
        self.lock_topics()
            .entry(item.event_type.clone())
            .or_default()
            .push_back(item.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
