//! WorkerBuilder - WorkerRuntime の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::worker_loop::WorkerRuntime;
use crate::config::{CourierConfig, IdempotencyConfig, WorkerConfig};
use crate::domain::{Decider, DefaultDecider, RetryPolicy, WorkerId};
use crate::ports::{
    AllowAll, Clock, GovernanceGate, IdempotencyStore, LockManager, SystemClock, WorkQueue,
};
use crate::typed::{Event, Handler, HandlerRegistry, RegistryError};

/// WorkerBuilder は WorkerRuntime を構築
///
/// # 使用例
/// ```ignore
/// let runtime = WorkerBuilder::new()
///     .worker_id(WorkerId::new("billing-1"))
///     .store(Arc::new(store))
///     .register::<ChargeCard, _>(ChargeCardHandler)?
///     .expect_event_types(&["billing.charge_card.v1"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_event_types() で期待される event_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - worker_id と store が揃っていなければ BuildError を返す
pub struct WorkerBuilder {
    registry: HandlerRegistry,
    expected_types: Option<Vec<String>>,
    worker_id: Option<WorkerId>,
    queue: Option<Arc<dyn WorkQueue>>,
    locks: Option<Arc<dyn LockManager>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    gate: Arc<dyn GovernanceGate>,
    decider: Option<Arc<dyn Decider>>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    idempotency_config: IdempotencyConfig,
}

/// BuildError は WorkerRuntime 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing event types: {0:?}. These event types were expected but not registered.")]
    MissingEventTypes(Vec<String>),

    #[error("missing component: {0}")]
    MissingComponent(&'static str),
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_types: None,
            worker_id: None,
            queue: None,
            locks: None,
            idempotency: None,
            gate: Arc::new(AllowAll),
            decider: None,
            retry_policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            config: WorkerConfig::default(),
            idempotency_config: IdempotencyConfig::default(),
        }
    }

    /// Take the worker, retry and idempotency sections. `worker.worker_id`
    /// is used when set.
    pub fn config(mut self, config: &CourierConfig) -> Self {
        if let Some(id) = &config.worker.worker_id {
            self.worker_id = Some(WorkerId::new(id.clone()));
        }
        self.config = config.worker.clone();
        self.retry_policy = config.retry.policy();
        self.idempotency_config = config.idempotency.clone();
        self
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Use one store for the queue, the leases and the idempotency keys.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: WorkQueue + LockManager + IdempotencyStore + 'static,
    {
        self.queue(store.clone())
            .locks(store.clone())
            .idempotency(store)
    }

    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn idempotency(mut self, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(idempotency);
        self
    }

    pub fn gate(mut self, gate: Arc<dyn GovernanceGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Replaces the default decider built from the retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Clock used to compute backoff deadlines. Share the store's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handler を登録
    pub fn register<E: Event, H: Handler<E> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<E, H>(handler)?;
        Ok(self)
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 期待される event_type のリストを設定
    pub fn expect_event_types(mut self, event_types: &[&str]) -> Self {
        self.expected_types = Some(event_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// # 検証
    /// - expect_event_types() の event_type が全て登録されているか
    /// - worker_id, queue, locks, idempotency が揃っているか
    pub fn build(self) -> Result<WorkerRuntime, BuildError> {
        if let Some(expected) = &self.expected_types {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingEventTypes(missing));
            }
        }

        let worker_id = self
            .worker_id
            .ok_or(BuildError::MissingComponent("worker_id"))?;
        let queue = self.queue.ok_or(BuildError::MissingComponent("queue"))?;
        let locks = self.locks.ok_or(BuildError::MissingComponent("locks"))?;
        let idempotency = self
            .idempotency
            .ok_or(BuildError::MissingComponent("idempotency"))?;
        let retry_policy = self.retry_policy;
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(retry_policy)));

        Ok(WorkerRuntime {
            worker_id,
            queue,
            locks,
            idempotency,
            gate: self.gate,
            decider,
            registry: self.registry,
            clock: self.clock,
            config: self.config,
            idempotency_config: self.idempotency_config,
        })
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
