//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（PostgreSQL, broker, HTTP 受信側, governance）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - backing store が queue item と lease の所有権の唯一の正本
//! - アプリケーション側のロックを I/O 境界を跨いで保持しない

pub mod broker;
pub mod clock;
pub mod dead_letter;
pub mod delivery;
pub mod governance;
pub mod idempotency;
pub mod lock_manager;
pub mod outbox;
pub mod work_queue;

pub use self::broker::{BrokerError, FastPathBroker};
pub use self::clock::{Clock, ManualClock, SystemClock, to_chrono};
pub use self::dead_letter::{DeadLetterStore, ReplayError};
pub use self::delivery::{
    DeliveryError, DeliveryOutcome, DeliveryRequest, DeliveryStrategy, EVENT_ID_HEADER, IDEMPOTENCY_KEY_HEADER,
};
pub use self::governance::{AllowAll, GateDecision, GateError, GovernanceGate};
pub use self::idempotency::IdempotencyStore;
pub use self::lock_manager::LockManager;
pub use self::outbox::OutboxTransaction;
pub use self::work_queue::{FailOutcome, WorkQueue};
