//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: 開発用・テスト用の正本（queue, lease, dead-letter, idempotency）
//! - **PgStore**: PostgreSQL の正本
//! - **HttpDelivery**: webhook 配送
//! - **NotificationRouter**: channel 宛て通知
//! - **InMemoryBroker**: 開発用の fast-path broker

pub mod http_delivery;
pub mod inmem_broker;
pub mod memory;
pub mod notify;
pub mod postgres;

// 主要な型を再エクスポート
pub use self::http_delivery::HttpDelivery;
pub use self::inmem_broker::InMemoryBroker;
pub use self::memory::{InMemoryStore, MemoryTransaction};
pub use self::notify::{
    LogChannel, NOTIFICATION_EVENT_TYPE, Notification, NotificationChannel, NotificationRouter,
    UnknownChannelPolicy,
};
pub use self::postgres::PgStore;
