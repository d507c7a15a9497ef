//! courier-core
//!
//! Durable work dispatch on top of a single backing store: a claim-based work
//! queue, a transactional outbox with webhook / notification delivery, named
//! leases, a dead-letter archive with idempotent replay, and the worker
//! runtime that ties them together.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, work item, lease, dead letter, retry, decision, errors）
//! - **ports**: 抽象化レイヤー（WorkQueue, LockManager, DeadLetterStore, IdempotencyStore, DeliveryStrategy, など）
//! - **app**: アプリケーションロジック（builder, worker_loop, outbox, reaper, retention, など）
//! - **typed**: 型付き Event API（Event trait, Handler trait, HandlerRegistry, PayloadCodec）
//! - **impls**: 実装（InMemoryStore, PgStore, HttpDelivery, NotificationRouter）
//! - **config**: TOML 設定
//! - **observability**: tracing の初期化と queue の集計
//!
//! # 設計原則
//! - backing store が唯一の正本。プロセス内の状態は再起動で失われてよい
//! - at-least-once 配送。重複は idempotency key で受信側・handler 側が吸収する
//! - 失敗は Transient / Permanent / GovernanceBlocked に分類し、dead-letter は明示的

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use domain::CourierError;
pub use domain::errors::Result;
