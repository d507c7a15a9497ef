//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: WorkerRuntime の構築とワイヤリング（起動時検証）
//! - **WorkerRuntime**: claim→gate→idempotency→handle→decide のループ
//! - **Outbox / OutboxDispatcher**: transactional outbox の書き込みと配送
//! - **Publisher**: fast-path broker と durable queue への fallback
//! - **Reaper**: stale claim の回収
//! - **RetentionSweep**: processed 行と dead-letter partition の削除
//! - **DeadLetterService**: dead-letter の照会と replay
//! - **LeaseKeeper**: singleton role の lease 保持

pub mod builder;
pub mod dead_letter;
pub mod leadership;
pub mod outbox;
pub mod publisher;
pub mod reaper_loop;
pub mod retention;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, WorkerBuilder};
pub use self::dead_letter::{DeadLetterDetail, DeadLetterService};
pub use self::leadership::LeaseKeeper;
pub use self::outbox::{DispatchReport, Outbox, OutboxDispatcher};
pub use self::publisher::{PublishOutcome, Publisher};
pub use self::reaper_loop::Reaper;
pub use self::retention::{RetentionReport, RetentionSweep};
pub use self::worker_loop::{ItemDisposition, WorkerReport, WorkerRuntime};
