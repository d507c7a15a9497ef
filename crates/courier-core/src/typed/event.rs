//! Event trait - event_type と payload 型の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Event は event_type と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderShipped {
///     order_id: String,
/// }
///
/// impl Event for OrderShipped {
///     const TYPE: &'static str = "order.shipped.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: outbox / queue の payload に書くため
/// - `DeserializeOwned`: payload bytes からの復元のため
/// - `Send + Sync + 'static`: handler task に move するため
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// event_type の定義
    ///
    /// # 命名規約
    /// - `{domain}.{action}.v{major}`
    /// - 例: `webhook.delivery.v1`
    const TYPE: &'static str;
}
