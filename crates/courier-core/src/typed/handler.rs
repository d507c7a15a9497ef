//! Handler trait - Event を処理する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<E>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<E, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::event::Event;
use crate::domain::{HandlerError, IdempotencyToken, WorkItem, WorkItemId, WorkerId};

/// Value recorded in the idempotency store on success.
pub type HandlerOutput = Option<serde_json::Value>;

/// Per-attempt metadata passed to every handler.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerContext {
    pub item_id: WorkItemId,
    pub worker_id: WorkerId,
    /// 1 on the first attempt.
    pub attempt: u32,
    pub stream_key: String,
    /// Pass this on to external receivers so they can drop duplicates.
    pub idempotency_token: IdempotencyToken,
}

impl HandlerContext {
    pub fn for_item(item: &WorkItem, worker_id: &WorkerId) -> Self {
        Self {
            item_id: item.id,
            worker_id: worker_id.clone(),
            attempt: item.retry_count + 1,
            stream_key: item.stream_key(),
            idempotency_token: item.idempotency_token(),
        }
    }
}

/// Handler は Event を処理して結果を返す
///
/// # 使用例
/// ```ignore
/// struct ShipmentNotifier;
///
/// #[async_trait]
/// impl Handler<OrderShipped> for ShipmentNotifier {
///     async fn handle(&self, event: OrderShipped, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
///         notify(&event.order_id, ctx.idempotency_token.as_str()).await
///             .map_err(|e| HandlerError::transient(e.to_string()))?;
///         Ok(None)
///     }
/// }
/// ```
///
/// Handlers must be idempotent: an abandoned attempt can run again after its
/// claim goes stale.
#[async_trait]
pub trait Handler<E: Event>: Send + Sync {
    async fn handle(&self, event: E, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<E, H> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: &[u8],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError>;

    fn event_type(&self) -> &str;
}

pub struct TypedHandler<E: Event, H: Handler<E>> {
    handler: H,
    _marker: PhantomData<fn(E)>,
}

impl<E: Event, H: Handler<E>> TypedHandler<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Event, H: Handler<E>> DynHandler for TypedHandler<E, H> {
    /// A payload that does not decode is a permanent fault: retrying the
    /// same bytes cannot succeed.
    async fn handle_dyn(
        &self,
        payload: &[u8],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let event: E = PayloadCodec::decode(payload)
            .map_err(|e| HandlerError::permanent(format!("malformed payload: {e}")))?;
        self.handler.handle(event, ctx).await
    }

    fn event_type(&self) -> &str {
        E::TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, NewWorkItem};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: i32,
    }

    impl Event for Ping {
        const TYPE: &'static str = "test.ping.v1";
    }

    struct Echo;

    #[async_trait]
    impl Handler<Ping> for Echo {
        async fn handle(&self, event: Ping, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
            Ok(Some(serde_json::json!({ "n": event.n, "attempt": ctx.attempt })))
        }
    }

    fn ctx() -> HandlerContext {
        let item = WorkItem::from_new(
            WorkItemId::generate(),
            NewWorkItem::new("a", "1", Ping::TYPE, vec![]),
            Utc::now(),
        );
        HandlerContext::for_item(&item, &WorkerId::new("w1"))
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_runs() {
        let handler = TypedHandler::<Ping, _>::new(Echo);
        let out = handler.handle_dyn(br#"{"n": 7}"#, &ctx()).await.unwrap();
        assert_eq!(out, Some(serde_json::json!({ "n": 7, "attempt": 1 })));
        assert_eq!(handler.event_type(), "test.ping.v1");
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let handler = TypedHandler::<Ping, _>::new(Echo);
        let err = handler.handle_dyn(b"{", &ctx()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}
