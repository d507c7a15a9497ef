//! HandlerRegistry - Handler の登録と管理
//!
//! Resolved once at startup; the worker runtime only reads it afterwards.
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::event::Event;
use super::handler::{DynHandler, Handler, TypedHandler};

/// What the runtime does with an item whose event_type has no handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Archive with reason `unknown_event_type`.
    #[default]
    DeadLetter,
    /// Mark processed and log a warning.
    Discard,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for event type '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// HandlerRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<OrderShipped, _>(ShipmentNotifier)?;
///
/// let handler = registry.get("order.shipped.v1");
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Event, H: Handler<E> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::<E, H>::new(handler)))
    }

    /// Register an already type-erased handler under its own event_type.
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let event_type = handler.event_type().to_string();
        if self.handlers.contains_key(&event_type) {
            return Err(RegistryError::AlreadyRegistered(event_type));
        }
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Sorted for stable logs.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandlerError;
    use crate::typed::handler::{HandlerContext, HandlerOutput};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Created {
        value: i32,
    }

    impl Event for Created {
        const TYPE: &'static str = "test.created.v1";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Renamed {
        name: String,
    }

    impl Event for Renamed {
        const TYPE: &'static str = "test.renamed.v1";
    }

    struct Noop;

    #[async_trait]
    impl Handler<Created> for Noop {
        async fn handle(&self, _: Created, _: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl Handler<Renamed> for Noop {
        async fn handle(&self, _: Renamed, _: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
            Ok(None)
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Created, _>(Noop).unwrap();
        assert!(registry.get(Created::TYPE).is_some());
        assert!(registry.get(Renamed::TYPE).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Created, _>(Noop).unwrap();
        let result = registry.register::<Created, _>(Noop);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(t)) if t == Created::TYPE));
    }

    #[test]
    fn registered_types_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Renamed, _>(Noop).unwrap();
        registry.register::<Created, _>(Noop).unwrap();
        assert_eq!(
            registry.registered_types(),
            vec![Created::TYPE.to_string(), Renamed::TYPE.to_string()]
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn policy_parses_from_snake_case() {
        let p: UnknownTypePolicy = serde_json::from_str("\"discard\"").unwrap();
        assert_eq!(p, UnknownTypePolicy::Discard);
        assert_eq!(UnknownTypePolicy::default(), UnknownTypePolicy::DeadLetter);
    }
}
