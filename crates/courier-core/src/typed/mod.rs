//! Typed - 型付き Event / Handler API
//!
//! このモジュールは event_type の typo を型で排除し、
//! Handler との対応付けを起動時に一度だけ解決します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Event` trait, `Handler<E>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! 未登録の event_type は `UnknownTypePolicy` に従って明示的に扱います
//! （黙って skip することはありません）。

pub mod codec;
pub mod event;
pub mod handler;
pub mod registry;

pub use self::codec::{CodecError, PayloadCodec};
pub use self::event::Event;
pub use self::handler::{DynHandler, Handler, HandlerContext, HandlerOutput, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError, UnknownTypePolicy};
