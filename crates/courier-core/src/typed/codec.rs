//! PayloadCodec - payload bytes と Event の相互変換
//!
//! Payloads are JSON on the wire. The queue itself treats them as opaque bytes.

use super::event::Event;
use crate::domain::{NewWorkItem, WorkItem};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot encode {event_type}: {source}")]
    Encode {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot decode {event_type}: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The item's event_type is not the one the caller asked for.
    #[error("expected event type {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<E: Event>(event: &E) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|source| CodecError::Encode {
            event_type: E::TYPE,
            source,
        })
    }

    pub fn decode<E: Event>(payload: &[u8]) -> Result<E, CodecError> {
        serde_json::from_slice(payload).map_err(|source| CodecError::Decode {
            event_type: E::TYPE.to_string(),
            source,
        })
    }

    /// Decode an item, checking that it carries `E::TYPE`.
    pub fn decode_item<E: Event>(item: &WorkItem) -> Result<E, CodecError> {
        if item.event_type != E::TYPE {
            return Err(CodecError::TypeMismatch {
                expected: E::TYPE,
                actual: item.event_type.clone(),
            });
        }
        Self::decode(&item.payload)
    }

    /// Build a `NewWorkItem` whose event_type comes from the type.
    pub fn new_item<E: Event>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event: &E,
    ) -> Result<NewWorkItem, CodecError> {
        let payload = Self::encode(event)?;
        Ok(NewWorkItem::new(aggregate_type, aggregate_id, E::TYPE, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkItemId;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct InvoicePaid {
        invoice_id: String,
        cents: u64,
    }

    impl Event for InvoicePaid {
        const TYPE: &'static str = "invoice.paid.v1";
    }

    #[test]
    fn new_item_carries_the_type_constant() {
        let event = InvoicePaid {
            invoice_id: "inv-1".into(),
            cents: 1200,
        };
        let new = PayloadCodec::new_item("invoice", "inv-1", &event).unwrap();
        assert_eq!(new.event_type, InvoicePaid::TYPE);

        let item = WorkItem::from_new(WorkItemId::generate(), new, Utc::now());
        assert_eq!(PayloadCodec::decode_item::<InvoicePaid>(&item).unwrap(), event);
    }

    #[test]
    fn decode_item_rejects_other_types() {
        let new = NewWorkItem::new("invoice", "inv-1", "invoice.voided.v1", b"{}".to_vec());
        let item = WorkItem::from_new(WorkItemId::generate(), new, Utc::now());
        assert!(matches!(
            PayloadCodec::decode_item::<InvoicePaid>(&item),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        assert!(matches!(
            PayloadCodec::decode::<InvoicePaid>(b"not json"),
            Err(CodecError::Decode { .. })
        ));
    }
}
