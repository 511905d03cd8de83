use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockledger_core::{MerchantId, ProductId, StoreId, VariantId};

/// Event type that triggers stock deductions.
pub const ORDER_CREATED: &str = "OrderCreated";

/// Envelope shared by every upstream event.
///
/// `payload` stays untyped until the event type is known; only actionable
/// event types are decoded further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamEvent {
    #[serde(default)]
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: JsonValue,
}

/// Payload of an `OrderCreated` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub id: String,
    pub merchant_id: String,
    #[serde(default)]
    pub store_id: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

/// One line item of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    #[serde(default)]
    pub variant_id: Option<String>,
    pub quantity: f64,
}

impl OrderCreated {
    pub fn merchant(&self) -> MerchantId {
        MerchantId::new(self.merchant_id.clone())
    }

    /// An empty `store_id` means the order is not tied to a store.
    pub fn store(&self) -> Option<StoreId> {
        non_blank(&self.store_id).map(StoreId::new)
    }
}

impl OrderItem {
    pub fn product(&self) -> ProductId {
        ProductId::new(self.product_id.clone())
    }

    pub fn variant(&self) -> Option<VariantId> {
        self.variant_id.as_deref().and_then(non_blank).map(VariantId::new)
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// A decoded upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    OrderCreated {
        event_id: String,
        order: OrderCreated,
    },
    /// Any event type this service does not act on.
    Ignored { event_type: String },
}

/// Malformed upstream payload. Redelivery cannot fix these.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode raw bytes from the stream into a [`DomainEvent`].
pub fn decode(bytes: &[u8]) -> Result<DomainEvent, DecodeError> {
    let envelope: UpstreamEvent = serde_json::from_slice(bytes).map_err(DecodeError::Envelope)?;

    if envelope.event_type != ORDER_CREATED {
        return Ok(DomainEvent::Ignored {
            event_type: envelope.event_type,
        });
    }

    let order: OrderCreated =
        serde_json::from_value(envelope.payload).map_err(|source| DecodeError::Payload {
            event_type: envelope.event_type.clone(),
            source,
        })?;

    Ok(DomainEvent::OrderCreated {
        event_id: envelope.event_id,
        order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_order_created() {
        let raw = json!({
            "event_id": "evt-1",
            "event_type": "OrderCreated",
            "timestamp": "2024-05-01T10:00:00Z",
            "payload": {
                "id": "order-1",
                "merchant_id": "m1",
                "store_id": "s1",
                "items": [
                    {"product_id": "p1", "variant_id": null, "quantity": 2},
                    {"product_id": "p2", "variant_id": "v2", "quantity": 0.5}
                ]
            }
        });

        let event = decode(raw.to_string().as_bytes()).unwrap();
        let DomainEvent::OrderCreated { event_id, order } = event else {
            panic!("expected OrderCreated");
        };
        assert_eq!(event_id, "evt-1");
        assert_eq!(order.store(), Some(StoreId::new("s1")));
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].variant(), None);
        assert_eq!(order.items[1].variant(), Some(VariantId::new("v2")));
        assert_eq!(order.items[1].quantity, 0.5);
    }

    #[test]
    fn other_event_types_are_ignored() {
        let raw = json!({"event_type": "OrderCancelled", "payload": {"anything": true}});
        let event = decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(
            event,
            DomainEvent::Ignored {
                event_type: "OrderCancelled".to_string()
            }
        );
    }

    #[test]
    fn empty_store_id_is_unscoped() {
        let order = OrderCreated {
            id: "o".into(),
            merchant_id: "m".into(),
            store_id: "".into(),
            items: vec![],
        };
        assert_eq!(order.store(), None);
    }

    #[test]
    fn malformed_bytes_are_decode_errors() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Envelope(_))));

        let bad_payload = json!({"event_type": "OrderCreated", "payload": {"id": 7}});
        assert!(matches!(
            decode(bad_payload.to_string().as_bytes()),
            Err(DecodeError::Payload { .. })
        ));
    }
}
