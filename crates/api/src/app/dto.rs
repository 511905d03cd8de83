use chrono::{DateTime, Utc};
use serde::Deserialize;

use stockledger_core::{Paged, StoreId, VariantId};
use stockledger_inventory::{MovementRecord, MovementType, StockBalance};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct AdjustInventoryRequest {
    #[serde(default)]
    pub store_id: Option<String>,
    pub product_id: String,
    #[serde(default)]
    pub variant_id: Option<String>,
    pub quantity_change: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub reference_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BalanceQuery {
    pub store_id: Option<String>,
    pub variant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LowStockQuery {
    pub store_id: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MovementsQuery {
    pub product_id: Option<String>,
    pub store_id: Option<String>,
    pub movement_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

// -------------------------
// Mapping helpers
// -------------------------

/// Blank optional ids mean "unscoped".
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn store_id(value: Option<String>) -> Option<StoreId> {
    non_blank(value).map(StoreId::new)
}

pub fn variant_id(value: Option<String>) -> Option<VariantId> {
    non_blank(value).map(VariantId::new)
}

pub fn parse_movement_type(
    value: Option<String>,
) -> Result<Option<MovementType>, axum::response::Response> {
    match non_blank(value) {
        None => Ok(None),
        Some(v) => v.parse::<MovementType>().map(Some).map_err(|_| {
            errors::json_error(
                axum::http::StatusCode::BAD_REQUEST,
                "invalid_movement_type",
                "movement_type must be one of: adjustment, sale, transfer, return",
            )
        }),
    }
}

// -------------------------
// Response mapping
// -------------------------

pub fn balance_to_json(b: &StockBalance) -> serde_json::Value {
    serde_json::json!({
        "id": b.balance_id.to_string(),
        "merchant_id": b.key.merchant_id.as_str(),
        "store_id": b.key.store_id.as_ref().map(StoreId::as_str),
        "product_id": b.key.product_id.as_str(),
        "variant_id": b.key.variant_id.as_ref().map(VariantId::as_str),
        "quantity": b.quantity,
        "reserved_quantity": b.reserved_quantity,
        "available_quantity": b.available_quantity(),
        "reorder_point": b.reorder_point,
        "reorder_quantity": b.reorder_quantity,
        "last_counted_at": b.last_counted_at,
        "updated_at": b.updated_at,
    })
}

pub fn movement_to_json(m: &MovementRecord) -> serde_json::Value {
    serde_json::json!({
        "id": m.movement_id.to_string(),
        "merchant_id": m.key.merchant_id.as_str(),
        "store_id": m.key.store_id.as_ref().map(StoreId::as_str),
        "product_id": m.key.product_id.as_str(),
        "variant_id": m.key.variant_id.as_ref().map(VariantId::as_str),
        "movement_type": m.movement_type.as_str(),
        "quantity_change": m.quantity_change,
        "quantity_before": m.quantity_before,
        "quantity_after": m.quantity_after,
        "reference_type": m.reference_type,
        "reference_id": m.reference_id,
        "notes": m.notes,
        "created_by": m.created_by.as_ref().map(|a| a.as_str()),
        "created_at": m.created_at,
    })
}

pub fn paged_to_json<T>(page: &Paged<T>, f: impl Fn(&T) -> serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "items": page.items.iter().map(f).collect::<Vec<_>>(),
        "total": page.total,
        "page": page.page.page,
        "page_size": page.page.page_size,
        "has_more": page.has_more(),
    })
}
