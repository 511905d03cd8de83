use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{ActorId, DomainError, MerchantId, MovementId, ProductId, StockKey, StoreId};

/// Kind of stock movement recorded in the audit log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Adjustment,
    Sale,
    Transfer,
    Return,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Adjustment => "adjustment",
            MovementType::Sale => "sale",
            MovementType::Transfer => "transfer",
            MovementType::Return => "return",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adjustment" => Ok(MovementType::Adjustment),
            "sale" => Ok(MovementType::Sale),
            "transfer" => Ok(MovementType::Transfer),
            "return" => Ok(MovementType::Return),
            other => Err(DomainError::validation(format!("unknown movement type '{other}'"))),
        }
    }
}

/// Immutable audit record of one balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub movement_id: MovementId,
    pub key: StockKey,
    pub movement_type: MovementType,
    pub quantity_change: f64,
    pub quantity_before: f64,
    pub quantity_after: f64,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub notes: String,
    pub created_by: Option<ActorId>,
    pub created_at: DateTime<Utc>,
}

impl MovementRecord {
    /// True when this record was produced for the given external reference.
    pub fn has_reference(&self, reference_type: &str, reference_id: &str) -> bool {
        self.reference_type.as_deref() == Some(reference_type)
            && self.reference_id.as_deref() == Some(reference_id)
    }
}

/// Query filter for the movement log.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementFilter {
    pub merchant_id: MerchantId,
    pub product_id: Option<ProductId>,
    pub store_id: Option<StoreId>,
    pub movement_type: Option<MovementType>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

impl MovementFilter {
    pub fn for_merchant(merchant_id: MerchantId) -> Self {
        Self {
            merchant_id,
            product_id: None,
            store_id: None,
            movement_type: None,
            created_from: None,
            created_to: None,
        }
    }

    pub fn matches(&self, movement: &MovementRecord) -> bool {
        if movement.key.merchant_id != self.merchant_id {
            return false;
        }
        if let Some(product) = &self.product_id {
            if &movement.key.product_id != product {
                return false;
            }
        }
        if let Some(store) = &self.store_id {
            if movement.key.store_id.as_ref() != Some(store) {
                return false;
            }
        }
        if let Some(kind) = self.movement_type {
            if movement.movement_type != kind {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if movement.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if movement.created_at > to {
                return false;
            }
        }
        true
    }
}
