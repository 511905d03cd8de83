use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{BalanceId, StockKey};

/// Current stock level for one [`StockKey`].
///
/// `available_quantity` is not stored: it is always derived from
/// `quantity` and `reserved_quantity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockBalance {
    pub balance_id: BalanceId,
    pub key: StockKey,
    pub quantity: f64,
    pub reserved_quantity: f64,
    pub reorder_point: f64,
    pub reorder_quantity: f64,
    pub last_counted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StockBalance {
    /// Implicit zero balance for a key that has never been adjusted.
    pub fn zero(key: StockKey, now: DateTime<Utc>) -> Self {
        Self {
            balance_id: BalanceId::new(),
            key,
            quantity: 0.0,
            reserved_quantity: 0.0,
            reorder_point: 0.0,
            reorder_quantity: 0.0,
            last_counted_at: None,
            updated_at: now,
        }
    }

    pub fn available_quantity(&self) -> f64 {
        self.quantity - self.reserved_quantity
    }

    /// Low stock means at or below a configured (positive) reorder point.
    pub fn is_low_stock(&self) -> bool {
        self.reorder_point > 0.0 && self.available_quantity() <= self.reorder_point
    }
}
