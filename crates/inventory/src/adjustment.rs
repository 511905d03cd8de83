use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{ActorId, DomainError, DomainResult, MovementId, StockKey};

use crate::balance::StockBalance;
use crate::movement::{MovementRecord, MovementType};

/// A request to change the on-hand quantity of one stock key.
///
/// Produced by both the synchronous entry point and the event ingester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub key: StockKey,
    pub quantity_change: f64,
    pub reason: String,
    pub movement_type: MovementType,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub actor_id: Option<ActorId>,
}

impl AdjustmentRequest {
    pub fn new(key: StockKey, quantity_change: f64, reason: impl Into<String>) -> Self {
        Self {
            key,
            quantity_change,
            reason: reason.into(),
            movement_type: MovementType::Adjustment,
            reference_type: None,
            reference_id: None,
            actor_id: None,
        }
    }

    pub fn with_movement_type(mut self, movement_type: MovementType) -> Self {
        self.movement_type = movement_type;
        self
    }

    /// Attach the originating document. Blank values are treated as absent.
    pub fn with_reference(
        mut self,
        reference_type: Option<String>,
        reference_id: Option<String>,
    ) -> Self {
        self.reference_type = reference_type.filter(|s| !s.trim().is_empty());
        self.reference_id = reference_id.filter(|s| !s.trim().is_empty());
        self
    }

    /// Attach the requesting actor. Blank and `unknown` actors are dropped.
    pub fn with_actor(mut self, actor_id: Option<ActorId>) -> Self {
        self.actor_id = actor_id.filter(|a| !a.is_blank() && a.as_str() != "unknown");
        self
    }

    /// Both reference parts, when the request is tied to an external document.
    pub fn reference(&self) -> Option<(&str, &str)> {
        match (&self.reference_type, &self.reference_id) {
            (Some(t), Some(id)) => Some((t.as_str(), id.as_str())),
            _ => None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.key.merchant_id.is_blank() {
            return Err(DomainError::validation("merchant_id cannot be empty"));
        }
        if self.key.product_id.is_blank() {
            return Err(DomainError::validation("product_id cannot be empty"));
        }
        if !self.quantity_change.is_finite() {
            return Err(DomainError::validation("quantity_change must be a finite number"));
        }
        Ok(())
    }
}

/// Result of planning an adjustment: the new balance and its audit record.
///
/// Both halves must be persisted together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentPlan {
    pub balance: StockBalance,
    pub movement: MovementRecord,
}

/// Decide the outcome of `request` against the current balance.
///
/// `current` is `None` for a key that has never been adjusted; it is treated as
/// an implicit zero balance. Rejections leave nothing to write.
pub fn plan_adjustment(
    current: Option<&StockBalance>,
    request: &AdjustmentRequest,
    now: DateTime<Utc>,
) -> DomainResult<AdjustmentPlan> {
    request.validate()?;

    let mut balance = match current {
        Some(existing) => {
            if existing.key != request.key {
                return Err(DomainError::invariant("balance key mismatch"));
            }
            existing.clone()
        }
        None => StockBalance::zero(request.key.clone(), now),
    };

    let quantity_before = balance.quantity;
    let quantity_after = quantity_before + request.quantity_change;
    if !quantity_after.is_finite() {
        return Err(DomainError::validation("resulting quantity is out of range"));
    }
    if quantity_after < 0.0 {
        return Err(DomainError::insufficient_stock(
            quantity_before,
            request.quantity_change,
        ));
    }

    balance.quantity = quantity_after;
    balance.updated_at = now;

    let movement = MovementRecord {
        movement_id: MovementId::new(),
        key: request.key.clone(),
        movement_type: request.movement_type,
        quantity_change: request.quantity_change,
        quantity_before,
        quantity_after,
        reference_type: request.reference_type.clone(),
        reference_id: request.reference_id.clone(),
        notes: request.reason.clone(),
        created_by: request.actor_id.clone(),
        created_at: now,
    };

    Ok(AdjustmentPlan { balance, movement })
}
