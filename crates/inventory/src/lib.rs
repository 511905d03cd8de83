//! Inventory domain module.
//!
//! Business rules for stock balances and their movement log, implemented purely
//! as deterministic domain logic (no IO, no locking, no storage).

pub mod adjustment;
pub mod balance;
pub mod movement;

pub use adjustment::{AdjustmentPlan, AdjustmentRequest, plan_adjustment};
pub use balance::StockBalance;
pub use movement::{MovementFilter, MovementRecord, MovementType};
