//! Durable balances and the append-only movement log.

use async_trait::async_trait;
use thiserror::Error;

use stockledger_core::{MerchantId, PageRequest, Paged, StockKey, StoreId};
use stockledger_inventory::{MovementFilter, MovementRecord, StockBalance};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A movement with the same key and reference is already recorded.
    #[error("duplicate movement: {0}")]
    Duplicate(String),

    #[error("ledger backend error: {0}")]
    Backend(String),

    /// A stored row could not be mapped back into the domain.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Storage for balances and movements.
///
/// `apply_adjustment` is the only mutation. Callers serialize writes per key
/// (via the lock coordinator); the store guarantees the pair is written
/// atomically.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_balance(&self, key: &StockKey) -> Result<Option<StockBalance>, LedgerError>;

    /// Upsert `balance` on its full key and append `movement`, all or nothing.
    async fn apply_adjustment(
        &self,
        balance: &StockBalance,
        movement: &MovementRecord,
    ) -> Result<(), LedgerError>;

    async fn find_movement_by_reference(
        &self,
        key: &StockKey,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Option<MovementRecord>, LedgerError>;

    /// Balances where `available <= reorder_point` and `reorder_point > 0`,
    /// newest update first.
    async fn list_low_stock(
        &self,
        merchant_id: &MerchantId,
        store_id: Option<&StoreId>,
        page: PageRequest,
    ) -> Result<Paged<StockBalance>, LedgerError>;

    /// Movements matching `filter`, newest first.
    async fn list_movements(
        &self,
        filter: &MovementFilter,
        page: PageRequest,
    ) -> Result<Paged<MovementRecord>, LedgerError>;
}
