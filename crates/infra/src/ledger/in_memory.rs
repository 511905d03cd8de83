//! In-memory ledger store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use stockledger_core::{MerchantId, PageRequest, Paged, StockKey, StoreId};
use stockledger_inventory::{MovementFilter, MovementRecord, StockBalance};

use super::{LedgerError, LedgerStore};

#[derive(Debug, Default)]
struct State {
    balances: HashMap<StockKey, StockBalance>,
    movements: Vec<MovementRecord>,
}

/// Ledger held in a single `RwLock`; each apply is one write-guarded step.
///
/// - No IO
/// - Same duplicate-reference rule as the Postgres schema
/// - Optional write failure injection for atomicity tests
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
    fail_writes: AtomicBool,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `apply_adjustment` fail without writing.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed or overwrite a balance directly (reorder points, fixtures).
    pub async fn put_balance(&self, balance: StockBalance) {
        let mut state = self.state.write().await;
        state.balances.insert(balance.key.clone(), balance);
    }

    /// Full movement history for one key in append order.
    pub async fn movements_for(&self, key: &StockKey) -> Vec<MovementRecord> {
        let state = self.state.read().await;
        state.movements.iter().filter(|m| &m.key == key).cloned().collect()
    }

    pub async fn movement_count(&self) -> usize {
        self.state.read().await.movements.len()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_balance(&self, key: &StockKey) -> Result<Option<StockBalance>, LedgerError> {
        Ok(self.state.read().await.balances.get(key).cloned())
    }

    async fn apply_adjustment(
        &self,
        balance: &StockBalance,
        movement: &MovementRecord,
    ) -> Result<(), LedgerError> {
        if balance.key != movement.key {
            return Err(LedgerError::Backend("balance and movement keys differ".to_string()));
        }

        let mut state = self.state.write().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Backend("injected write failure".to_string()));
        }

        if let (Some(t), Some(id)) = (&movement.reference_type, &movement.reference_id) {
            if state
                .movements
                .iter()
                .any(|m| m.key == movement.key && m.has_reference(t, id))
            {
                return Err(LedgerError::Duplicate(format!("{} {t}:{id}", movement.key)));
            }
        }

        // Keep the original row id on upsert.
        let mut stored = balance.clone();
        if let Some(existing) = state.balances.get(&balance.key) {
            stored.balance_id = existing.balance_id;
        }
        state.balances.insert(stored.key.clone(), stored);
        state.movements.push(movement.clone());
        Ok(())
    }

    async fn find_movement_by_reference(
        &self,
        key: &StockKey,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Option<MovementRecord>, LedgerError> {
        let state = self.state.read().await;
        Ok(state
            .movements
            .iter()
            .find(|m| &m.key == key && m.has_reference(reference_type, reference_id))
            .cloned())
    }

    async fn list_low_stock(
        &self,
        merchant_id: &MerchantId,
        store_id: Option<&StoreId>,
        page: PageRequest,
    ) -> Result<Paged<StockBalance>, LedgerError> {
        let state = self.state.read().await;
        let mut rows: Vec<StockBalance> = state
            .balances
            .values()
            .filter(|b| &b.key.merchant_id == merchant_id)
            .filter(|b| store_id.is_none() || b.key.store_id.as_ref() == store_id)
            .filter(|b| b.is_low_stock())
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(Paged::from_sorted(rows, page))
    }

    async fn list_movements(
        &self,
        filter: &MovementFilter,
        page: PageRequest,
    ) -> Result<Paged<MovementRecord>, LedgerError> {
        let state = self.state.read().await;
        // Newest first; ties keep reverse append order.
        let mut rows: Vec<MovementRecord> = state
            .movements
            .iter()
            .rev()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Paged::from_sorted(rows, page))
    }
}
