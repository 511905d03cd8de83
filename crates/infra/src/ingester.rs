//! Event ingester: turns upstream `OrderCreated` events into sale adjustments.
//!
//! One cooperative loop per consumer. Shutdown is observed before each pull,
//! while a pull is blocked and while waiting to retry a transiently failed
//! item. A message is acknowledged only once every line item has been applied,
//! skipped as already recorded, or rejected for good; a message interrupted
//! mid-retry stays unacknowledged and is redelivered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use stockledger_core::{ActorId, StockKey};
use stockledger_events::{DomainEvent, EventSource, OrderCreated, SourceError, SourceMessage, decode};
use stockledger_inventory::{AdjustmentRequest, MovementType};

use crate::engine::{AdjustOutcome, AdjustmentEngine};

pub const SALE_REASON: &str = "Order Sale";
pub const SALE_REFERENCE_TYPE: &str = "sale";

/// Reference id recorded for one order line (1-based).
///
/// Lines are referenced individually so that two lines for the same stock key
/// are both deducted while a redelivered order is still deducted only once.
pub fn sale_reference(order_id: &str, line: usize) -> String {
    format!("{order_id}#{line}")
}

#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Pause before pulling again after a read failure, and before retrying an
    /// item that failed transiently.
    pub retry_delay: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            name: "inventory-ingester".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngesterState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub messages: u64,
    pub orders: u64,
    pub ignored: u64,
    pub decode_failures: u64,
    pub read_failures: u64,
    pub items_applied: u64,
    /// Lines whose reference was already recorded (redelivery).
    pub items_duplicate: u64,
    pub items_failed: u64,
    pub item_retries: u64,
}

#[derive(Debug)]
struct Shared {
    state: IngesterState,
    stats: IngestStats,
}

/// What became of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    /// Safe to acknowledge.
    Done,
    /// Shutdown arrived while an item was waiting to be retried.
    Interrupted,
}

pub struct InventoryIngester<S> {
    source: S,
    engine: Arc<AdjustmentEngine>,
    config: IngesterConfig,
    shared: Arc<Mutex<Shared>>,
}

/// Handle to stop a spawned ingester and observe its progress.
#[derive(Debug)]
pub struct IngesterHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    shared: Arc<Mutex<Shared>>,
}

impl IngesterHandle {
    /// Request shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) -> IngestStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "ingester task panicked");
            }
        }
        self.stats()
    }

    pub fn state(&self) -> IngesterState {
        lock_shared(&self.shared).state
    }

    pub fn stats(&self) -> IngestStats {
        lock_shared(&self.shared).stats.clone()
    }

    /// Wait until the loop stops on its own (source closed).
    pub async fn join(mut self) -> IngestStats {
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "ingester task panicked");
            }
        }
        self.stats()
    }
}

impl<S> InventoryIngester<S>
where
    S: EventSource + 'static,
{
    pub fn new(source: S, engine: Arc<AdjustmentEngine>, config: IngesterConfig) -> Self {
        Self {
            source,
            engine,
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: IngesterState::Stopped,
                stats: IngestStats::default(),
            })),
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> IngesterHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        IngesterHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            shared,
        }
    }

    /// Consume until `shutdown` flips to true (or its sender is dropped), or
    /// until the source closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.set_state(IngesterState::Running);
        info!(ingester = %self.config.name, "inventory ingester started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                next = self.source.next_message() => next,
            };

            match next {
                Ok(message) => {
                    if self.handle_message(&message, &mut shutdown).await == Handled::Interrupted {
                        info!(
                            ingester = %self.config.name,
                            message_id = %message.id,
                            "stopping with message unacknowledged; it will be redelivered"
                        );
                        break;
                    }
                    if let Err(err) = self.source.acknowledge(&message.id).await {
                        warn!(
                            ingester = %self.config.name,
                            message_id = %message.id,
                            error = %err,
                            "failed to acknowledge message; it may be redelivered"
                        );
                    }
                }
                Err(SourceError::Closed) => {
                    info!(ingester = %self.config.name, "event source closed");
                    break;
                }
                Err(err) => {
                    warn!(ingester = %self.config.name, error = %err, "failed to read from event source");
                    self.bump(|s| s.read_failures += 1);
                    if !pause(self.config.retry_delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(IngesterState::Stopped);
        info!(ingester = %self.config.name, "inventory ingester stopped");
    }

    async fn handle_message(
        &mut self,
        message: &SourceMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Handled {
        self.bump(|s| s.messages += 1);
        match decode(&message.payload) {
            Ok(DomainEvent::OrderCreated { event_id, order }) => {
                self.bump(|s| s.orders += 1);
                self.apply_order(&event_id, &order, shutdown).await
            }
            Ok(DomainEvent::Ignored { event_type }) => {
                debug!(message_id = %message.id, event_type = %event_type, "ignoring event");
                self.bump(|s| s.ignored += 1);
                Handled::Done
            }
            Err(err) => {
                error!(message_id = %message.id, error = %err, "dropping undecodable event");
                self.bump(|s| s.decode_failures += 1);
                Handled::Done
            }
        }
    }

    /// One adjustment per line item; a rejected item never stops the rest.
    /// Busy keys and backend failures are retried until they resolve or
    /// shutdown is requested.
    #[instrument(skip(self, order, shutdown), fields(order_id = %order.id, items = order.items.len()))]
    async fn apply_order(
        &mut self,
        event_id: &str,
        order: &OrderCreated,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Handled {
        info!(event_id, "processing OrderCreated");

        for (index, item) in order.items.iter().enumerate() {
            let key = StockKey::new(order.merchant(), order.store(), item.product(), item.variant());
            let request = AdjustmentRequest::new(key, -item.quantity, SALE_REASON)
                .with_movement_type(MovementType::Sale)
                .with_reference(
                    Some(SALE_REFERENCE_TYPE.to_string()),
                    Some(sale_reference(&order.id, index + 1)),
                )
                .with_actor(Some(ActorId::system()));

            loop {
                match self.engine.apply(request.clone()).await {
                    Ok((balance, AdjustOutcome::Applied)) => {
                        debug!(product_id = %item.product_id, quantity = balance.quantity, "order item applied");
                        self.bump(|s| s.items_applied += 1);
                    }
                    Ok((_, AdjustOutcome::Duplicate)) => {
                        debug!(product_id = %item.product_id, line = index + 1, "order item already recorded");
                        self.bump(|s| s.items_duplicate += 1);
                    }
                    Err(err) if err.is_transient() => {
                        warn!(
                            order_id = %order.id,
                            product_id = %item.product_id,
                            error = %err,
                            "order item failed transiently; retrying"
                        );
                        self.bump(|s| s.item_retries += 1);
                        if !pause(self.config.retry_delay, shutdown).await {
                            return Handled::Interrupted;
                        }
                        continue;
                    }
                    Err(err) => {
                        error!(
                            order_id = %order.id,
                            product_id = %item.product_id,
                            error = %err,
                            "failed to adjust inventory for order item"
                        );
                        self.bump(|s| s.items_failed += 1);
                    }
                }
                break;
            }
        }
        Handled::Done
    }

    fn set_state(&self, state: IngesterState) {
        lock_shared(&self.shared).state = state;
    }

    fn bump(&self, f: impl FnOnce(&mut IngestStats)) {
        f(&mut lock_shared(&self.shared).stats);
    }
}

/// Sleep for `delay`; `false` if shutdown was requested meanwhile.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Resolves once shutdown is requested or the controlling sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::ledger::{InMemoryLedgerStore, LedgerStore};
    use crate::lock::InMemoryLockCoordinator;
    use serde_json::json;
    use stockledger_core::{MerchantId, ProductId, StoreId};
    use stockledger_events::InMemoryEventSource;

    fn engine() -> (Arc<AdjustmentEngine>, Arc<InMemoryLedgerStore>) {
        let (engine, _, ledger) = engine_with_locks();
        (engine, ledger)
    }

    fn engine_with_locks() -> (
        Arc<AdjustmentEngine>,
        Arc<InMemoryLockCoordinator>,
        Arc<InMemoryLedgerStore>,
    ) {
        let locks = Arc::new(InMemoryLockCoordinator::new());
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let engine = AdjustmentEngine::new(
            locks.clone(),
            ledger.clone(),
            EngineConfig {
                retry_delay: Duration::from_millis(1),
                ..EngineConfig::default()
            },
        );
        (Arc::new(engine), locks, ledger)
    }

    fn p1_key() -> StockKey {
        StockKey::new(MerchantId::new("m1"), Some(StoreId::new("s1")), ProductId::new("p1"), None)
    }

    fn order(id: &str, items: serde_json::Value) -> String {
        json!({
            "event_id": format!("e-{id}"),
            "event_type": "OrderCreated",
            "payload": {"id": id, "merchant_id": "m1", "store_id": "s1", "items": items}
        })
        .to_string()
    }

    fn fast() -> IngesterConfig {
        IngesterConfig {
            retry_delay: Duration::from_millis(5),
            name: "test-ingester".to_string(),
        }
    }

    #[tokio::test]
    async fn stops_when_source_closes_and_acks_everything() {
        let (engine, ledger) = engine();
        let key = StockKey::new(MerchantId::new("m1"), Some(StoreId::new("s1")), ProductId::new("p1"), None);
        engine.adjust(AdjustmentRequest::new(key.clone(), 5.0, "seed")).await.unwrap();

        let (source, handle) = InMemoryEventSource::new();
        let order = handle.publish(
            json!({
                "event_id": "e1",
                "event_type": "OrderCreated",
                "payload": {"id": "o1", "merchant_id": "m1", "store_id": "s1",
                            "items": [{"product_id": "p1", "quantity": 2}]}
            })
            .to_string(),
        );
        let garbage = handle.publish(b"{not json".to_vec());
        let other = handle.publish(json!({"event_type": "OrderCancelled"}).to_string());
        handle.fail_next_read("broker hiccup");
        let acks = handle.ack_log();
        drop(handle);

        let ingester = InventoryIngester::new(source, engine, fast()).spawn();
        let stats = ingester.join().await;

        assert_eq!(acks.ids(), vec![order, garbage, other]);
        assert_eq!(stats.orders, 1);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.read_failures, 1);
        assert_eq!(ledger.get_balance(&key).await.unwrap().unwrap().quantity, 3.0);

        let sale = ledger.movements_for(&key).await.pop().unwrap();
        assert_eq!(sale.movement_type, MovementType::Sale);
        assert_eq!(sale.notes, SALE_REASON);
        assert!(sale.has_reference(SALE_REFERENCE_TYPE, &sale_reference("o1", 1)));
        assert_eq!(sale.created_by, Some(ActorId::system()));
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_blocked_pull() {
        let (engine, _) = engine();
        let (source, _producer) = InMemoryEventSource::new();
        let ingester = InventoryIngester::new(source, engine, fast()).spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ingester.state(), IngesterState::Running);

        let stats = tokio::time::timeout(Duration::from_secs(1), ingester.shutdown())
            .await
            .expect("ingester did not stop");
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test]
    async fn same_product_on_two_lines_is_deducted_twice() {
        let (engine, ledger) = engine();
        engine.adjust(AdjustmentRequest::new(p1_key(), 10.0, "seed")).await.unwrap();

        let (source, handle) = InMemoryEventSource::new();
        let event = order(
            "o7",
            json!([{"product_id": "p1", "quantity": 2}, {"product_id": "p1", "quantity": 3}]),
        );
        handle.publish(event.clone());
        // Redelivery of the whole order changes nothing.
        handle.publish(event);
        drop(handle);

        let stats = InventoryIngester::new(source, engine, fast()).spawn().join().await;

        assert_eq!(ledger.get_balance(&p1_key()).await.unwrap().unwrap().quantity, 5.0);
        assert_eq!(stats.items_applied, 2);
        assert_eq!(stats.items_duplicate, 2);
        assert_eq!(stats.items_failed, 0);

        let lines: Vec<_> = ledger
            .movements_for(&p1_key())
            .await
            .into_iter()
            .filter(|m| m.movement_type == MovementType::Sale)
            .filter_map(|m| m.reference_id)
            .collect();
        assert_eq!(lines, vec![sale_reference("o7", 1), sale_reference("o7", 2)]);
    }

    #[tokio::test]
    async fn item_is_retried_until_the_lock_backend_recovers() {
        let (engine, locks, ledger) = engine_with_locks();
        engine.adjust(AdjustmentRequest::new(p1_key(), 10.0, "seed")).await.unwrap();
        locks.set_unavailable(true);

        let (source, handle) = InMemoryEventSource::new();
        let id = handle.publish(order("o8", json!([{"product_id": "p1", "quantity": 2}])));
        let acks = handle.ack_log();
        let ingester = InventoryIngester::new(source, engine, fast()).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(acks.ids().is_empty());
        assert!(ingester.stats().item_retries > 0);

        locks.set_unavailable(false);
        drop(handle);
        let stats = ingester.join().await;

        assert_eq!(acks.ids(), vec![id]);
        assert_eq!(stats.items_applied, 1);
        assert_eq!(stats.items_failed, 0);
        assert_eq!(ledger.get_balance(&p1_key()).await.unwrap().unwrap().quantity, 8.0);
    }

    #[tokio::test]
    async fn shutdown_while_retrying_leaves_the_message_unacknowledged() {
        let (engine, locks, ledger) = engine_with_locks();
        locks.set_unavailable(true);

        let (source, handle) = InMemoryEventSource::new();
        handle.publish(order("o9", json!([{"product_id": "p1", "quantity": 1}])));
        let acks = handle.ack_log();
        let ingester = InventoryIngester::new(source, engine, fast()).spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = tokio::time::timeout(Duration::from_secs(1), ingester.shutdown())
            .await
            .expect("ingester did not stop");

        assert!(acks.ids().is_empty());
        assert_eq!(stats.items_applied, 0);
        assert_eq!(ledger.movement_count().await, 0);
    }

    /// A source that may move between threads but is not shareable.
    struct SendOnlySource {
        inner: InMemoryEventSource,
        _not_sync: std::cell::Cell<()>,
    }

    #[async_trait::async_trait]
    impl EventSource for SendOnlySource {
        async fn next_message(&mut self) -> Result<SourceMessage, SourceError> {
            self.inner.next_message().await
        }

        async fn acknowledge(&mut self, message_id: &str) -> Result<(), SourceError> {
            self.inner.acknowledge(message_id).await
        }
    }

    #[tokio::test]
    async fn runs_over_a_source_that_is_send_but_not_sync() {
        let (engine, ledger) = engine();
        engine.adjust(AdjustmentRequest::new(p1_key(), 3.0, "seed")).await.unwrap();

        let (inner, handle) = InMemoryEventSource::new();
        handle.publish(order("o10", json!([{"product_id": "p1", "quantity": 1}])));
        drop(handle);

        let source = SendOnlySource {
            inner,
            _not_sync: std::cell::Cell::new(()),
        };
        let stats = InventoryIngester::new(source, engine, fast()).spawn().join().await;

        assert_eq!(stats.items_applied, 1);
        assert_eq!(ledger.get_balance(&p1_key()).await.unwrap().unwrap().quantity, 2.0);
    }
}
