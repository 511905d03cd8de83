//! End-to-end scenarios over the in-memory lock coordinator and ledger.
//!
//! Paths: HTTP-style direct calls and the event ingester → AdjustmentEngine →
//! LedgerStore, plus the outbound notification queue.
//!
//! Verifies:
//! - Same-key adjustments are serialized and the movement chain is unbroken
//! - Rejections and write failures leave no trace and always release the lease
//! - Redelivered orders are not applied twice

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use stockledger_core::{MerchantId, ProductId, StockKey, StoreId, VariantId};
    use stockledger_events::{InMemoryEventSource, InMemorySourceHandle};
    use stockledger_inventory::{AdjustmentRequest, MovementRecord, MovementType};

    use crate::engine::{AdjustError, AdjustmentEngine, EngineConfig};
    use crate::ingester::{IngesterConfig, InventoryIngester, SALE_REFERENCE_TYPE, sale_reference};
    use crate::ledger::{InMemoryLedgerStore, LedgerStore};
    use crate::lock::{InMemoryLockCoordinator, LockCoordinator};
    use crate::outbound::{
        NotificationSink, OutboundConfig, OutboundQueue, RetryPolicy, SinkError, StockChanged,
    };

    struct Harness {
        engine: Arc<AdjustmentEngine>,
        locks: Arc<InMemoryLockCoordinator>,
        ledger: Arc<InMemoryLedgerStore>,
    }

    /// Generous attempts so contention in tests never surfaces as `Busy`.
    fn patient() -> EngineConfig {
        EngineConfig {
            lease: Duration::from_secs(5),
            max_attempts: 500,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn harness(config: EngineConfig) -> Harness {
        let locks = Arc::new(InMemoryLockCoordinator::new());
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let engine = Arc::new(AdjustmentEngine::new(locks.clone(), ledger.clone(), config));
        Harness {
            engine,
            locks,
            ledger,
        }
    }

    fn key(product: &str, store: Option<&str>) -> StockKey {
        StockKey::new(MerchantId::new("m1"), store.map(StoreId::new), ProductId::new(product), None)
    }

    fn assert_unbroken_chain(movements: &[MovementRecord]) {
        let mut previous_after = 0.0;
        for m in movements {
            assert_eq!(m.quantity_before, previous_after, "chain broken at {}", m.movement_id);
            assert_eq!(m.quantity_after, m.quantity_before + m.quantity_change);
            previous_after = m.quantity_after;
        }
    }

    fn order_event(order_id: &str, store_id: &str, items: serde_json::Value) -> String {
        json!({
            "event_id": format!("evt-{order_id}"),
            "event_type": "OrderCreated",
            "timestamp": "2024-05-01T10:00:00Z",
            "payload": {"id": order_id, "merchant_id": "m1", "store_id": store_id, "items": items}
        })
        .to_string()
    }

    async fn ingest(h: &Harness, publish: impl FnOnce(&InMemorySourceHandle)) -> Vec<String> {
        let (source, handle) = InMemoryEventSource::new();
        publish(&handle);
        let acks = handle.ack_log();
        drop(handle);

        let config = IngesterConfig {
            retry_delay: Duration::from_millis(1),
            name: "it-ingester".to_string(),
        };
        InventoryIngester::new(source, h.engine.clone(), config)
            .spawn()
            .join()
            .await;
        acks.ids()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_concurrent_deductions_from_ten() {
        let h = harness(patient());
        let k = key("p1", Some("s1"));
        h.engine.adjust(AdjustmentRequest::new(k.clone(), 10.0, "receive")).await.unwrap();

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let engine = h.engine.clone();
                let k = k.clone();
                tokio::spawn(async move { engine.adjust(AdjustmentRequest::new(k, -4.0, "pick")).await })
            })
            .collect();

        let mut ok = 0;
        let mut insufficient = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AdjustError::InsufficientStock { available, requested }) => {
                    assert_eq!(available, 2.0);
                    assert_eq!(requested, 4.0);
                    insufficient += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((ok, insufficient), (2, 1));

        let balance = h.ledger.get_balance(&k).await.unwrap().unwrap();
        assert_eq!(balance.quantity, 2.0);

        let movements = h.ledger.movements_for(&k).await;
        let deductions: Vec<_> = movements.iter().skip(1).collect();
        assert_eq!(deductions.len(), 2);
        assert_eq!(deductions.iter().map(|m| m.quantity_change).sum::<f64>(), -8.0);
        assert_unbroken_chain(&movements);
        assert_eq!(h.locks.active_leases(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_key_changes_sum_exactly() {
        let h = harness(patient());
        let k = key("p1", None);
        let changes: Vec<f64> = (0..40).map(|i| if i % 3 == 0 { -2.5 } else { 1.5 }).collect();

        let tasks: Vec<_> = changes
            .iter()
            .map(|&change| {
                let engine = h.engine.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    engine
                        .adjust(AdjustmentRequest::new(k, change, "mixed"))
                        .await
                        .map(|_| change)
                })
            })
            .collect();

        let mut accepted = 0.0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(change) => accepted += change,
                Err(AdjustError::InsufficientStock { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let movements = h.ledger.movements_for(&k).await;
        let final_quantity = h.ledger.get_balance(&k).await.unwrap().map(|b| b.quantity).unwrap_or(0.0);
        assert_eq!(final_quantity, accepted);
        assert!(final_quantity >= 0.0);
        assert_unbroken_chain(&movements);
        assert_eq!(movements.last().map(|m| m.quantity_after).unwrap_or(0.0), final_quantity);
    }

    #[tokio::test]
    async fn different_keys_never_block_each_other() {
        let h = harness(EngineConfig {
            max_attempts: 1,
            ..EngineConfig::default()
        });
        let scoped = key("p1", Some("s1"));
        assert!(h
            .locks
            .acquire(&scoped.lock_name(), "long-running", Duration::from_secs(5))
            .await
            .unwrap());

        // Unscoped, other store, and a variant of the same product are all distinct.
        let mut variant = scoped.clone();
        variant.variant_id = Some(VariantId::new("red"));
        for other in [key("p1", None), key("p1", Some("s2")), key("p2", Some("s1")), variant] {
            h.engine
                .adjust(AdjustmentRequest::new(other, 1.0, "receive"))
                .await
                .unwrap();
        }

        let err = h
            .engine
            .adjust(AdjustmentRequest::new(scoped, 1.0, "receive"))
            .await
            .unwrap_err();
        assert_eq!(err, AdjustError::Busy);
    }

    #[tokio::test]
    async fn stale_token_release_never_clears_a_newer_lease() {
        let locks = Arc::new(InMemoryLockCoordinator::new());
        let coordinator: Arc<dyn LockCoordinator> = locks.clone();
        let name = key("p1", None).lock_name();

        assert!(coordinator.acquire(&name, "first", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(coordinator.acquire(&name, "second", Duration::from_secs(5)).await.unwrap());

        coordinator.release(&name, "first").await.unwrap();
        assert_eq!(locks.holder(&name).as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn zero_change_appends_exactly_one_movement() {
        let h = harness(EngineConfig::default());
        let k = key("p1", None);
        h.engine.adjust(AdjustmentRequest::new(k.clone(), 4.0, "seed")).await.unwrap();

        let balance = h
            .engine
            .adjust(AdjustmentRequest::new(k.clone(), 0.0, "cycle count"))
            .await
            .unwrap();
        assert_eq!(balance.quantity, 4.0);

        let movements = h.ledger.movements_for(&k).await;
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[1].quantity_change, 0.0);
        assert_eq!(movements[1].quantity_before, movements[1].quantity_after);
    }

    #[tokio::test]
    async fn write_failure_leaves_no_partial_state_and_releases_the_lease() {
        let h = harness(EngineConfig::default());
        let k = key("p1", Some("s1"));
        h.engine.adjust(AdjustmentRequest::new(k.clone(), 3.0, "seed")).await.unwrap();

        h.ledger.set_fail_writes(true);
        let err = h
            .engine
            .adjust(AdjustmentRequest::new(k.clone(), -1.0, "pick"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdjustError::Backend(_)));
        assert_eq!(h.ledger.get_balance(&k).await.unwrap().unwrap().quantity, 3.0);
        assert_eq!(h.ledger.movements_for(&k).await.len(), 1);
        assert_eq!(h.locks.active_leases(), 0);

        h.ledger.set_fail_writes(false);
        let balance = h
            .engine
            .adjust(AdjustmentRequest::new(k.clone(), -1.0, "pick"))
            .await
            .unwrap();
        assert_eq!(balance.quantity, 2.0);
    }

    #[tokio::test]
    async fn rejected_adjustment_leaves_balance_and_log_unchanged() {
        let h = harness(EngineConfig::default());
        let k = key("p1", None);
        let err = h
            .engine
            .adjust(AdjustmentRequest::new(k.clone(), -0.5, "oversell"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdjustError::InsufficientStock { .. }));
        assert!(h.ledger.get_balance(&k).await.unwrap().is_none());
        assert_eq!(h.ledger.movement_count().await, 0);
    }

    #[tokio::test]
    async fn order_with_insufficient_second_item_applies_the_first_and_moves_on() {
        let h = harness(EngineConfig::default());
        let a = key("pa", Some("s1"));
        let b = key("pb", Some("s1"));
        let c = key("pc", None);
        h.engine.adjust(AdjustmentRequest::new(a.clone(), 5.0, "seed")).await.unwrap();
        h.engine.adjust(AdjustmentRequest::new(b.clone(), 1.0, "seed")).await.unwrap();
        h.engine.adjust(AdjustmentRequest::new(c.clone(), 2.0, "seed")).await.unwrap();

        let acked = ingest(&h, |src| {
            src.publish(order_event(
                "o-1",
                "s1",
                json!([{"product_id": "pa", "quantity": 2}, {"product_id": "pb", "quantity": 3}]),
            ));
            // Empty store id means unscoped.
            src.publish(order_event("o-2", "", json!([{"product_id": "pc", "quantity": 1}])));
        })
        .await;
        assert_eq!(acked.len(), 2);

        assert_eq!(h.ledger.get_balance(&a).await.unwrap().unwrap().quantity, 3.0);
        assert_eq!(h.ledger.get_balance(&b).await.unwrap().unwrap().quantity, 1.0);
        assert_eq!(h.ledger.get_balance(&c).await.unwrap().unwrap().quantity, 1.0);

        let sales_b = h.ledger.movements_for(&b).await;
        assert!(sales_b.iter().all(|m| m.movement_type != MovementType::Sale));
        let sale_a = h
            .ledger
            .find_movement_by_reference(&a, SALE_REFERENCE_TYPE, &sale_reference("o-1", 1))
            .await
            .unwrap();
        assert_eq!(sale_a.map(|m| m.quantity_change), Some(-2.0));
    }

    #[tokio::test]
    async fn redelivered_order_is_not_deducted_twice() {
        let h = harness(EngineConfig::default());
        let k = key("p1", Some("s1"));
        h.engine.adjust(AdjustmentRequest::new(k.clone(), 10.0, "seed")).await.unwrap();

        let event = order_event("o-9", "s1", json!([{"product_id": "p1", "quantity": 4}]));
        let acked = ingest(&h, |src| {
            src.publish(event.clone());
            src.publish(event.clone());
        })
        .await;
        assert_eq!(acked.len(), 2);

        assert_eq!(h.ledger.get_balance(&k).await.unwrap().unwrap().quantity, 6.0);
        let sales: Vec<_> = h
            .ledger
            .movements_for(&k)
            .await
            .into_iter()
            .filter(|m| m.movement_type == MovementType::Sale)
            .collect();
        assert_eq!(sales.len(), 1);
    }

    #[tokio::test]
    async fn direct_call_with_known_reference_returns_current_balance() {
        let h = harness(EngineConfig::default());
        let k = key("p1", None);
        let request = AdjustmentRequest::new(k.clone(), 5.0, "receive")
            .with_reference(Some("purchase_order".into()), Some("po-1".into()));

        h.engine.adjust(request.clone()).await.unwrap();
        let again = h.engine.adjust(request).await.unwrap();
        assert_eq!(again.quantity, 5.0);
        assert_eq!(h.ledger.movements_for(&k).await.len(), 1);
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<StockChanged>>);

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &StockChanged) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn committed_adjustments_are_published_outbound() {
        let sink = Arc::new(RecordingSink::default());
        let (queue, worker) = OutboundQueue::spawn(
            sink.clone(),
            OutboundConfig {
                capacity: 16,
                retry: RetryPolicy::fixed(1, Duration::from_millis(1)),
                name: "it-outbound".to_string(),
            },
        );
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let engine = AdjustmentEngine::new(
            Arc::new(InMemoryLockCoordinator::new()),
            ledger.clone(),
            EngineConfig::default(),
        )
        .with_outbound(queue);

        let k = key("p1", None);
        engine.adjust(AdjustmentRequest::new(k.clone(), 2.0, "receive")).await.unwrap();
        assert!(engine.adjust(AdjustmentRequest::new(k.clone(), -9.0, "oversell")).await.is_err());
        worker.shutdown().await;

        let delivered = sink.0.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].key, k);
        assert_eq!(delivered[0].quantity_after, 2.0);
    }
}
