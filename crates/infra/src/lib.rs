//! Infrastructure layer: lock coordination, ledger storage, the adjustment
//! engine, upstream event ingestion and configuration.

pub mod config;
pub mod engine;
pub mod event_source;
pub mod ingester;
pub mod ledger;
pub mod lock;
pub mod outbound;

mod integration_tests;

pub use config::{AppConfig, ConfigError, StorageBackend};
pub use engine::{AdjustError, AdjustOutcome, AdjustmentEngine, EngineConfig, LeaseGuard};
pub use ingester::{
    IngestStats, IngesterConfig, IngesterHandle, IngesterState, InventoryIngester, sale_reference,
};
pub use ledger::{InMemoryLedgerStore, LedgerError, LedgerStore, PostgresLedgerStore};
pub use lock::{InMemoryLockCoordinator, Lease, LockCoordinator, LockError};
pub use outbound::{
    LogSink, NotificationSink, OutboundConfig, OutboundQueue, OutboundStats, OutboundWorkerHandle,
    RetryPolicy, StockChanged,
};
