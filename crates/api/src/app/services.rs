use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use stockledger_infra::{
    AdjustmentEngine, AppConfig, EngineConfig, InMemoryLedgerStore, InMemoryLockCoordinator,
    IngestStats, IngesterHandle, LedgerError, LockError, LogSink, OutboundConfig, OutboundQueue,
    OutboundWorkerHandle, StorageBackend,
};

#[cfg(feature = "redis")]
use sqlx::postgres::PgPoolOptions;
#[cfg(feature = "redis")]
use stockledger_infra::{
    IngesterConfig, InventoryIngester, PostgresLedgerStore,
    event_source::{RedisStreamsError, RedisStreamsSource},
    lock::RedisLockCoordinator,
};

/// Everything the HTTP handlers need.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub engine: Arc<AdjustmentEngine>,
}

impl AppServices {
    pub fn new(engine: Arc<AdjustmentEngine>) -> Self {
        Self { engine }
    }

    /// In-process lock coordinator and ledger, no background workers.
    pub fn in_memory() -> Self {
        Self::in_memory_with(EngineConfig::default())
    }

    pub fn in_memory_with(config: EngineConfig) -> Self {
        let engine = AdjustmentEngine::new(
            Arc::new(InMemoryLockCoordinator::new()),
            Arc::new(InMemoryLedgerStore::new()),
            config,
        );
        Self::new(Arc::new(engine))
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    Database(String),

    #[error("ledger setup failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("lock coordinator setup failed: {0}")]
    Lock(#[from] LockError),

    #[error("order stream setup failed: {0}")]
    Stream(String),

    #[error("storage backend '{0}' requires the `redis` feature")]
    Unsupported(&'static str),
}

#[cfg(feature = "redis")]
impl From<RedisStreamsError> for BootstrapError {
    fn from(err: RedisStreamsError) -> Self {
        BootstrapError::Stream(err.to_string())
    }
}

/// Background workers started by [`bootstrap`].
#[derive(Debug, Default)]
pub struct Background {
    ingester: Option<IngesterHandle>,
    outbound: Option<OutboundWorkerHandle>,
}

impl Background {
    /// Stop the ingester first so no new adjustments are produced, then drain
    /// pending notifications.
    pub async fn shutdown(self) -> Option<IngestStats> {
        let stats = match self.ingester {
            Some(handle) => Some(handle.shutdown().await),
            None => None,
        };
        if let Some(outbound) = self.outbound {
            outbound.shutdown().await;
        }
        stats
    }
}

/// Wire the configured backends and start background workers.
pub async fn bootstrap(config: &AppConfig) -> Result<(AppServices, Background), BootstrapError> {
    let (outbound, outbound_handle) =
        OutboundQueue::spawn(Arc::new(LogSink), OutboundConfig::default());

    match config.storage_backend {
        StorageBackend::Memory => {
            info!("using in-memory ledger and lock coordinator");
            let engine = AdjustmentEngine::new(
                Arc::new(InMemoryLockCoordinator::new()),
                Arc::new(InMemoryLedgerStore::new()),
                config.engine.clone(),
            )
            .with_outbound(outbound);
            Ok((
                AppServices::new(Arc::new(engine)),
                Background {
                    ingester: None,
                    outbound: Some(outbound_handle),
                },
            ))
        }
        StorageBackend::Postgres => {
            bootstrap_persistent(config, outbound, outbound_handle).await
        }
    }
}

#[cfg(feature = "redis")]
async fn bootstrap_persistent(
    config: &AppConfig,
    outbound: OutboundQueue,
    outbound_handle: OutboundWorkerHandle,
) -> Result<(AppServices, Background), BootstrapError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| BootstrapError::Database(e.to_string()))?;

    let ledger = PostgresLedgerStore::new(pool);
    ledger.ensure_schema().await?;

    let locks = RedisLockCoordinator::connect(&config.redis_url).await?;

    let engine = Arc::new(
        AdjustmentEngine::new(Arc::new(locks), Arc::new(ledger), config.engine.clone())
            .with_outbound(outbound),
    );

    let source = RedisStreamsSource::connect(
        &config.redis_url,
        config.order_stream_key.clone(),
        config.order_consumer_group.clone(),
        config.order_consumer_name.clone(),
    )
    .await?
    .with_claim_idle(config.order_claim_idle);

    let ingester = InventoryIngester::new(
        source,
        engine.clone(),
        IngesterConfig {
            retry_delay: config.ingest_retry_delay,
            ..IngesterConfig::default()
        },
    )
    .spawn();

    info!(
        stream = %config.order_stream_key,
        group = %config.order_consumer_group,
        "postgres ledger and redis coordination ready"
    );

    Ok((
        AppServices::new(engine),
        Background {
            ingester: Some(ingester),
            outbound: Some(outbound_handle),
        },
    ))
}

#[cfg(not(feature = "redis"))]
async fn bootstrap_persistent(
    _config: &AppConfig,
    _outbound: OutboundQueue,
    outbound_handle: OutboundWorkerHandle,
) -> Result<(AppServices, Background), BootstrapError> {
    outbound_handle.shutdown().await;
    Err(BootstrapError::Unsupported("postgres"))
}
