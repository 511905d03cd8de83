//! Outbound stock-change notifications with retry and dead-lettering.
//!
//! The engine submits a [`StockChanged`] after each committed adjustment. A
//! background worker drains the bounded queue and hands each notification to a
//! [`NotificationSink`] under a [`RetryPolicy`]. Submission never blocks and
//! never fails the adjustment that produced it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use stockledger_core::{MovementId, StockKey};
use stockledger_inventory::{MovementRecord, MovementType, StockBalance};

/// A committed change to one balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockChanged {
    pub key: StockKey,
    pub movement_id: MovementId,
    pub movement_type: MovementType,
    pub quantity_change: f64,
    pub quantity_after: f64,
    pub available_quantity: f64,
    pub occurred_at: DateTime<Utc>,
}

impl StockChanged {
    pub fn from_commit(balance: &StockBalance, movement: &MovementRecord) -> Self {
        Self {
            key: balance.key.clone(),
            movement_id: movement.movement_id,
            movement_type: movement.movement_type,
            quantity_change: movement.quantity_change,
            quantity_after: movement.quantity_after,
            available_quantity: balance.available_quantity(),
            occurred_at: movement.created_at,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct SinkError(pub String);

/// Downstream consumer of stock changes (cache invalidation, search sync).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &StockChanged) -> Result<(), SinkError>;
}

/// Sink that only logs; the default when nothing else is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &StockChanged) -> Result<(), SinkError> {
        info!(
            key = %notification.key,
            movement_id = %notification.movement_id,
            quantity_after = notification.quantity_after,
            "stock changed"
        );
        Ok(())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt-1), capped at `max_delay`
    #[default]
    Exponential,
}

/// Retry policy for one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first (minimum 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Pause before retrying after failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub capacity: usize,
    pub retry: RetryPolicy,
    /// Name for logging
    pub name: String,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retry: RetryPolicy::default(),
            name: "outbound-notifications".to_string(),
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboundStats {
    pub submitted: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub retries: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

/// Producer side of the notification queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<StockChanged>,
    stats: Arc<Mutex<OutboundStats>>,
}

/// Handle to stop the worker and read its statistics.
#[derive(Debug)]
pub struct OutboundWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<OutboundStats>>,
}

impl OutboundQueue {
    /// Spawn the delivery worker on the current tokio runtime.
    pub fn spawn(
        sink: Arc<dyn NotificationSink>,
        config: OutboundConfig,
    ) -> (OutboundQueue, OutboundWorkerHandle) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(OutboundStats::default()));

        let join = tokio::spawn(worker_loop(sink, config, rx, shutdown_rx, stats.clone()));

        (
            OutboundQueue {
                tx,
                stats: stats.clone(),
            },
            OutboundWorkerHandle {
                shutdown: shutdown_tx,
                join: Some(join),
                stats,
            },
        )
    }

    /// Enqueue without waiting. Failures are counted and returned, never retried.
    pub fn submit(&self, notification: StockChanged) -> Result<(), SubmitError> {
        let result = self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        });
        let accepted = result.is_ok();
        update_stats(&self.stats, |s| {
            if accepted {
                s.submitted += 1;
            } else {
                s.rejected += 1;
            }
        });
        result
    }

    pub fn stats(&self) -> OutboundStats {
        read_stats(&self.stats)
    }
}

impl OutboundWorkerHandle {
    /// Stop accepting new work, deliver what is already queued, then join.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "outbound worker panicked");
            }
        }
    }

    pub fn stats(&self) -> OutboundStats {
        read_stats(&self.stats)
    }
}

async fn worker_loop(
    sink: Arc<dyn NotificationSink>,
    config: OutboundConfig,
    mut rx: mpsc::Receiver<StockChanged>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<OutboundStats>>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(notification) => deliver_with_retry(&*sink, &config, &notification, &stats).await,
                None => return,
            },
        }
    }

    rx.close();
    while let Some(notification) = rx.recv().await {
        deliver_with_retry(&*sink, &config, &notification, &stats).await;
    }
    debug!(worker = %config.name, "outbound worker stopped");
}

async fn deliver_with_retry(
    sink: &dyn NotificationSink,
    config: &OutboundConfig,
    notification: &StockChanged,
    stats: &Mutex<OutboundStats>,
) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sink.deliver(notification).await {
            Ok(()) => {
                update_stats(stats, |s| s.delivered += 1);
                return;
            }
            Err(err) if config.retry.should_retry(attempt) => {
                warn!(
                    worker = %config.name,
                    key = %notification.key,
                    attempt,
                    error = %err,
                    "notification delivery failed; retrying"
                );
                update_stats(stats, |s| s.retries += 1);
                tokio::time::sleep(config.retry.delay_after(attempt)).await;
            }
            Err(err) => {
                error!(
                    worker = %config.name,
                    key = %notification.key,
                    movement_id = %notification.movement_id,
                    attempts = attempt,
                    error = %err,
                    "notification dead-lettered"
                );
                update_stats(stats, |s| s.dead_lettered += 1);
                return;
            }
        }
    }
}

fn update_stats(stats: &Mutex<OutboundStats>, f: impl FnOnce(&mut OutboundStats)) {
    let mut guard = stats.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard);
}

fn read_stats(stats: &Mutex<OutboundStats>) -> OutboundStats {
    stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
}
