//! Adjustment engine: the only writer of the ledger.
//!
//! Every mutation runs under a per-key lease:
//! 1. acquire the lease (bounded attempts, fixed pause)
//! 2. read the balance (zero if absent) and plan the change
//! 3. persist balance + movement atomically
//! 4. release the lease, on every exit path

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{Span, debug, info, instrument, warn};

use stockledger_core::{DomainError, StockKey};
use stockledger_inventory::{AdjustmentPlan, AdjustmentRequest, StockBalance, plan_adjustment};

use crate::ledger::{LedgerError, LedgerStore};
use crate::lock::{Lease, LockCoordinator, LockError};
use crate::outbound::{OutboundQueue, StockChanged};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdjustError {
    /// Another request holds the key; safe to retry.
    #[error("stock is being adjusted by another request; try again later")]
    Busy,

    /// `requested` is the quantity the change tried to remove.
    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: f64, requested: f64 },

    #[error("invalid adjustment: {0}")]
    Validation(String),

    #[error("inventory backend failure: {0}")]
    Backend(String),
}

impl AdjustError {
    /// Whether the same request may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdjustError::Busy | AdjustError::Backend(_))
    }
}

impl From<DomainError> for AdjustError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InsufficientStock { on_hand, change } => AdjustError::InsufficientStock {
                available: on_hand,
                requested: -change,
            },
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => AdjustError::Validation(msg),
            DomainError::InvariantViolation(msg) => AdjustError::Backend(msg),
        }
    }
}

impl From<LedgerError> for AdjustError {
    fn from(err: LedgerError) -> Self {
        AdjustError::Backend(err.to_string())
    }
}

/// Whether an accepted request wrote a new movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    Applied,
    /// The reference was already recorded; nothing was written.
    Duplicate,
}

impl AdjustOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustOutcome::Applied => "applied",
            AdjustOutcome::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub lease: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(5),
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Serializes adjustments per stock key and applies them to the ledger.
///
/// Shared as `Arc<AdjustmentEngine>` between the HTTP entry point and the
/// event ingester.
pub struct AdjustmentEngine {
    locks: Arc<dyn LockCoordinator>,
    ledger: Arc<dyn LedgerStore>,
    outbound: Option<OutboundQueue>,
    config: EngineConfig,
}

impl core::fmt::Debug for AdjustmentEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdjustmentEngine")
            .field("config", &self.config)
            .field("outbound", &self.outbound.is_some())
            .finish_non_exhaustive()
    }
}

impl AdjustmentEngine {
    pub fn new(
        locks: Arc<dyn LockCoordinator>,
        ledger: Arc<dyn LedgerStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            locks,
            ledger,
            outbound: None,
            config,
        }
    }

    /// Publish a [`StockChanged`] for every committed adjustment.
    pub fn with_outbound(mut self, outbound: OutboundQueue) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Current balance, or an unsaved zero projection for an unknown key.
    pub async fn balance(&self, key: &StockKey) -> Result<StockBalance, AdjustError> {
        Ok(self
            .ledger
            .get_balance(key)
            .await?
            .unwrap_or_else(|| StockBalance::zero(key.clone(), Utc::now())))
    }

    /// Apply one adjustment and return the resulting balance.
    ///
    /// A request whose `(key, reference_type, reference_id)` is already recorded
    /// is not applied again; the current balance is returned instead.
    pub async fn adjust(&self, request: AdjustmentRequest) -> Result<StockBalance, AdjustError> {
        self.apply(request).await.map(|(balance, _)| balance)
    }

    /// Like [`adjust`](Self::adjust), also reporting whether anything was written.
    #[instrument(
        skip(self, request),
        fields(
            key = %request.key,
            quantity_change = request.quantity_change,
            movement_type = %request.movement_type,
            outcome = tracing::field::Empty
        ),
        err
    )]
    pub async fn apply(
        &self,
        request: AdjustmentRequest,
    ) -> Result<(StockBalance, AdjustOutcome), AdjustError> {
        request.validate()?;

        let guard = self.acquire(&request.key).await?;
        let result = self.adjust_locked(&request).await;
        guard.release().await;

        if let Ok((_, outcome)) = &result {
            Span::current().record("outcome", outcome.as_str());
        }
        result
    }

    async fn acquire(&self, key: &StockKey) -> Result<LeaseGuard, AdjustError> {
        let lease = Lease::new(key.lock_name(), self.config.lease);
        let attempts = self.config.max_attempts.max(1);
        let mut last_error: Option<LockError> = None;
        let mut backend_failures = 0;

        for attempt in 1..=attempts {
            match self.locks.acquire(&lease.name, &lease.token, lease.ttl).await {
                Ok(true) => {
                    debug!(lock = %lease.name, attempt, "lease acquired");
                    return Ok(LeaseGuard::new(self.locks.clone(), lease));
                }
                Ok(false) => debug!(lock = %lease.name, attempt, "lease held elsewhere"),
                Err(err) => {
                    warn!(lock = %lease.name, attempt, error = %err, "lease acquisition failed");
                    backend_failures += 1;
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        match last_error {
            Some(err) if backend_failures == attempts => Err(AdjustError::Backend(err.to_string())),
            _ => Err(AdjustError::Busy),
        }
    }

    async fn adjust_locked(
        &self,
        request: &AdjustmentRequest,
    ) -> Result<(StockBalance, AdjustOutcome), AdjustError> {
        if let Some((reference_type, reference_id)) = request.reference() {
            let existing = self
                .ledger
                .find_movement_by_reference(&request.key, reference_type, reference_id)
                .await?;
            if let Some(movement) = existing {
                info!(
                    movement_id = %movement.movement_id,
                    reference_type,
                    reference_id,
                    "reference already applied; skipping"
                );
                return Ok((self.balance(&request.key).await?, AdjustOutcome::Duplicate));
            }
        }

        let current = self.ledger.get_balance(&request.key).await?;
        let plan = plan_adjustment(current.as_ref(), request, Utc::now())?;

        match self.ledger.apply_adjustment(&plan.balance, &plan.movement).await {
            Ok(()) => {}
            // Lost a race with a writer that bypassed our lease (or an expired one).
            Err(LedgerError::Duplicate(msg)) => {
                info!(reason = %msg, "reference recorded concurrently; skipping");
                return Ok((self.balance(&request.key).await?, AdjustOutcome::Duplicate));
            }
            Err(err) => return Err(err.into()),
        }

        self.notify(&plan);
        Ok((plan.balance, AdjustOutcome::Applied))
    }

    fn notify(&self, plan: &AdjustmentPlan) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        if let Err(err) = outbound.submit(StockChanged::from_commit(&plan.balance, &plan.movement)) {
            warn!(
                key = %plan.balance.key,
                movement_id = %plan.movement.movement_id,
                error = %err,
                "stock change notification not queued"
            );
        }
    }
}

/// Scoped ownership of one lease.
///
/// `release` clears it on the normal path. If the guard is dropped instead
/// (cancelled future, panic) a release is spawned onto the current runtime;
/// failing that, the lease simply expires.
#[must_use = "dropping the guard releases the lease"]
pub struct LeaseGuard {
    locks: Arc<dyn LockCoordinator>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    fn new(locks: Arc<dyn LockCoordinator>, lease: Lease) -> Self {
        Self {
            locks,
            lease: Some(lease),
        }
    }

    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            release_lease(self.locks.as_ref(), &lease).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let locks = self.locks.clone();
                handle.spawn(async move { release_lease(locks.as_ref(), &lease).await });
            }
            Err(_) => warn!(lock = %lease.name, "no runtime to release lease; it will expire"),
        }
    }
}

async fn release_lease(locks: &dyn LockCoordinator, lease: &Lease) {
    if let Err(err) = locks.release(&lease.name, &lease.token).await {
        warn!(lock = %lease.name, error = %err, "lease release failed; it will expire");
    }
}
