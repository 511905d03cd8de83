//! Per-key mutual exclusion with bounded leases.
//!
//! A lease is held under a lock name together with a random holder token. Only
//! the holder of the matching token may release it, so a caller whose lease
//! expired can never clear a lease that was granted to someone else since.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLockCoordinator;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockCoordinator;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("lock command failed: {0}")]
    Command(String),
}

/// Coordination store granting time-bounded leases.
///
/// Implementations must never report a lease as granted when the backend
/// failed; failures surface as [`LockError`].
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Set-if-absent with expiry. `Ok(false)` means someone else holds it.
    async fn acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool, LockError>;

    /// Clear the lease only if it is still held under `token`.
    async fn release(&self, name: &str, token: &str) -> Result<(), LockError>;
}

/// Identity of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub token: String,
    pub ttl: Duration,
}

impl Lease {
    /// Fresh lease request with a random holder token.
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            token: Uuid::new_v4().to_string(),
            ttl,
        }
    }
}
