//! In-memory lock coordinator for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{LockCoordinator, LockError};

#[derive(Debug, Clone)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// Process-local coordinator with the same semantics as the Redis one.
///
/// Expired entries are treated as absent and overwritten lazily.
#[derive(Debug, Default)]
pub struct InMemoryLockCoordinator {
    held: Mutex<HashMap<String, Held>>,
    unavailable: AtomicBool,
}

impl InMemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`LockError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Token currently holding `name`, if the lease has not expired.
    pub fn holder(&self, name: &str) -> Option<String> {
        let held = self.held.lock().ok()?;
        held.get(name)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| h.token.clone())
    }

    /// Number of unexpired leases.
    pub fn active_leases(&self) -> usize {
        let now = Instant::now();
        self.held
            .lock()
            .map(|held| held.values().filter(|h| h.expires_at > now).count())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Unavailable("in-memory coordinator offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockCoordinator for InMemoryLockCoordinator {
    async fn acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        self.check_available()?;
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Command("lock table poisoned".to_string()))?;

        let now = Instant::now();
        if let Some(current) = held.get(name) {
            if current.expires_at > now {
                return Ok(false);
            }
        }
        held.insert(
            name.to_string(),
            Held {
                token: token.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, token: &str) -> Result<(), LockError> {
        self.check_available()?;
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Command("lock table poisoned".to_string()))?;

        if held.get(name).is_some_and(|h| h.token == token) {
            held.remove(name);
        }
        Ok(())
    }
}
