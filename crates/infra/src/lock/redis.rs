//! Redis-backed lock coordinator.
//!
//! - Acquire: `SET name token NX PX lease_ms`
//! - Release: Lua compare-and-delete, atomic on the server

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument};

use super::{LockCoordinator, LockError};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Lock coordinator over a shared Redis connection manager.
///
/// Clones share the same underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisLockCoordinator {
    conn: ConnectionManager,
    release: redis::Script,
}

impl core::fmt::Debug for RedisLockCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLockCoordinator").finish_non_exhaustive()
    }
}

impl RedisLockCoordinator {
    /// Connect to Redis (e.g. "redis://localhost:6379/0").
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockCoordinator for RedisLockCoordinator {
    #[instrument(skip(self, token), fields(lock = %name), err)]
    async fn acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);

        // Nil reply means the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(reply.is_some())
    }

    #[instrument(skip(self, token), fields(lock = %name), err)]
    async fn release(&self, name: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if deleted == 0 {
            debug!(lock = %name, "lease already expired or taken over; nothing released");
        }
        Ok(())
    }
}

fn map_redis_error(err: redis::RedisError) -> LockError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        LockError::Unavailable(err.to_string())
    } else {
        LockError::Command(err.to_string())
    }
}
