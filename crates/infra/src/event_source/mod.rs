//! Upstream event stream transports.
//!
//! - `redis_streams`: Redis Streams consumer group (`XREADGROUP`/`XACK`)
//!
//! The in-memory source for tests lives in `stockledger-events`.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsSource};
