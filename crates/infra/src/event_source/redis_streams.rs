//! Redis Streams-backed order event source (durable, at-least-once delivery).
//!
//! - **Stream key**: `orders.events` by default, one entry per upstream event
//! - **Field**: `payload` holds the JSON envelope
//! - **Consumer group**: one per consuming service (`inventory`)
//! - **Redelivery**: the consumer first re-reads its own pending (delivered,
//!   never acknowledged) entries, then switches to new ones
//! - **Takeover**: entries left pending on another consumer for longer than
//!   `claim_idle` are claimed (`XPENDING` + `XCLAIM`) and replayed here
//!
//! Entries are read one at a time and acknowledged only after the ingester has
//! processed them, so at most one entry is in flight when the process stops.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use tracing::{debug, info, instrument, warn};

use stockledger_events::{EventSource, SourceError, SourceMessage};

/// Default stream key for order events
pub const DEFAULT_STREAM_KEY: &str = "orders.events";

/// Default idle time before another consumer's pending entry is taken over
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// Blocking timeout for one XREADGROUP call
const DEFAULT_BLOCK_MS: usize = 1000;

/// Pending entries inspected per takeover pass
const CLAIM_SCAN_COUNT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

impl From<RedisStreamsError> for SourceError {
    fn from(err: RedisStreamsError) -> Self {
        SourceError::Read(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    /// Own pending entries after the given id (`0` = from the start).
    Backlog(String),
    /// Never-delivered entries (`>`).
    New,
}

impl Cursor {
    fn id(&self) -> &str {
        match self {
            Cursor::Backlog(after) => after,
            Cursor::New => ">",
        }
    }
}

/// One consumer in a Redis Streams consumer group.
pub struct RedisStreamsSource {
    conn: ConnectionManager,
    stream_key: String,
    group_name: String,
    consumer_name: String,
    block_ms: usize,
    claim_idle: Duration,
    last_claim: Option<Instant>,
    cursor: Cursor,
}

impl core::fmt::Debug for RedisStreamsSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsSource")
            .field("stream_key", &self.stream_key)
            .field("group_name", &self.group_name)
            .field("consumer_name", &self.consumer_name)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsSource {
    /// Connect and make sure the consumer group exists.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379/0")
    /// * `stream_key` - Stream to consume (e.g., "orders.events")
    /// * `group_name` - Consumer group (e.g., "inventory")
    /// * `consumer_name` - Stable name of this consumer within the group
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group_name: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let source = Self {
            conn,
            stream_key: stream_key.into(),
            group_name: group_name.into(),
            consumer_name: consumer_name.into(),
            block_ms: DEFAULT_BLOCK_MS,
            claim_idle: DEFAULT_CLAIM_IDLE,
            last_claim: None,
            cursor: Cursor::Backlog("0".to_string()),
        };
        source.ensure_consumer_group().await?;
        info!(
            stream_key = %source.stream_key,
            group = %source.group_name,
            consumer = %source.consumer_name,
            "subscribed to order stream"
        );
        Ok(source)
    }

    /// Override how long an entry must sit pending on another consumer before
    /// it is taken over.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream if needed; starting at `0` means a new
    /// group sees the whole retained history.
    pub async fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group_name, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }

    /// Append a raw event (used by tooling and local smoke tests).
    #[instrument(skip(self, payload), fields(stream_key = %self.stream_key), err)]
    pub async fn publish(&self, payload: &str) -> Result<String, RedisStreamsError> {
        let mut conn = self.conn.clone();
        conn.xadd(&self.stream_key, "*", &[("payload", payload)])
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))
    }

    /// Move entries idle on other consumers into this consumer's pending list.
    ///
    /// Returns how many were claimed; they are then read through the backlog
    /// cursor like any other own pending entry.
    pub async fn claim_idle_entries(&mut self) -> Result<usize, RedisStreamsError> {
        let pending: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.stream_key, &self.group_name, "-", "+", CLAIM_SCAN_COUNT)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {}", e)))?;

        let idle_ms = self.claim_idle.as_millis();
        let ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != self.consumer_name)
            .filter(|p| p.last_delivered_ms as u128 >= idle_ms)
            .map(|p| p.id)
            .collect();
        self.last_claim = Some(Instant::now());
        if ids.is_empty() {
            return Ok(0);
        }

        let min_idle = usize::try_from(idle_ms).unwrap_or(usize::MAX);
        let claimed: StreamClaimReply = self
            .conn
            .xclaim(&self.stream_key, &self.group_name, &self.consumer_name, min_idle, ids.as_slice())
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {}", e)))?;

        let count = claimed.ids.len();
        if count > 0 {
            info!(consumer = %self.consumer_name, claimed = count, "took over idle pending entries");
            self.cursor = Cursor::Backlog("0".to_string());
        }
        Ok(count)
    }

    fn claim_due(&self) -> bool {
        self.last_claim.is_none_or(|at| at.elapsed() >= self.claim_idle)
    }

    async fn read_one(&mut self) -> Result<Option<SourceMessage>, RedisStreamsError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group_name, &self.consumer_name)
            .count(1);
        if self.cursor == Cursor::New {
            opts = opts.block(self.block_ms);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream_key], &[self.cursor.id()], &opts)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {}", e)))?;

        let entry: Option<StreamId> = reply
            .and_then(|r| r.keys.into_iter().flat_map(|k| k.ids).next());

        match (&self.cursor, entry) {
            (Cursor::Backlog(_), None) => {
                debug!(consumer = %self.consumer_name, "pending backlog drained");
                self.cursor = Cursor::New;
                Ok(None)
            }
            (Cursor::Backlog(_), Some(entry)) => {
                self.cursor = Cursor::Backlog(entry.id.clone());
                Ok(Some(to_message(entry)))
            }
            (Cursor::New, entry) => Ok(entry.map(to_message)),
        }
    }
}

/// Entries without a `payload` field come through empty and fail decoding.
fn to_message(entry: StreamId) -> SourceMessage {
    let payload: Vec<u8> = entry.get("payload").unwrap_or_default();
    if payload.is_empty() {
        warn!(message_id = %entry.id, "stream entry has no payload field");
    }
    SourceMessage::new(entry.id, payload)
}

#[async_trait]
impl EventSource for RedisStreamsSource {
    async fn next_message(&mut self) -> Result<SourceMessage, SourceError> {
        loop {
            if self.claim_due() {
                if let Err(err) = self.claim_idle_entries().await {
                    warn!(consumer = %self.consumer_name, error = %err, "idle entry takeover failed");
                }
            }
            if let Some(message) = self.read_one().await? {
                return Ok(message);
            }
        }
    }

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), SourceError> {
        let acked: i64 = self
            .conn
            .xack(&self.stream_key, &self.group_name, &[message_id])
            .await
            .map_err(|e| SourceError::Ack(format!("XACK failed: {}", e)))?;
        if acked == 0 {
            debug!(message_id, "entry was not pending; already acknowledged");
        }
        Ok(())
    }
}
