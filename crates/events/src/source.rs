//! Pull-based event stream abstraction (mechanics only).
//!
//! A source hands out one raw message at a time and is told when the consumer
//! is done with it. Delivery is at-least-once: a message that was read but never
//! acknowledged (crash, shutdown mid-pull) may be delivered again, so consumers
//! must tolerate duplicates.

use async_trait::async_trait;
use thiserror::Error;

/// One raw message pulled from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    /// Transport-assigned id, used for acknowledgement.
    pub id: String,
    pub payload: Vec<u8>,
}

impl SourceMessage {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The stream has ended and will never yield another message.
    #[error("event source closed")]
    Closed,

    /// Transient failure talking to the broker.
    #[error("event source read failed: {0}")]
    Read(String),

    #[error("event source acknowledgement failed: {0}")]
    Ack(String),
}

/// A stream of upstream events consumed by exactly one loop.
///
/// `next_message` may block until a message is available; callers that need
/// prompt shutdown race it against their cancellation signal. Dropping the
/// returned future must not lose an acknowledged message.
#[async_trait]
pub trait EventSource: Send {
    async fn next_message(&mut self) -> Result<SourceMessage, SourceError>;

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), SourceError>;
}

#[async_trait]
impl<S> EventSource for Box<S>
where
    S: EventSource + ?Sized,
{
    async fn next_message(&mut self) -> Result<SourceMessage, SourceError> {
        (**self).next_message().await
    }

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), SourceError> {
        (**self).acknowledge(message_id).await
    }
}
