//! In-memory event source for tests/dev.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::source::{EventSource, SourceError, SourceMessage};

type Delivery = Result<SourceMessage, SourceError>;

/// Channel-backed [`EventSource`].
///
/// - No IO
/// - Messages are delivered in publish order
/// - The source reports [`SourceError::Closed`] once every handle is dropped
#[derive(Debug)]
pub struct InMemoryEventSource {
    rx: mpsc::UnboundedReceiver<Delivery>,
    acked: Arc<Mutex<Vec<String>>>,
}

/// Producer side of an [`InMemoryEventSource`].
#[derive(Debug, Clone)]
pub struct InMemorySourceHandle {
    tx: mpsc::UnboundedSender<Delivery>,
    acked: Arc<Mutex<Vec<String>>>,
    next_id: Arc<Mutex<u64>>,
}

impl InMemoryEventSource {
    pub fn new() -> (Self, InMemorySourceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let acked = Arc::new(Mutex::new(Vec::new()));
        let source = Self {
            rx,
            acked: acked.clone(),
        };
        let handle = InMemorySourceHandle {
            tx,
            acked,
            next_id: Arc::new(Mutex::new(0)),
        };
        (source, handle)
    }
}

impl InMemorySourceHandle {
    /// Enqueue a raw payload; returns the assigned message id.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            format!("mem-{}", *next)
        };
        let _ = self.tx.send(Ok(SourceMessage::new(id.clone(), payload)));
        id
    }

    /// Make the next pull fail with a transient read error.
    pub fn fail_next_read(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(SourceError::Read(reason.into())));
    }

    /// Ids acknowledged by the consumer so far, in order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.ack_log().ids()
    }

    /// Read-only view of acknowledgements that does not keep the source open.
    pub fn ack_log(&self) -> AckLog {
        AckLog(self.acked.clone())
    }
}

/// Acknowledged message ids, shared with the source.
#[derive(Debug, Clone)]
pub struct AckLog(Arc<Mutex<Vec<String>>>);

impl AckLog {
    pub fn ids(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn next_message(&mut self) -> Result<SourceMessage, SourceError> {
        match self.rx.recv().await {
            Some(delivery) => delivery,
            None => Err(SourceError::Closed),
        }
    }

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), SourceError> {
        self.acked
            .lock()
            .map_err(|_| SourceError::Ack("ack log poisoned".to_string()))?
            .push(message_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_then_closes() {
        let (mut source, handle) = InMemoryEventSource::new();
        let first = handle.publish(b"a".to_vec());
        handle.fail_next_read("broker hiccup");
        handle.publish(b"b".to_vec());
        drop(handle);

        let msg = source.next_message().await.unwrap();
        assert_eq!(msg.id, first);
        assert!(matches!(source.next_message().await, Err(SourceError::Read(_))));
        assert_eq!(source.next_message().await.unwrap().payload, b"b".to_vec());
        assert!(matches!(source.next_message().await, Err(SourceError::Closed)));
    }

    #[tokio::test]
    async fn records_acknowledgements() {
        let (mut source, handle) = InMemoryEventSource::new();
        let id = handle.publish(b"x".to_vec());
        let msg = source.next_message().await.unwrap();
        source.acknowledge(&msg.id).await.unwrap();
        assert_eq!(handle.acknowledged(), vec![id]);
    }
}
