//! Upstream domain events consumed by the inventory ledger.
//!
//! - `envelope`: JSON wire format and decoding of upstream events
//! - `source`: transport-agnostic pull interface over an event stream
//! - `in_memory_source`: channel-backed source for tests/dev

pub mod envelope;
pub mod in_memory_source;
pub mod source;

pub use envelope::{
    DecodeError, DomainEvent, ORDER_CREATED, OrderCreated, OrderItem, UpstreamEvent, decode,
};
pub use in_memory_source::{AckLog, InMemoryEventSource, InMemorySourceHandle};
pub use source::{EventSource, SourceError, SourceMessage};
