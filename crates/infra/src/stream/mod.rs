//! Consumer-group stream abstraction.
//!
//! The broker contract is deliberately small: append, group-read, ack.
//! `RedisEventStream` talks to a real broker; `InMemoryEventStream` is the
//! twin used by tests and development.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::InMemoryEventStream;
#[cfg(feature = "redis")]
pub use redis::RedisEventStream;

/// Wire field holding the serialized event payload.
pub const FIELD_EVENT: &str = "event";
/// Wire field holding the event type name.
pub const FIELD_TYPE: &str = "type";
/// Sentinel entry type written to create the stream.
pub const INIT_EVENT_TYPE: &str = "INIT";

pub const FIELD_DEAD_LETTER_REASON: &str = "deadLetterReason";
pub const FIELD_DEAD_LETTER_TIMESTAMP: &str = "deadLetterTimestamp";
pub const FIELD_ORIGINAL_STREAM: &str = "originalStream";
pub const FIELD_ORIGINAL_ID: &str = "originalId";

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub stream_key: String,
    pub fields: BTreeMap<String, String>,
}

impl StreamMessage {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Black-box consumer-group stream (XADD/XREADGROUP/XACK semantics).
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, TransportError>;

    /// Create the consumer group; "already exists" is success.
    async fn create_group(&self, key: &str, group: &str) -> Result<(), TransportError>;

    /// Append an entry, optionally trimming to an approximate maximum
    /// length. Returns the broker-assigned entry id.
    async fn add(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        maxlen: Option<u64>,
    ) -> Result<String, TransportError>;

    /// Read new entries for this consumer, blocking up to `block`.
    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, TransportError>;

    /// Acknowledge one entry for the group.
    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), TransportError>;
}
