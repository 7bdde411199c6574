//! Idempotency records for at-least-once consumption.
//!
//! Records are keyed `<prefix>:<event_id>` for the event as a whole and
//! `<prefix>:<event_id>::<handler_name>` per handler, all TTL-bounded so
//! records for retired consumers do not accumulate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::InMemoryIdempotencyStore;
#[cfg(feature = "redis")]
pub use redis::RedisIdempotencyStore;

/// Processing state of an event or of one (event, handler) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Processing,
    Success,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSING" => Some(Self::Processing),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Stored processing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: IdempotencyStatus,
    pub processed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_results: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status map with conditional transitions.
///
/// `begin_processing` is the only guarded write: the missing/FAILED →
/// PROCESSING transition must execute on the backend (not locally), so
/// concurrent consumers agree on who owns an event. Every write refreshes
/// the TTL.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns true iff a missing or FAILED record transitioned into
    /// PROCESSING; false when the record is SUCCESS or PROCESSING already.
    async fn begin_processing(&self, id: &str) -> Result<bool, TransportError>;

    async fn mark_success(
        &self,
        id: &str,
        handler_results: Option<BTreeMap<String, bool>>,
    ) -> Result<(), TransportError>;

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), TransportError>;

    async fn status(&self, id: &str) -> Result<Option<IdempotencyStatus>, TransportError>;

    /// Cursor-iterated deletion of records older than the TTL; returns the
    /// number deleted. (The TTL already reaps records on live backends;
    /// this keeps brokers without per-key expiry bounded too.)
    async fn cleanup_expired(&self) -> Result<u64, TransportError>;
}
