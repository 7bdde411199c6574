//! In-memory idempotency store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use super::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use crate::error::TransportError;

#[derive(Debug)]
struct StoredRecord {
    record: IdempotencyRecord,
    expires_at: Instant,
}

/// Mutex-guarded map with the same transition semantics as the Redis
/// store. Expired records are treated as missing.
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    records: Mutex<HashMap<String, StoredRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Current record for `id`, if present and unexpired.
    pub fn record(&self, id: &str) -> Option<IdempotencyRecord> {
        let records = self.records.lock().unwrap();
        records
            .get(id)
            .filter(|stored| stored.expires_at > Instant::now())
            .map(|stored| stored.record.clone())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, id: &str, record: IdempotencyRecord) {
        let mut records = self.records.lock().unwrap();
        records.insert(
            id.to_string(),
            StoredRecord {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin_processing(&self, id: &str) -> Result<bool, TransportError> {
        let mut records = self.records.lock().unwrap();
        let live_status = records
            .get(id)
            .filter(|stored| stored.expires_at > Instant::now())
            .map(|stored| stored.record.status);
        match live_status {
            Some(IdempotencyStatus::Success) | Some(IdempotencyStatus::Processing) => Ok(false),
            _ => {
                records.insert(
                    id.to_string(),
                    StoredRecord {
                        record: IdempotencyRecord {
                            status: IdempotencyStatus::Processing,
                            processed_at: Utc::now(),
                            handler_results: None,
                            error: None,
                        },
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn mark_success(
        &self,
        id: &str,
        handler_results: Option<BTreeMap<String, bool>>,
    ) -> Result<(), TransportError> {
        self.put(
            id,
            IdempotencyRecord {
                status: IdempotencyStatus::Success,
                processed_at: Utc::now(),
                handler_results,
                error: None,
            },
        );
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), TransportError> {
        self.put(
            id,
            IdempotencyRecord {
                status: IdempotencyStatus::Failed,
                processed_at: Utc::now(),
                handler_results: None,
                error: Some(error.to_string()),
            },
        );
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<Option<IdempotencyStatus>, TransportError> {
        Ok(self.record(id).map(|record| record.status))
    }

    async fn cleanup_expired(&self) -> Result<u64, TransportError> {
        let mut records = self.records.lock().unwrap();
        let now = Instant::now();
        let before = records.len();
        records.retain(|_, stored| stored.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}
