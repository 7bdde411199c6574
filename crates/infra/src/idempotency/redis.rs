//! Redis-backed idempotency store.
//!
//! Records are hashes under `<prefix>:<id>` with a TTL refreshed on every
//! write. The begin-processing transition runs as a Lua script so the
//! conditional check-and-set is atomic on the broker; consumers never
//! serialize that decision locally.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::{IdempotencyStatus, IdempotencyStore};
use crate::config::IdempotencySettings;
use crate::error::TransportError;

/// Deletions per batch during cleanup, keeping the broker responsive.
const CLEANUP_BATCH: usize = 100;

const BEGIN_PROCESSING_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'SUCCESS' or status == 'PROCESSING' then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'PROCESSING', 'processed_at', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
"#;

pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    prefix: String,
    ttl_seconds: u64,
    begin_script: Script,
}

impl RedisIdempotencyStore {
    pub async fn connect(url: &str, settings: &IdempotencySettings) -> Result<Self, TransportError> {
        let client = Client::open(url)
            .map_err(|e| TransportError::connection(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;
        Ok(Self::with_connection(conn, settings))
    }

    pub fn with_connection(conn: ConnectionManager, settings: &IdempotencySettings) -> Self {
        Self {
            conn,
            prefix: settings.redis_key_prefix.clone(),
            ttl_seconds: settings.expire_time,
            begin_script: Script::new(BEGIN_PROCESSING_SCRIPT),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn begin_processing(&self, id: &str) -> Result<bool, TransportError> {
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .begin_script
            .key(self.key(id))
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TransportError::command(format!("begin-processing script failed: {e}")))?;
        Ok(granted == 1)
    }

    async fn mark_success(
        &self,
        id: &str,
        handler_results: Option<BTreeMap<String, bool>>,
    ) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let key = self.key(id);
        let mut fields: Vec<(&str, String)> = vec![
            ("status", IdempotencyStatus::Success.as_str().to_string()),
            ("processed_at", Utc::now().to_rfc3339()),
        ];
        if let Some(results) = handler_results {
            let encoded = serde_json::to_string(&results)
                .map_err(|e| TransportError::command(format!("handler results encode: {e}")))?;
            fields.push(("handler_results", encoded));
        }
        redis::pipe()
            .hset_multiple(&key, &fields)
            .hdel(&key, "error")
            .expire(&key, self.ttl_seconds as i64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| TransportError::command(format!("mark-success failed: {e}")))?;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let key = self.key(id);
        let fields: Vec<(&str, String)> = vec![
            ("status", IdempotencyStatus::Failed.as_str().to_string()),
            ("processed_at", Utc::now().to_rfc3339()),
            ("error", error.to_string()),
        ];
        redis::pipe()
            .hset_multiple(&key, &fields)
            .expire(&key, self.ttl_seconds as i64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| TransportError::command(format!("mark-failed failed: {e}")))?;
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<Option<IdempotencyStatus>, TransportError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(self.key(id), "status")
            .await
            .map_err(|e| TransportError::command(format!("HGET failed: {e}")))?;
        Ok(raw.as_deref().and_then(IdempotencyStatus::parse))
    }

    async fn cleanup_expired(&self) -> Result<u64, TransportError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.prefix);
        let horizon = Utc::now() - chrono::Duration::seconds(self.ttl_seconds as i64);

        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        let mut batch: Vec<String> = Vec::with_capacity(CLEANUP_BATCH);
        loop {
            // cursor iteration; a full-keyspace KEYS would stall the broker
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(CLEANUP_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| TransportError::command(format!("SCAN failed: {e}")))?;

            for key in keys {
                let processed_at: Option<String> = conn
                    .hget(&key, "processed_at")
                    .await
                    .map_err(|e| TransportError::command(format!("HGET failed: {e}")))?;
                let stale = processed_at
                    .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                    .map(|at| at.with_timezone(&Utc) < horizon)
                    // unreadable timestamps count as stale
                    .unwrap_or(true);
                if stale {
                    batch.push(key);
                }
                if batch.len() >= CLEANUP_BATCH {
                    deleted += del_batch(&mut conn, &mut batch).await?;
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        deleted += del_batch(&mut conn, &mut batch).await?;
        Ok(deleted)
    }
}

async fn del_batch(
    conn: &mut ConnectionManager,
    batch: &mut Vec<String>,
) -> Result<u64, TransportError> {
    if batch.is_empty() {
        return Ok(0);
    }
    let keys: Vec<String> = std::mem::take(batch);
    let removed: u64 = conn
        .del(&keys)
        .await
        .map_err(|e| TransportError::command(format!("DEL failed: {e}")))?;
    Ok(removed)
}
