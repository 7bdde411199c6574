//! Redis Streams transport.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};

use super::{EventStream, StreamMessage};
use crate::error::TransportError;

/// Consumer-group stream backed by Redis (XADD/XREADGROUP/XACK).
///
/// Connections are pooled through a [`ConnectionManager`], which reconnects
/// transparently; broker outages surface as command errors the consumer
/// loop logs and rides out.
#[derive(Clone)]
pub struct RedisEventStream {
    conn: ConnectionManager,
}

impl RedisEventStream {
    /// Connect to the broker at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = Client::open(url)
            .map_err(|e| TransportError::connection(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn exists(&self, key: &str) -> Result<bool, TransportError> {
        let mut conn = self.conn.clone();
        conn.exists(key)
            .await
            .map_err(|e| TransportError::command(format!("EXISTS failed: {e}")))
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        // MKSTREAM keeps bootstrap race-free when two consumers start at once
        let result: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(key, group, "0").await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(TransportError::command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    async fn add(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        maxlen: Option<u64>,
    ) -> Result<String, TransportError> {
        let mut conn = self.conn.clone();
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let id: String = match maxlen {
            Some(maxlen) => conn
                .xadd_maxlen(key, StreamMaxlen::Approx(maxlen as usize), "*", &items)
                .await
                .map_err(|e| TransportError::command(format!("XADD failed: {e}")))?,
            None => conn
                .xadd(key, "*", &items)
                .await
                .map_err(|e| TransportError::command(format!("XADD failed: {e}")))?,
        };
        Ok(id)
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, TransportError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[key], &[">"], &options)
            .await
            .map_err(|e| TransportError::command(format!("XREADGROUP failed: {e}")))?;

        let mut messages = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let mut fields = BTreeMap::new();
                for (name, value) in entry.map {
                    match redis::from_redis_value::<String>(&value) {
                        Ok(text) => {
                            fields.insert(name, text);
                        }
                        Err(e) => {
                            return Err(TransportError::Reply(format!(
                                "non-text field {name:?} in entry {}: {e}",
                                entry.id
                            )));
                        }
                    }
                }
                messages.push(StreamMessage {
                    id: entry.id,
                    stream_key: key.to_string(),
                    fields,
                });
            }
        }
        Ok(messages)
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(key, group, &[id])
            .await
            .map_err(|e| TransportError::command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}
