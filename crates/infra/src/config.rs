//! Configuration surface (`soda.event.*`).
//!
//! Plain serde structs with the documented defaults. `from_env` maps the
//! property path to `SODA_EVENT_*` environment variables; the lookup is
//! injectable so tests never mutate process environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soda_core::BusError;
use soda_events::AsyncPoolConfig;

use crate::serialization::SerializationConfig;

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    /// In-process dispatch on the publishing task.
    #[default]
    Simple,
    /// Persistent consumer-group stream.
    Redis,
}

impl FromStr for BusType {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "redis" => Ok(Self::Redis),
            other => Err(BusError::contract(format!("unknown bus-type {other:?}"))),
        }
    }
}

/// Idempotency tracking settings (`soda.event.redis.stream.idempotency.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IdempotencySettings {
    pub enabled: bool,
    pub redis_key_prefix: String,
    /// Record TTL in seconds.
    pub expire_time: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_key_prefix: "soda-events-idempotency".to_string(),
            expire_time: 86_400,
        }
    }
}

impl IdempotencySettings {
    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_time)
    }
}

/// Stream consumer settings (`soda.event.redis.stream.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamSettings {
    pub group_name: String,
    /// Unique consumer id within the group.
    pub consumer_name: String,
    /// Polling concurrency; consumers past the first get a `-<n>` suffix.
    pub consumer_count: u32,
    /// Approximate stream trim target.
    pub maxlen: u64,
    /// Messages fetched per poll.
    pub batch_size: usize,
    /// Block interval per poll, in milliseconds.
    #[serde(rename = "poll-timeout")]
    pub poll_timeout_ms: u64,
    /// Attempts before dead-lettering.
    pub max_retries: u32,
    /// First retry delay, in milliseconds.
    #[serde(rename = "initial-retry-delay")]
    pub initial_retry_delay_ms: u64,
    /// Double the delay on each attempt.
    pub exponential_backoff: bool,
    pub dead_letter_stream: String,
    pub idempotency: IdempotencySettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            group_name: "soda-events-group".to_string(),
            consumer_name: format!("soda-events-consumer-{}", std::process::id()),
            consumer_count: 1,
            maxlen: 10_000,
            batch_size: 10,
            poll_timeout_ms: 1_000,
            max_retries: 3,
            initial_retry_delay_ms: 1_000,
            exponential_backoff: true,
            dead_letter_stream: "soda-events-dead-letter".to_string(),
            idempotency: IdempotencySettings::default(),
        }
    }
}

impl StreamSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }
}

/// Redis transport settings (`soda.event.redis.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RedisConfig {
    pub url: String,
    /// Stream name.
    pub topic: String,
    pub stream: StreamSettings,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            topic: "soda-events".to_string(),
            stream: StreamSettings::default(),
        }
    }
}

/// Root configuration (`soda.event.*`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SodaEventConfig {
    pub bus_type: BusType,
    pub redis: RedisConfig,
    #[serde(rename = "async")]
    pub async_pool: AsyncPoolConfig,
    pub serialization: SerializationConfig,
}

impl SodaEventConfig {
    /// Load from `SODA_EVENT_*` environment variables, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Result<Self, BusError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment-variable naming).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, BusError> {
        let mut config = Self::default();

        if let Some(raw) = get("SODA_EVENT_BUS_TYPE") {
            config.bus_type = parse("SODA_EVENT_BUS_TYPE", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_URL") {
            config.redis.url = raw;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_TOPIC") {
            config.redis.topic = raw;
        }

        let stream = &mut config.redis.stream;
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_GROUP_NAME") {
            stream.group_name = raw;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_CONSUMER_NAME") {
            stream.consumer_name = raw;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_CONSUMER_COUNT") {
            stream.consumer_count = parse("SODA_EVENT_REDIS_STREAM_CONSUMER_COUNT", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_MAXLEN") {
            stream.maxlen = parse("SODA_EVENT_REDIS_STREAM_MAXLEN", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_BATCH_SIZE") {
            stream.batch_size = parse("SODA_EVENT_REDIS_STREAM_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_POLL_TIMEOUT") {
            stream.poll_timeout_ms = parse("SODA_EVENT_REDIS_STREAM_POLL_TIMEOUT", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_MAX_RETRIES") {
            stream.max_retries = parse("SODA_EVENT_REDIS_STREAM_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_INITIAL_RETRY_DELAY") {
            stream.initial_retry_delay_ms =
                parse("SODA_EVENT_REDIS_STREAM_INITIAL_RETRY_DELAY", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_EXPONENTIAL_BACKOFF") {
            stream.exponential_backoff =
                parse("SODA_EVENT_REDIS_STREAM_EXPONENTIAL_BACKOFF", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_DEAD_LETTER_STREAM") {
            stream.dead_letter_stream = raw;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_IDEMPOTENCY_ENABLED") {
            stream.idempotency.enabled =
                parse("SODA_EVENT_REDIS_STREAM_IDEMPOTENCY_ENABLED", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_IDEMPOTENCY_REDIS_KEY_PREFIX") {
            stream.idempotency.redis_key_prefix = raw;
        }
        if let Some(raw) = get("SODA_EVENT_REDIS_STREAM_IDEMPOTENCY_EXPIRE_TIME") {
            stream.idempotency.expire_time =
                parse("SODA_EVENT_REDIS_STREAM_IDEMPOTENCY_EXPIRE_TIME", &raw)?;
        }

        let pool = &mut config.async_pool;
        if let Some(raw) = get("SODA_EVENT_ASYNC_CORE_POOL_SIZE") {
            pool.core_pool_size = parse("SODA_EVENT_ASYNC_CORE_POOL_SIZE", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_ASYNC_MAX_POOL_SIZE") {
            pool.max_pool_size = parse("SODA_EVENT_ASYNC_MAX_POOL_SIZE", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_ASYNC_QUEUE_CAPACITY") {
            pool.queue_capacity = parse("SODA_EVENT_ASYNC_QUEUE_CAPACITY", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_ASYNC_THREAD_NAME_PREFIX") {
            pool.thread_name_prefix = raw;
        }

        if let Some(raw) = get("SODA_EVENT_SERIALIZATION_CIRCULAR_REFERENCE_HANDLER") {
            config.serialization.circular_reference_handler =
                parse("SODA_EVENT_SERIALIZATION_CIRCULAR_REFERENCE_HANDLER", &raw)?;
        }
        if let Some(raw) = get("SODA_EVENT_SERIALIZATION_FAIL_ON_SELF_REFERENCES") {
            config.serialization.fail_on_self_references =
                parse("SODA_EVENT_SERIALIZATION_FAIL_ON_SELF_REFERENCES", &raw)?;
        }

        Ok(config)
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, BusError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse()
        .map_err(|e| BusError::contract(format!("invalid value for {key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = SodaEventConfig::default();
        assert_eq!(config.bus_type, BusType::Simple);
        assert_eq!(config.redis.topic, "soda-events");
        assert_eq!(config.redis.stream.group_name, "soda-events-group");
        assert!(config
            .redis
            .stream
            .consumer_name
            .starts_with("soda-events-consumer-"));
        assert_eq!(config.redis.stream.maxlen, 10_000);
        assert_eq!(config.redis.stream.poll_timeout_ms, 1_000);
        assert_eq!(config.redis.stream.max_retries, 3);
        assert_eq!(config.redis.stream.initial_retry_delay_ms, 1_000);
        assert!(config.redis.stream.exponential_backoff);
        assert_eq!(
            config.redis.stream.dead_letter_stream,
            "soda-events-dead-letter"
        );
        assert!(!config.redis.stream.idempotency.enabled);
        assert_eq!(
            config.redis.stream.idempotency.redis_key_prefix,
            "soda-events-idempotency"
        );
        assert_eq!(config.redis.stream.idempotency.expire_time, 86_400);
        assert_eq!(config.async_pool.core_pool_size, 8);
        assert_eq!(config.async_pool.max_pool_size, 16);
        assert_eq!(config.async_pool.queue_capacity, 100);
        assert_eq!(config.async_pool.thread_name_prefix, "cqrs-async-");
    }

    #[test]
    fn lookup_overrides_apply() {
        let mut vars = HashMap::new();
        vars.insert("SODA_EVENT_BUS_TYPE", "redis");
        vars.insert("SODA_EVENT_REDIS_TOPIC", "orders");
        vars.insert("SODA_EVENT_REDIS_STREAM_MAX_RETRIES", "5");
        vars.insert("SODA_EVENT_REDIS_STREAM_EXPONENTIAL_BACKOFF", "false");
        vars.insert("SODA_EVENT_REDIS_STREAM_IDEMPOTENCY_ENABLED", "true");
        vars.insert("SODA_EVENT_ASYNC_CORE_POOL_SIZE", "2");

        let config =
            SodaEventConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.bus_type, BusType::Redis);
        assert_eq!(config.redis.topic, "orders");
        assert_eq!(config.redis.stream.max_retries, 5);
        assert!(!config.redis.stream.exponential_backoff);
        assert!(config.redis.stream.idempotency.enabled);
        assert_eq!(config.async_pool.core_pool_size, 2);
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        let result = SodaEventConfig::from_lookup(|key| {
            (key == "SODA_EVENT_REDIS_STREAM_MAX_RETRIES").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }
}
