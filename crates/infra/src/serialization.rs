//! Event payload codec for the wire.
//!
//! Payloads are neutral JSON text. Consumers accept both the direct-object
//! form and the `[type, data]` wrapper some producers emit, and probe the
//! `event_id` field without materializing the whole event.

use std::str::FromStr;

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use soda_core::{AnyEvent, BusError};
use tracing::warn;

/// How unrepresentable (cyclic/self-referential) payload graphs are
/// treated at serialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircularReferenceHandler {
    /// Substitute null and log a warning.
    #[default]
    Ignore,
    /// Surface a serialization failure.
    Error,
    /// Preserve an identity marker describing what could not be encoded.
    Retain,
}

impl FromStr for CircularReferenceHandler {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IGNORE" => Ok(Self::Ignore),
            "ERROR" => Ok(Self::Error),
            "RETAIN" => Ok(Self::Retain),
            other => Err(BusError::contract(format!(
                "unknown circular-reference-handler {other:?}"
            ))),
        }
    }
}

/// Serialization settings (`soda.event.serialization.*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SerializationConfig {
    pub circular_reference_handler: CircularReferenceHandler,
    pub fail_on_self_references: bool,
}

/// Encodes events for the stream and re-parses consumed payloads.
#[derive(Debug, Clone, Default)]
pub struct EventCodec {
    config: SerializationConfig,
}

impl EventCodec {
    pub fn new(config: SerializationConfig) -> Self {
        Self { config }
    }

    /// Serialize an event payload to wire text.
    pub fn encode(&self, event: &dyn AnyEvent) -> Result<String, BusError> {
        match event.to_json() {
            Ok(value) => serde_json::to_string(&value)
                .map_err(|e| BusError::Serialization(e.to_string())),
            Err(error) => {
                if self.config.fail_on_self_references {
                    return Err(BusError::Serialization(error.to_string()));
                }
                match self.config.circular_reference_handler {
                    CircularReferenceHandler::Error => {
                        Err(BusError::Serialization(error.to_string()))
                    }
                    CircularReferenceHandler::Ignore => {
                        warn!(
                            event_type = event.event_type(),
                            error = %error,
                            "payload not representable; encoding null"
                        );
                        Ok("null".to_string())
                    }
                    CircularReferenceHandler::Retain => {
                        let marker = serde_json::json!({
                            "$unserializable": event.event_type(),
                            "$error": error.to_string(),
                        });
                        Ok(marker.to_string())
                    }
                }
            }
        }
    }

    /// Parse a consumed payload into the JSON object carrying the event
    /// fields, unwrapping the `[type, data]` form when present.
    pub fn parse_payload(payload: &str) -> Result<JsonValue, serde_json::Error> {
        let value: JsonValue = serde_json::from_str(payload)?;
        Ok(unwrap_typed_array(value))
    }
}

fn unwrap_typed_array(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Array(items) if items.len() == 2 && items[0].is_string() => {
            items.into_iter().nth(1).unwrap_or(JsonValue::Null)
        }
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct EventIdProbe {
    event_id: Option<String>,
}

/// Read just the `event_id` field out of a wire payload. Accepts both the
/// direct-object form and the `[type, data]` wrapper; everything else in
/// the payload is skipped, not materialized.
pub fn probe_event_id(payload: &str) -> Option<String> {
    if let Ok(probe) = serde_json::from_str::<EventIdProbe>(payload) {
        if probe.event_id.is_some() {
            return probe.event_id;
        }
    }
    if let Ok((_, probe)) = serde_json::from_str::<(IgnoredAny, EventIdProbe)>(payload) {
        return probe.event_id;
    }
    None
}
