//! Bus error model.
//!
//! Keep this focused on the failure modes a caller can act on. Broker-level
//! errors live in `soda-infra` and are folded into `Transport` at the
//! boundary.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// An error raised by a command, query, or event handler body.
///
/// Handlers own their domain errors; this type carries them across the
/// dispatch boundary without forcing a shared error enum on applications.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One failed handler inside an event delivery.
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: HandlerError,
}

/// Errors surfaced by the dispatch fabric.
#[derive(Debug, Error)]
pub enum BusError {
    /// Startup/registration misconfiguration (duplicate command handler,
    /// conflicting event type names, zero-capacity pools).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Dispatch target missing for the message type.
    #[error("no handler registered for {message_type}")]
    NoHandlerRegistered { message_type: &'static str },

    /// Synchronous command nesting exceeded the ceiling.
    #[error("command recursion too deep (depth {depth} > max {max}): {}", trail.join(" -> "))]
    CommandRecursionTooDeep {
        depth: u32,
        max: u32,
        trail: Vec<&'static str>,
    },

    /// Command→event→command hop chain would exceed the ceiling.
    #[error("async recursion too deep (hop {hops} > max {max})")]
    AsyncRecursionTooDeep { hops: u32, max: u32 },

    /// A command or query handler failed.
    #[error("handler {handler} failed for {message_type}: {source}")]
    Handler {
        message_type: &'static str,
        handler: String,
        #[source]
        source: HandlerError,
    },

    /// One or more event handlers failed during delivery.
    #[error("event delivery failed for {event_type}: {} handler(s) failed", failures.len())]
    EventDeliveryFailed {
        event_type: String,
        failures: Vec<HandlerFailure>,
    },

    /// Broker unreachable or broker-level error.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Structural serialization failure on the wire.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// Events were discarded because the surrounding transaction rolled back.
    #[error("transactional publish aborted: {0}")]
    TransactionalPublishAborted(String),
}

impl BusError {
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Stable machine-readable code for the variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContractViolation(_) => "CONTRACT_VIOLATION",
            Self::NoHandlerRegistered { .. } => "NO_HANDLER_REGISTERED",
            Self::CommandRecursionTooDeep { .. } => "COMMAND_RECURSION_TOO_DEEP",
            Self::AsyncRecursionTooDeep { .. } => "ASYNC_RECURSION_TOO_DEEP",
            Self::Handler { .. } => "HANDLER_FAILURE",
            Self::EventDeliveryFailed { .. } => "EVENT_DELIVERY_FAILED",
            Self::Transport(_) => "TRANSPORT_FAILURE",
            Self::Serialization(_) => "SERIALIZATION_FAILURE",
            Self::TransactionalPublishAborted(_) => "TRANSACTIONAL_PUBLISH_ABORTED",
        }
    }
}

/// Caller-facing failure envelope: code, message, timestamp, and the
/// originating message type.
#[derive(Debug)]
pub struct FailureReport {
    pub code: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
    pub origin: &'static str,
}

impl FailureReport {
    pub fn new(error: &BusError, origin: &'static str) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            at: Utc::now(),
            origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursion_error_carries_trail() {
        let err = BusError::CommandRecursionTooDeep {
            depth: 11,
            max: 10,
            trail: vec!["CreateOrder", "ReserveStock"],
        };
        let msg = err.to_string();
        assert!(msg.contains("CreateOrder -> ReserveStock"));
        assert_eq!(err.code(), "COMMAND_RECURSION_TOO_DEEP");
    }

    #[test]
    fn failure_report_snapshots_code_and_origin() {
        let err = BusError::NoHandlerRegistered {
            message_type: "Ping",
        };
        let report = FailureReport::new(&err, "Ping");
        assert_eq!(report.code, "NO_HANDLER_REGISTERED");
        assert_eq!(report.origin, "Ping");
        assert!(report.message.contains("Ping"));
    }
}
