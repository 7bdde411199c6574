//! Broker-level error model.

use soda_core::BusError;
use thiserror::Error;

/// Failure talking to the stream broker or the idempotency backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("malformed broker reply: {0}")]
    Reply(String),
}

impl TransportError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

impl From<TransportError> for BusError {
    fn from(value: TransportError) -> Self {
        BusError::Transport(value.to_string())
    }
}
