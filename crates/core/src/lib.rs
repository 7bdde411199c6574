//! Core message contracts: commands, queries, domain events, context.
//!
//! This crate is transport-agnostic and IO-free. It defines what a message
//! *is*; `soda-events` defines how messages are routed and `soda-infra`
//! defines how they travel.

pub mod aggregate;
pub mod context;
pub mod error;
pub mod event;
pub mod id;
pub mod message;

pub use aggregate::{Aggregate, PendingEvents};
pub use context::ExecutionContext;
pub use error::{BusError, FailureReport, HandlerError, HandlerFailure};
pub use event::{AnyEvent, BoxedEvent, DomainEvent, EventMetadata};
pub use id::EventId;
pub use message::{Command, CommandMetadata, CommandOutput, Query, QueryMetadata};
