//! Domain event contract and type erasure.

use std::any::Any;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::id::EventId;
use crate::message::CommandMetadata;

/// Infrastructure envelope embedded in every domain event.
///
/// Events are immutable facts once published; the framework only writes
/// these fields between handler completion and publication (context
/// enrichment). Fields already set are never overwritten.
///
/// The envelope travels on the wire inside the event payload, which is how
/// the execution context crosses asynchronous transport hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: EventId,
    pub occurred_on: DateTime<Utc>,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub authorities: Vec<String>,
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub caller_uid: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub extension: BTreeMap<String, String>,
    #[serde(default)]
    pub hop_count: u32,
}

impl EventMetadata {
    /// Fresh envelope with a new time-ordered id and the current wall time.
    pub fn new() -> Self {
        Self {
            event_id: EventId::new(),
            occurred_on: Utc::now(),
            request_id: String::new(),
            user_name: String::new(),
            authorities: Vec::new(),
            jti: String::new(),
            caller_uid: String::new(),
            tenant_id: String::new(),
            extension: BTreeMap::new(),
            hop_count: 0,
        }
    }

    /// Copy context fields from the producing command. Fields already set on
    /// the event are preserved.
    pub fn sync_from_command(&mut self, meta: &CommandMetadata) {
        if self.request_id.is_empty() {
            self.request_id = meta.request_id.clone();
        }
        if self.user_name.is_empty() {
            self.user_name = meta.user_name.clone();
        }
        if self.authorities.is_empty() {
            self.authorities = meta.authorities.clone();
        }
        if self.jti.is_empty() {
            self.jti = meta.jti.clone();
        }
        if self.caller_uid.is_empty() {
            self.caller_uid = meta.caller_uid.clone();
        }
        if self.tenant_id.is_empty() {
            self.tenant_id = meta.tenant_id.clone();
        }
        if self.hop_count == 0 {
            self.hop_count = meta.hop_count;
        }
    }

    /// Copy context fields from the current execution context. Fields
    /// already set on the event are preserved.
    pub fn enrich_from_context(&mut self, ctx: &ExecutionContext) {
        if self.request_id.is_empty() {
            self.request_id = ctx.request_id.clone();
        }
        if self.user_name.is_empty() {
            self.user_name = ctx.user_name.clone();
        }
        if self.authorities.is_empty() {
            self.authorities = ctx.authorities.clone();
        }
        if self.jti.is_empty() {
            self.jti = ctx.jti.clone();
        }
        if self.caller_uid.is_empty() {
            self.caller_uid = ctx.caller_uid.clone();
        }
        if self.tenant_id.is_empty() {
            self.tenant_id = ctx.tenant_id.clone();
        }
        if self.hop_count == 0 {
            self.hop_count = ctx.hop_count;
        }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable fact about state that has changed.
///
/// Implementors embed an [`EventMetadata`] (conventionally flattened with
/// `#[serde(flatten)]` so the envelope fields travel on the wire) and give
/// the event a stable type string used for registry routing and transport
/// resolution. The string must never change once events are in flight.
pub trait DomainEvent:
    Clone
    + core::fmt::Debug
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Stable event type identifier (e.g. "order.created").
    fn event_type() -> &'static str
    where
        Self: Sized;

    fn metadata(&self) -> &EventMetadata;

    fn metadata_mut(&mut self) -> &mut EventMetadata;
}

/// Object-safe view of a domain event.
///
/// Aggregates accumulate heterogeneous pending events and registries
/// dispatch without knowing concrete types, so the bus works in terms of
/// `BoxedEvent` and downcasts at the handler boundary.
pub trait AnyEvent: core::fmt::Debug + Send + Sync {
    fn event_type(&self) -> &'static str;

    fn metadata(&self) -> &EventMetadata;

    fn metadata_mut(&mut self) -> &mut EventMetadata;

    fn as_any(&self) -> &dyn Any;

    fn clone_boxed(&self) -> BoxedEvent;

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<E> AnyEvent for E
where
    E: DomainEvent,
{
    fn event_type(&self) -> &'static str {
        E::event_type()
    }

    fn metadata(&self) -> &EventMetadata {
        DomainEvent::metadata(self)
    }

    fn metadata_mut(&mut self) -> &mut EventMetadata {
        DomainEvent::metadata_mut(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_boxed(&self) -> BoxedEvent {
        Box::new(self.clone())
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Type-erased domain event.
pub type BoxedEvent = Box<dyn AnyEvent>;

impl Clone for BoxedEvent {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}
