//! Aggregate root contract and the pending-event buffer.

use crate::error::BusError;
use crate::event::{BoxedEvent, DomainEvent};

/// Default bound on pending events accumulated between repository calls.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;

/// Bounded, ordered buffer of domain events awaiting publication.
///
/// Command handlers record events here while mutating the aggregate; the
/// repository decorator drains the buffer after a successful save. Draining
/// is destructive.
#[derive(Debug, Default)]
pub struct PendingEvents {
    events: Vec<BoxedEvent>,
    capacity: usize,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PENDING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
        }
    }

    /// Append an event, preserving insertion order.
    pub fn record<E: DomainEvent>(&mut self, event: E) -> Result<(), BusError> {
        self.record_boxed(Box::new(event))
    }

    pub fn record_boxed(&mut self, event: BoxedEvent) -> Result<(), BusError> {
        let capacity = if self.capacity == 0 {
            DEFAULT_PENDING_CAPACITY
        } else {
            self.capacity
        };
        if self.events.len() >= capacity {
            return Err(BusError::contract(format!(
                "pending event buffer full ({capacity} events); save the aggregate"
            )));
        }
        self.events.push(event);
        Ok(())
    }

    /// Take every pending event, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<BoxedEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Consistency boundary owning state and emitting domain events.
pub trait Aggregate: Send + Sync {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    fn pending_events(&self) -> &PendingEvents;

    fn pending_events_mut(&mut self) -> &mut PendingEvents;
}
