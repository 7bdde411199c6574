//! Event publication and in-process delivery.

use std::sync::Arc;

use async_trait::async_trait;
use soda_core::{AnyEvent, BoxedEvent, BusError, HandlerFailure};
use tracing::debug;

use crate::context_store::ContextStore;
use crate::interceptor;
use crate::registry::EventRegistry;

/// Publication seam shared by the command pipeline, the repository
/// decorator, and the facade. The in-process bus delivers inline; the
/// stream bus appends to the broker and lets the consumer loop deliver.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// True when a persistent transport owns publication of command-result
    /// events; the command pipeline then defers to repository publication
    /// so no event is delivered twice.
    fn defers_command_results(&self) -> bool {
        false
    }

    async fn publish(&self, event: BoxedEvent) -> Result<(), BusError>;

    /// Publish in insertion order, stopping at the first failure.
    async fn publish_all(&self, events: Vec<BoxedEvent>) -> Result<(), BusError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Delivers an event to every registered handler on the current task.
///
/// While a persistent transport is attached to the registry, delivery is
/// permitted only on transport-consumer tasks; a local dispatch attempt
/// elsewhere is a silent no-op so handlers are never executed twice for
/// one event (the stream loop delivers it instead).
pub struct EventDispatcher {
    registry: Arc<EventRegistry>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Deliver to handlers in registration order. One handler's failure
    /// does not stop the others; failures are aggregated into the result.
    /// An empty handler list is a no-op.
    pub async fn dispatch(&self, event: &dyn AnyEvent) -> Result<(), BusError> {
        if self.registry.has_stream_transport() && !ContextStore::is_stream_consumer() {
            debug!(
                event_type = event.event_type(),
                "local dispatch suppressed; stream transport owns delivery"
            );
            return Ok(());
        }

        let handlers = self.registry.handlers_for(event);
        if handlers.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for handler in &handlers {
            if let Err(error) = interceptor::dispatch_to_handler(handler, event).await {
                failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::EventDeliveryFailed {
                event_type: event.event_type().to_string(),
                failures,
            })
        }
    }
}

/// In-process event bus: publication delivers synchronously on the
/// publishing task (the `simple` transport).
pub struct LocalEventBus {
    dispatcher: EventDispatcher,
}

impl LocalEventBus {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self {
            dispatcher: EventDispatcher::new(registry),
        }
    }
}

#[async_trait]
impl EventPublisher for LocalEventBus {
    async fn publish(&self, event: BoxedEvent) -> Result<(), BusError> {
        self.dispatcher.dispatch(event.as_ref()).await
    }
}
