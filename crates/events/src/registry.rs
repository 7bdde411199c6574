//! Type-keyed handler registries.
//!
//! Commands and queries map to at most one handler; events map to an
//! ordered list plus optional catch-all subscribers. Registries are
//! populated at bootstrap and read-mostly afterwards; event handler lists
//! are copy-on-write so dispatch never blocks a subscribe/unsubscribe.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use soda_core::{AnyEvent, BoxedEvent, BusError, Command, DomainEvent, HandlerError, Query};

/// Handles a command and produces its output.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Handler name used in logs and error reports.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    async fn handle(&self, command: C) -> Result<C::Output, HandlerError>;
}

/// Handles a query; side-effect free by contract.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    async fn handle(&self, query: Q) -> Result<Q::Output, HandlerError>;
}

/// Handles one concrete event type.
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync + 'static {
    /// Handler name; also the per-handler idempotency key component, so it
    /// must stay stable across deployments.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}

/// Handles every published event regardless of concrete type.
#[async_trait]
pub trait CatchAllHandler: Send + Sync + 'static {
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    async fn handle(&self, event: &dyn AnyEvent) -> Result<(), HandlerError>;
}

struct CommandEntry<C: Command> {
    handler: Arc<dyn CommandHandler<C>>,
}

struct RegisteredCommand {
    handler_name: String,
    entry: Box<dyn Any + Send + Sync>,
}

/// Resolved command handler plus its registered name.
pub struct ResolvedCommand<C: Command> {
    pub handler: Arc<dyn CommandHandler<C>>,
    pub name: String,
}

/// Command type → single handler.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<TypeId, RegisteredCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C, H>(&self, handler: H) -> Result<(), BusError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let mut map = self.handlers.write().unwrap();
        let type_id = TypeId::of::<C>();
        if map.contains_key(&type_id) {
            return Err(BusError::contract(format!(
                "duplicate command handler for {}",
                std::any::type_name::<C>()
            )));
        }
        map.insert(
            type_id,
            RegisteredCommand {
                handler_name: handler.name(),
                entry: Box::new(CommandEntry {
                    handler: Arc::new(handler) as Arc<dyn CommandHandler<C>>,
                }),
            },
        );
        Ok(())
    }

    pub fn resolve<C: Command>(&self) -> Option<ResolvedCommand<C>> {
        let map = self.handlers.read().unwrap();
        map.get(&TypeId::of::<C>()).and_then(|registered| {
            registered
                .entry
                .downcast_ref::<CommandEntry<C>>()
                .map(|entry| ResolvedCommand {
                    handler: entry.handler.clone(),
                    name: registered.handler_name.clone(),
                })
        })
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct QueryEntry<Q: Query> {
    handler: Arc<dyn QueryHandler<Q>>,
}

struct RegisteredQuery {
    handler_name: String,
    entry: Box<dyn Any + Send + Sync>,
}

pub struct ResolvedQuery<Q: Query> {
    pub handler: Arc<dyn QueryHandler<Q>>,
    pub name: String,
}

/// Query type → single handler.
#[derive(Default)]
pub struct QueryRegistry {
    handlers: RwLock<HashMap<TypeId, RegisteredQuery>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Q, H>(&self, handler: H) -> Result<(), BusError>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        let mut map = self.handlers.write().unwrap();
        let type_id = TypeId::of::<Q>();
        if map.contains_key(&type_id) {
            return Err(BusError::contract(format!(
                "duplicate query handler for {}",
                std::any::type_name::<Q>()
            )));
        }
        map.insert(
            type_id,
            RegisteredQuery {
                handler_name: handler.name(),
                entry: Box::new(QueryEntry {
                    handler: Arc::new(handler) as Arc<dyn QueryHandler<Q>>,
                }),
            },
        );
        Ok(())
    }

    pub fn resolve<Q: Query>(&self) -> Option<ResolvedQuery<Q>> {
        let map = self.handlers.read().unwrap();
        map.get(&TypeId::of::<Q>()).and_then(|registered| {
            registered
                .entry
                .downcast_ref::<QueryEntry<Q>>()
                .map(|entry| ResolvedQuery {
                    handler: entry.handler.clone(),
                    name: registered.handler_name.clone(),
                })
        })
    }
}

type InvokeFn = Arc<dyn Fn(&dyn AnyEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Deserializes a wire payload into a typed event.
pub type DeserializeFn = Arc<dyn Fn(JsonValue) -> Result<BoxedEvent, serde_json::Error> + Send + Sync>;

/// A type-erased event handler as stored in the registry.
#[derive(Clone)]
pub struct RegisteredEventHandler {
    name: String,
    call: InvokeFn,
}

impl RegisteredEventHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the handler. The returned future owns a clone of the event.
    pub fn invoke(&self, event: &dyn AnyEvent) -> BoxFuture<'static, Result<(), HandlerError>> {
        (self.call)(event)
    }
}

fn erase_typed<E, H>(handler: Arc<H>) -> RegisteredEventHandler
where
    E: DomainEvent,
    H: EventHandler<E>,
{
    let name = handler.name();
    let call: InvokeFn = Arc::new(move |event: &dyn AnyEvent| {
        let handler = handler.clone();
        let event = event.as_any().downcast_ref::<E>().cloned();
        Box::pin(async move {
            match event {
                Some(event) => handler.handle(&event).await,
                None => Err(HandlerError::new("event type mismatch during dispatch")),
            }
        })
    });
    RegisteredEventHandler { name, call }
}

fn erase_catch_all<H: CatchAllHandler>(handler: Arc<H>) -> RegisteredEventHandler {
    let name = handler.name();
    let call: InvokeFn = Arc::new(move |event: &dyn AnyEvent| {
        let handler = handler.clone();
        let event: BoxedEvent = event.clone_boxed();
        Box::pin(async move { handler.handle(event.as_ref()).await })
    });
    RegisteredEventHandler { name, call }
}

struct EventTypeEntry {
    deserialize: DeserializeFn,
    handlers: Arc<Vec<RegisteredEventHandler>>,
}

/// Event type → ordered handler list, keyed both by `TypeId` (in-process
/// dispatch) and by the stable type string (transport resolution).
#[derive(Default)]
pub struct EventRegistry {
    by_type: RwLock<HashMap<TypeId, EventTypeEntry>>,
    names: RwLock<HashMap<&'static str, TypeId>>,
    catch_all: RwLock<Arc<Vec<RegisteredEventHandler>>>,
    /// Set when a persistent transport delivers for this registry; local
    /// dispatch is then restricted to transport-consumer tasks.
    stream_transport: std::sync::atomic::AtomicBool,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a persistent transport owns delivery for this registry.
    pub fn mark_stream_transport(&self) {
        self.stream_transport
            .store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn has_stream_transport(&self) -> bool {
        self.stream_transport
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Make `E` resolvable from the wire without attaching a handler.
    pub fn register_event_type<E: DomainEvent>(&self) -> Result<(), BusError> {
        self.ensure_entry::<E>()
    }

    /// Subscribe a handler to `E`; registration order is delivery order.
    pub fn subscribe<E, H>(&self, handler: H) -> Result<(), BusError>
    where
        E: DomainEvent,
        H: EventHandler<E>,
    {
        self.ensure_entry::<E>()?;
        let erased = erase_typed::<E, H>(Arc::new(handler));
        let mut map = self.by_type.write().unwrap();
        let entry = map
            .get_mut(&TypeId::of::<E>())
            .ok_or_else(|| BusError::contract("event type vanished during subscribe"))?;
        let mut handlers: Vec<_> = entry.handlers.iter().cloned().collect();
        handlers.push(erased);
        entry.handlers = Arc::new(handlers);
        Ok(())
    }

    /// Remove the first handler registered under `name` for `E`.
    pub fn unsubscribe<E: DomainEvent>(&self, name: &str) -> bool {
        let mut map = self.by_type.write().unwrap();
        let Some(entry) = map.get_mut(&TypeId::of::<E>()) else {
            return false;
        };
        let Some(position) = entry.handlers.iter().position(|h| h.name() == name) else {
            return false;
        };
        let mut handlers: Vec<_> = entry.handlers.iter().cloned().collect();
        handlers.remove(position);
        entry.handlers = Arc::new(handlers);
        true
    }

    /// Subscribe a handler invoked for every event type.
    pub fn subscribe_catch_all<H: CatchAllHandler>(&self, handler: H) {
        let erased = erase_catch_all(Arc::new(handler));
        let mut guard = self.catch_all.write().unwrap();
        let mut handlers: Vec<_> = guard.iter().cloned().collect();
        handlers.push(erased);
        *guard = Arc::new(handlers);
    }

    pub fn unsubscribe_catch_all(&self, name: &str) -> bool {
        let mut guard = self.catch_all.write().unwrap();
        let Some(position) = guard.iter().position(|h| h.name() == name) else {
            return false;
        };
        let mut handlers: Vec<_> = guard.iter().cloned().collect();
        handlers.remove(position);
        *guard = Arc::new(handlers);
        true
    }

    /// Handlers for the event's concrete type, then catch-all subscribers,
    /// each group in registration order.
    pub fn handlers_for(&self, event: &dyn AnyEvent) -> Vec<RegisteredEventHandler> {
        let mut out = Vec::new();
        {
            let map = self.by_type.read().unwrap();
            if let Some(entry) = map.get(&event.as_any().type_id()) {
                out.extend(entry.handlers.iter().cloned());
            }
        }
        out.extend(self.catch_all.read().unwrap().iter().cloned());
        out
    }

    /// Resolve a wire type name to its deserializer, if this process knows
    /// the concrete type.
    pub fn deserializer(&self, type_name: &str) -> Option<DeserializeFn> {
        let type_id = *self.names.read().unwrap().get(type_name)?;
        self.by_type
            .read()
            .unwrap()
            .get(&type_id)
            .map(|entry| entry.deserialize.clone())
    }

    pub fn knows_type(&self, type_name: &str) -> bool {
        self.names.read().unwrap().contains_key(type_name)
    }

    fn ensure_entry<E: DomainEvent>(&self) -> Result<(), BusError> {
        let type_id = TypeId::of::<E>();
        let type_name = E::event_type();
        {
            let names = self.names.read().unwrap();
            if let Some(existing) = names.get(type_name) {
                if *existing != type_id {
                    return Err(BusError::contract(format!(
                        "event type name {type_name:?} already registered by a different type"
                    )));
                }
                return Ok(());
            }
        }
        let mut map = self.by_type.write().unwrap();
        let mut names = self.names.write().unwrap();
        // re-check under the write locks
        if let Some(existing) = names.get(type_name) {
            if *existing != type_id {
                return Err(BusError::contract(format!(
                    "event type name {type_name:?} already registered by a different type"
                )));
            }
            return Ok(());
        }
        names.insert(type_name, type_id);
        map.insert(
            type_id,
            EventTypeEntry {
                deserialize: Arc::new(|value| {
                    serde_json::from_value::<E>(value).map(|e| Box::new(e) as BoxedEvent)
                }),
                handlers: Arc::new(Vec::new()),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use soda_core::{CommandMetadata, EventMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Default)]
    struct Ping {
        meta: CommandMetadata,
    }

    impl Command for Ping {
        type Output = ();

        fn metadata(&self) -> &CommandMetadata {
            &self.meta
        }

        fn metadata_mut(&mut self) -> &mut CommandMetadata {
            &mut self.meta
        }
    }

    struct PingHandler;

    #[async_trait]
    impl CommandHandler<Ping> for PingHandler {
        async fn handle(&self, _command: Ping) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pinged {
        #[serde(flatten)]
        meta: EventMetadata,
    }

    impl DomainEvent for Pinged {
        fn event_type() -> &'static str {
            "test.pinged"
        }

        fn metadata(&self) -> &EventMetadata {
            &self.meta
        }

        fn metadata_mut(&mut self) -> &mut EventMetadata {
            &mut self.meta
        }
    }

    struct Counting(Arc<AtomicUsize>, &'static str);

    #[async_trait]
    impl EventHandler<Pinged> for Counting {
        fn name(&self) -> String {
            self.1.to_string()
        }

        async fn handle(&self, _event: &Pinged) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn duplicate_command_handler_is_rejected() {
        let registry = CommandRegistry::new();
        registry.register::<Ping, _>(PingHandler).unwrap();
        let err = registry.register::<Ping, _>(PingHandler).unwrap_err();
        assert!(matches!(err, BusError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn event_handlers_keep_registration_order() {
        let registry = EventRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .subscribe::<Pinged, _>(Counting(counter.clone(), "first"))
            .unwrap();
        registry
            .subscribe::<Pinged, _>(Counting(counter.clone(), "second"))
            .unwrap();

        let event = Pinged {
            meta: EventMetadata::new(),
        };
        let handlers = registry.handlers_for(&event);
        let names: Vec<_> = handlers.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);

        for handler in &handlers {
            handler.invoke(&event).await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_first_match_only() {
        let registry = EventRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .subscribe::<Pinged, _>(Counting(counter.clone(), "dup"))
            .unwrap();
        registry
            .subscribe::<Pinged, _>(Counting(counter.clone(), "dup"))
            .unwrap();

        assert!(registry.unsubscribe::<Pinged>("dup"));
        let event = Pinged {
            meta: EventMetadata::new(),
        };
        assert_eq!(registry.handlers_for(&event).len(), 1);
    }

    #[test]
    fn conflicting_type_names_are_a_configuration_error() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Other {
            #[serde(flatten)]
            meta: EventMetadata,
        }

        impl DomainEvent for Other {
            fn event_type() -> &'static str {
                "test.pinged" // collides with Pinged
            }

            fn metadata(&self) -> &EventMetadata {
                &self.meta
            }

            fn metadata_mut(&mut self) -> &mut EventMetadata {
                &mut self.meta
            }
        }

        let registry = EventRegistry::new();
        registry.register_event_type::<Pinged>().unwrap();
        assert!(registry.register_event_type::<Other>().is_err());
    }

    #[test]
    fn deserializer_resolves_by_wire_name() {
        let registry = EventRegistry::new();
        registry.register_event_type::<Pinged>().unwrap();

        let event = Pinged {
            meta: EventMetadata::new(),
        };
        let json = serde_json::to_value(&event).unwrap();
        let de = registry.deserializer("test.pinged").unwrap();
        let boxed = de(json).unwrap();
        assert_eq!(boxed.event_type(), "test.pinged");
        assert!(registry.deserializer("test.unknown").is_none());
    }
}
