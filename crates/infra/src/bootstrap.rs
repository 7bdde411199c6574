//! Bus assembly from configuration.
//!
//! Registration happens here, before the gateway exists; registries are
//! read-mostly afterwards. Exactly one publishing site is active per
//! configuration: `simple` publishes in-process at the command/repository
//! layer, `redis` appends to the stream and delivers only through the
//! consumer loop.

use std::sync::Arc;

use soda_core::{BusError, Command, DomainEvent, Query};
use soda_events::{
    AsyncCommandPool, CommandBus, CommandHandler, CommandRegistry, CqrsGateway, EventHandler,
    EventPublisher, EventRegistry, LocalEventBus, QueryBus, QueryHandler, QueryRegistry,
};

use crate::config::{BusType, SodaEventConfig};
use crate::idempotency::{InMemoryIdempotencyStore, IdempotencyStore};
use crate::serialization::EventCodec;
use crate::stream::EventStream;
use crate::stream_bus::{StreamBusHandle, StreamEventBus};

/// A fully wired bus: the facade plus the transport workers feeding it.
pub struct SodaHandle {
    pub gateway: Arc<CqrsGateway>,
    stream: Option<StreamBusHandle>,
}

impl SodaHandle {
    pub fn gateway(&self) -> Arc<CqrsGateway> {
        self.gateway.clone()
    }

    /// Stop transport workers (no-op for the simple bus).
    pub async fn shutdown(self) {
        if let Some(stream) = self.stream {
            stream.shutdown().await;
        }
    }
}

/// Builder collecting handler registrations and transport choices.
pub struct SodaBusBuilder {
    config: SodaEventConfig,
    commands: Arc<CommandRegistry>,
    queries: Arc<QueryRegistry>,
    events: Arc<EventRegistry>,
    stream: Option<Arc<dyn EventStream>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
}

impl SodaBusBuilder {
    pub fn new(config: SodaEventConfig) -> Self {
        Self {
            config,
            commands: Arc::new(CommandRegistry::new()),
            queries: Arc::new(QueryRegistry::new()),
            events: Arc::new(EventRegistry::new()),
            stream: None,
            idempotency: None,
        }
    }

    pub fn register_command<C, H>(self, handler: H) -> Result<Self, BusError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.commands.register::<C, _>(handler)?;
        Ok(self)
    }

    pub fn register_query<Q, H>(self, handler: H) -> Result<Self, BusError>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.queries.register::<Q, _>(handler)?;
        Ok(self)
    }

    pub fn subscribe<E, H>(self, handler: H) -> Result<Self, BusError>
    where
        E: DomainEvent,
        H: EventHandler<E>,
    {
        self.events.subscribe::<E, _>(handler)?;
        Ok(self)
    }

    /// Make an event type resolvable from the wire without a handler.
    pub fn register_event_type<E: DomainEvent>(self) -> Result<Self, BusError> {
        self.events.register_event_type::<E>()?;
        Ok(self)
    }

    pub fn event_registry(&self) -> Arc<EventRegistry> {
        self.events.clone()
    }

    /// Supply the stream implementation (in-memory twin, or a shared
    /// broker handle). Without this, `redis` bus type connects using the
    /// configured URL.
    pub fn with_stream(mut self, stream: Arc<dyn EventStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Supply the idempotency store. Without this, an enabled idempotency
    /// config gets a Redis store (or an in-memory one when a custom stream
    /// was supplied).
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub async fn build(self) -> Result<SodaHandle, BusError> {
        let pool = AsyncCommandPool::new(&self.config.async_pool)?;

        let (publisher, stream_handle): (Arc<dyn EventPublisher>, Option<StreamBusHandle>) =
            match self.config.bus_type {
                BusType::Simple => (Arc::new(LocalEventBus::new(self.events.clone())), None),
                BusType::Redis => {
                    let custom_stream = self.stream.is_some();
                    let stream: Arc<dyn EventStream> = match self.stream {
                        Some(stream) => stream,
                        None => Arc::new(connect_redis(&self.config.redis.url).await?),
                    };
                    let idempotency = if self.config.redis.stream.idempotency.enabled {
                        Some(match self.idempotency {
                            Some(store) => store,
                            None => {
                                default_idempotency_store(&self.config, custom_stream).await?
                            }
                        })
                    } else {
                        None
                    };
                    let bus = Arc::new(StreamEventBus::new(
                        stream,
                        self.events.clone(),
                        EventCodec::new(self.config.serialization),
                        self.config.redis.clone(),
                        idempotency,
                    ));
                    bus.bootstrap().await?;
                    let handle = bus.start();
                    (bus, Some(handle))
                }
            };

        let command_bus = Arc::new(CommandBus::new(self.commands, publisher.clone()));
        let query_bus = Arc::new(QueryBus::new(self.queries));
        let gateway = Arc::new(CqrsGateway::new(command_bus, query_bus, publisher, pool));

        Ok(SodaHandle {
            gateway,
            stream: stream_handle,
        })
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> Result<crate::stream::RedisEventStream, BusError> {
    Ok(crate::stream::RedisEventStream::connect(url).await?)
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str) -> Result<crate::stream::InMemoryEventStream, BusError> {
    Err(BusError::contract(
        "redis bus type requires the `redis` feature or an explicit stream",
    ))
}

/// A broker-backed config shares records through the broker; a custom
/// (in-memory) stream gets an in-memory store to match.
async fn default_idempotency_store(
    config: &SodaEventConfig,
    custom_stream: bool,
) -> Result<Arc<dyn IdempotencyStore>, BusError> {
    #[cfg(feature = "redis")]
    if !custom_stream {
        let store = crate::idempotency::RedisIdempotencyStore::connect(
            &config.redis.url,
            &config.redis.stream.idempotency,
        )
        .await?;
        return Ok(Arc::new(store));
    }
    let _ = custom_stream;
    Ok(Arc::new(InMemoryIdempotencyStore::new(
        config.redis.stream.idempotency.expire(),
    )))
}
