//! Infrastructure layer: configuration, stream transport, idempotency.
//!
//! The broker is treated as a black-box consumer-group stream with
//! XADD/XREADGROUP/XACK semantics. A Redis implementation ships behind the
//! `redis` feature (default); an in-memory twin backs tests and the
//! `simple` development profile.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod retry;
pub mod serialization;
pub mod stream;
pub mod stream_bus;


pub use bootstrap::{SodaBusBuilder, SodaHandle};
pub use config::{BusType, RedisConfig, SodaEventConfig, StreamSettings};
pub use error::TransportError;
pub use idempotency::{
    IdempotencyRecord, IdempotencyStatus, IdempotencyStore, InMemoryIdempotencyStore,
};
pub use retry::RetryPolicy;
pub use serialization::{CircularReferenceHandler, EventCodec, SerializationConfig};
pub use stream::{EventStream, InMemoryEventStream, StreamMessage};
pub use stream_bus::{StreamBusHandle, StreamEventBus};

#[cfg(feature = "redis")]
pub use idempotency::RedisIdempotencyStore;
#[cfg(feature = "redis")]
pub use stream::RedisEventStream;
