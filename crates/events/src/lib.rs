//! Bus fabric: type-dispatched command/query/event routing.
//!
//! Registries are populated at bootstrap; the buses apply a fixed
//! interceptor order around every handler invocation (context-restore →
//! hop-check → log → proceed → log → publish → context-clear). The
//! persistent transport lives in `soda-infra` and plugs in through
//! [`EventPublisher`] and [`EventRegistry`].

pub mod command_bus;
pub mod context_store;
pub mod event_bus;
pub mod executor;
pub mod facade;
pub mod interceptor;
pub mod query_bus;
pub mod registry;
pub mod repository;
pub mod transaction;

pub use command_bus::{CommandBus, DEFAULT_MAX_ASYNC_HOPS};
pub use context_store::ContextStore;
pub use event_bus::{EventDispatcher, EventPublisher, LocalEventBus};
pub use executor::{AsyncCommandPool, AsyncPoolConfig, CommandSubmission, PoolStats};
pub use facade::{CqrsGateway, DEFAULT_MAX_SYNC_DEPTH};
pub use query_bus::QueryBus;
pub use registry::{
    CatchAllHandler, CommandHandler, CommandRegistry, DeserializeFn, EventHandler,
    EventRegistry, QueryHandler, QueryRegistry, RegisteredEventHandler,
};
pub use repository::{PublishingRepository, Repository};
pub use transaction::Transaction;
