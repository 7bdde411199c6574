//! Repository decorator that turns aggregate mutations into publications.

use std::sync::Arc;

use async_trait::async_trait;
use soda_core::{Aggregate, HandlerError};
use tracing::debug;

use crate::context_store::ContextStore;
use crate::event_bus::EventPublisher;
use crate::transaction::Transaction;

/// Aggregate persistence seam.
///
/// Only the mutation entry points the event pipeline hooks are specified;
/// storage, loading, and querying are the application's business. Methods a
/// store does not support keep the defaults.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    async fn save(&self, aggregate: &mut A) -> Result<(), HandlerError>;

    async fn update(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        let _ = aggregate;
        Err(HandlerError::new("update is not supported by this repository"))
    }

    async fn delete(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        let _ = aggregate;
        Err(HandlerError::new("delete is not supported by this repository"))
    }

    /// Generic mutation entry for stores that expose a single verb.
    async fn operate(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        let _ = aggregate;
        Err(HandlerError::new("operate is not supported by this repository"))
    }
}

/// Decorates a repository so every successful mutation drains the
/// aggregate's pending events, enriches them with the current execution
/// context, and publishes them: after commit when a transaction scope is
/// active, inline otherwise. A failed mutation leaves the pending list
/// untouched.
pub struct PublishingRepository<R> {
    inner: R,
    publisher: Arc<dyn EventPublisher>,
}

impl<R> PublishingRepository<R> {
    pub fn new(inner: R, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { inner, publisher }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn flush_pending<A: Aggregate>(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        let mut events = aggregate.pending_events_mut().drain();
        if events.is_empty() {
            return Ok(());
        }

        if let Some(ctx) = ContextStore::current() {
            for event in &mut events {
                event.metadata_mut().enrich_from_context(&ctx);
            }
        }

        match Transaction::defer_publication(events) {
            Ok(()) => {
                debug!("pending events deferred until commit");
                Ok(())
            }
            Err(events) => self
                .publisher
                .publish_all(events)
                .await
                .map_err(|e| HandlerError::with_source("event publication failed", e)),
        }
    }
}

#[async_trait]
impl<A, R> Repository<A> for PublishingRepository<R>
where
    A: Aggregate + 'static,
    R: Repository<A>,
{
    async fn save(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        self.inner.save(aggregate).await?;
        self.flush_pending(aggregate).await
    }

    async fn update(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        self.inner.update(aggregate).await?;
        self.flush_pending(aggregate).await
    }

    async fn delete(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        self.inner.delete(aggregate).await?;
        self.flush_pending(aggregate).await
    }

    async fn operate(&self, aggregate: &mut A) -> Result<(), HandlerError> {
        self.inner.operate(aggregate).await?;
        self.flush_pending(aggregate).await
    }
}
