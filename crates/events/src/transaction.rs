//! Task-local transaction scope with after-commit publication.
//!
//! There is no ambient transaction manager in this runtime; the facade's
//! transactional send (or application code) opens a scope, repository
//! publication defers into it, and the scope publishes on success or
//! discards on failure. Rollback therefore produces no ghost events.

use std::future::Future;
use std::sync::{Arc, Mutex};

use soda_core::{BoxedEvent, BusError};
use tracing::warn;

use crate::event_bus::EventPublisher;

tokio::task_local! {
    static TRANSACTION: TransactionScope;
}

#[derive(Clone, Default)]
struct TransactionScope {
    deferred: Arc<Mutex<Vec<BoxedEvent>>>,
}

impl TransactionScope {
    fn take(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.deferred.lock().unwrap())
    }
}

/// Entry points for the task's transaction scope.
pub struct Transaction;

impl Transaction {
    /// True while the current task runs inside [`Transaction::run`].
    pub fn is_active() -> bool {
        TRANSACTION.try_with(|_| ()).is_ok()
    }

    /// Queue events for publication after the surrounding transaction
    /// commits. Returns the events back when no transaction is active so
    /// the caller can publish inline.
    pub fn defer_publication(events: Vec<BoxedEvent>) -> Result<(), Vec<BoxedEvent>> {
        if !Self::is_active() {
            return Err(events);
        }
        TRANSACTION.with(|scope| scope.deferred.lock().unwrap().extend(events));
        Ok(())
    }

    /// Run `fut` as a unit of work. Completion with `Ok` is the commit
    /// point: deferred events publish in deferral order. Completion with
    /// `Err` is a rollback: deferred events are discarded.
    pub async fn run<T, F>(
        publisher: Arc<dyn EventPublisher>,
        fut: F,
    ) -> Result<T, BusError>
    where
        F: Future<Output = Result<T, BusError>>,
    {
        let scope = TransactionScope::default();
        let result = TRANSACTION.scope(scope.clone(), fut).await;
        let deferred = scope.take();
        match result {
            Ok(value) => {
                if !deferred.is_empty() {
                    publisher.publish_all(deferred).await?;
                }
                Ok(value)
            }
            Err(error) => {
                if !deferred.is_empty() {
                    warn!(
                        discarded = deferred.len(),
                        error = %error,
                        "transaction rolled back; deferred events discarded"
                    );
                }
                Err(error)
            }
        }
    }
}
