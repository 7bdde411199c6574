//! Single entry point over the three buses.

use std::sync::Arc;

use soda_core::{BusError, Command, DomainEvent, FailureReport, Query};
use tracing::warn;

use crate::command_bus::CommandBus;
use crate::context_store::{self, SendDepth};
use crate::event_bus::EventPublisher;
use crate::executor::{AsyncCommandPool, CommandSubmission};
use crate::interceptor::short_type_name;
use crate::query_bus::QueryBus;
use crate::transaction::Transaction;

/// Ceiling on synchronous command nesting within one task.
pub const DEFAULT_MAX_SYNC_DEPTH: u32 = 10;

/// Facade for submitting commands and queries.
///
/// The facade never mutates context; context restore/teardown is the
/// interceptor's job inside the buses. What it does own is the synchronous
/// recursion guard: a task-local depth counter plus a breadcrumb trail of
/// command type names, checked on every entry before anything executes.
pub struct CqrsGateway {
    commands: Arc<CommandBus>,
    queries: Arc<QueryBus>,
    publisher: Arc<dyn EventPublisher>,
    pool: AsyncCommandPool,
    max_sync_depth: u32,
}

impl CqrsGateway {
    pub fn new(
        commands: Arc<CommandBus>,
        queries: Arc<QueryBus>,
        publisher: Arc<dyn EventPublisher>,
        pool: AsyncCommandPool,
    ) -> Self {
        Self {
            commands,
            queries,
            publisher,
            pool,
            max_sync_depth: DEFAULT_MAX_SYNC_DEPTH,
        }
    }

    pub fn with_max_sync_depth(mut self, max: u32) -> Self {
        self.max_sync_depth = max;
        self
    }

    pub fn command_bus(&self) -> &Arc<CommandBus> {
        &self.commands
    }

    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.publisher.clone()
    }

    pub fn pool(&self) -> &AsyncCommandPool {
        &self.pool
    }

    fn enter_send<C: Command>(&self) -> Result<SendDepth, BusError> {
        let mut depth = context_store::current_depth();
        depth.depth += 1;
        depth.trail.push(short_type_name::<C>());
        if depth.depth > self.max_sync_depth {
            return Err(BusError::CommandRecursionTooDeep {
                depth: depth.depth,
                max: self.max_sync_depth,
                trail: depth.trail,
            });
        }
        Ok(depth)
    }

    /// Synchronous command submission.
    pub async fn send_command<C: Command>(&self, command: C) -> Result<C::Output, BusError> {
        let depth = self.enter_send::<C>().map_err(report::<C>)?;
        context_store::depth_scope(depth, self.commands.send(command))
            .await
            .map_err(report::<C>)
    }

    /// Asynchronous command submission on the dedicated pool.
    ///
    /// The recursion guard is entered before submission; the returned
    /// handle resolves with the handler outcome.
    pub async fn send_async_command<C: Command>(
        &self,
        command: C,
    ) -> Result<CommandSubmission<C::Output>, BusError> {
        self.enter_send::<C>().map_err(report::<C>)?;
        Ok(self.pool.submit(self.commands.clone(), command).await)
    }

    /// Command submission inside a transaction scope: repository-drained
    /// events publish only after the whole unit of work succeeds.
    pub async fn send_transact_command<C: Command>(
        &self,
        command: C,
    ) -> Result<C::Output, BusError> {
        let depth = self.enter_send::<C>().map_err(report::<C>)?;
        let commands = self.commands.clone();
        Transaction::run(
            self.publisher.clone(),
            context_store::depth_scope(depth, async move { commands.send(command).await }),
        )
        .await
        .map_err(report::<C>)
    }

    /// Query submission; no recursion guard.
    pub async fn send_query<Q: Query>(&self, query: Q) -> Result<Q::Output, BusError> {
        self.queries.send(query).await
    }

    /// Publish an event directly through the configured transport.
    pub async fn publish_event<E: DomainEvent>(&self, event: E) -> Result<(), BusError> {
        self.publisher.publish(Box::new(event)).await
    }
}

/// Log the caller-facing failure envelope at the submission boundary.
fn report<C: Command>(error: BusError) -> BusError {
    let report = FailureReport::new(&error, short_type_name::<C>());
    warn!(
        code = report.code,
        origin = report.origin,
        at = %report.at,
        message = %report.message,
        "command submission failed"
    );
    error
}
