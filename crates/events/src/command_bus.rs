//! Command execution pipeline.
//!
//! Flow:
//! send → enrich context → hop-check → resolve handler → invoke under the
//! command's context → publish result events (in-process mode only).

use std::sync::Arc;
use std::time::Instant;

use soda_core::{BusError, Command, CommandOutput, ExecutionContext};
use tracing::{debug, info, warn};

use crate::context_store::ContextStore;
use crate::event_bus::EventPublisher;
use crate::interceptor::{short_type_name, summarize};
use crate::registry::CommandRegistry;

/// Ceiling on the command→event→command hop chain.
pub const DEFAULT_MAX_ASYNC_HOPS: u32 = 20;

/// Routes commands to their single registered handler.
pub struct CommandBus {
    registry: Arc<CommandRegistry>,
    publisher: Arc<dyn EventPublisher>,
    max_hops: u32,
}

impl CommandBus {
    pub fn new(registry: Arc<CommandRegistry>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            registry,
            publisher,
            max_hops: DEFAULT_MAX_ASYNC_HOPS,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Dispatch a command to its handler.
    ///
    /// The command is enriched from the current execution context (empty
    /// `request_id` marks an unenriched envelope), stamped with the next
    /// hop depth, and refused outright when that next hop would exceed the
    /// ceiling; the handler body is never entered in that case.
    pub async fn send<C: Command>(&self, mut command: C) -> Result<C::Output, BusError> {
        let command_type = short_type_name::<C>();

        // 1) Context enrichment
        let ctx = ContextStore::current();
        if command.metadata().request_id.is_empty() {
            if let Some(ctx) = &ctx {
                command.metadata_mut().fill_from_context(ctx);
            }
        }

        // 2) Hop ceiling: refuse the send that would exceed it
        let current_hop = ctx.as_ref().map_or(0, |c| c.hop_count);
        let next_hop = current_hop + 1;
        if next_hop > self.max_hops {
            warn!(
                command = command_type,
                hop = next_hop,
                max = self.max_hops,
                "refusing command send; hop ceiling reached"
            );
            return Err(BusError::AsyncRecursionTooDeep {
                hops: next_hop,
                max: self.max_hops,
            });
        }
        command.metadata_mut().hop_count = next_hop;

        // 3) Resolve the single handler
        let resolved = self.registry.resolve::<C>().ok_or(
            BusError::NoHandlerRegistered {
                message_type: std::any::type_name::<C>(),
            },
        )?;

        // 4) Invoke under the command's context
        let meta = command.metadata().clone();
        let argument = summarize(&command);
        let exec_ctx = ExecutionContext::from_command(&meta);
        info!(
            command = command_type,
            handler = %resolved.name,
            argument = %argument,
            user = %meta.user_name,
            request_id = %meta.request_id,
            hop = meta.hop_count,
            "command start"
        );
        let started = Instant::now();
        let result = ContextStore::scope(exec_ctx, resolved.handler.handle(command)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match result {
            Ok(output) => {
                info!(
                    command = command_type,
                    handler = %resolved.name,
                    duration_ms,
                    user = %meta.user_name,
                    "command done"
                );
                output
            }
            Err(source) => {
                warn!(
                    command = command_type,
                    handler = %resolved.name,
                    duration_ms,
                    user = %meta.user_name,
                    error = %source,
                    "command failed"
                );
                return Err(BusError::Handler {
                    message_type: std::any::type_name::<C>(),
                    handler: resolved.name,
                    source,
                });
            }
        };

        // 5) Publish result events unless a persistent transport owns
        //    publication (repository-drained events reach it instead).
        let mut events = output.emitted_events();
        if !events.is_empty() {
            if self.publisher.defers_command_results() {
                debug!(
                    command = command_type,
                    count = events.len(),
                    "result events deferred to repository publication"
                );
            } else {
                for event in &mut events {
                    event.metadata_mut().sync_from_command(&meta);
                }
                self.publisher.publish_all(events).await?;
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::LocalEventBus;
    use crate::registry::{CommandHandler, EventHandler, EventRegistry};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use soda_core::{
        BoxedEvent, CommandMetadata, DomainEvent, EventMetadata, HandlerError,
    };
    use std::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    struct Create {
        meta: CommandMetadata,
    }

    impl Command for Create {
        type Output = Vec<BoxedEvent>;

        fn metadata(&self) -> &CommandMetadata {
            &self.meta
        }

        fn metadata_mut(&mut self) -> &mut CommandMetadata {
            &mut self.meta
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Created {
        #[serde(flatten)]
        meta: EventMetadata,
    }

    impl DomainEvent for Created {
        fn event_type() -> &'static str {
            "test.created"
        }

        fn metadata(&self) -> &EventMetadata {
            &self.meta
        }

        fn metadata_mut(&mut self) -> &mut EventMetadata {
            &mut self.meta
        }
    }

    struct CreateHandler;

    #[async_trait]
    impl CommandHandler<Create> for CreateHandler {
        async fn handle(&self, _command: Create) -> Result<Vec<BoxedEvent>, HandlerError> {
            Ok(vec![Box::new(Created {
                meta: EventMetadata::new(),
            })])
        }
    }

    fn bus_with(registry: Arc<EventRegistry>) -> CommandBus {
        let commands = Arc::new(CommandRegistry::new());
        commands.register::<Create, _>(CreateHandler).unwrap();
        CommandBus::new(commands, Arc::new(LocalEventBus::new(registry)))
    }

    #[tokio::test]
    async fn missing_handler_is_reported() {
        let bus = CommandBus::new(
            Arc::new(CommandRegistry::new()),
            Arc::new(LocalEventBus::new(Arc::new(EventRegistry::new()))),
        );
        let err = bus.send(Create::default()).await.unwrap_err();
        assert!(matches!(err, BusError::NoHandlerRegistered { .. }));
    }

    #[tokio::test]
    async fn result_events_inherit_the_command_context() {
        let registry = Arc::new(EventRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Capture(Arc<Mutex<Vec<(String, u32)>>>);

        #[async_trait]
        impl EventHandler<Created> for Capture {
            async fn handle(&self, event: &Created) -> Result<(), HandlerError> {
                let meta = DomainEvent::metadata(event);
                self.0
                    .lock()
                    .unwrap()
                    .push((meta.request_id.clone(), meta.hop_count));
                Ok(())
            }
        }

        registry
            .subscribe::<Created, _>(Capture(seen.clone()))
            .unwrap();
        let bus = bus_with(registry);

        let mut command = Create::default();
        command.meta.request_id = "r-1".into();
        bus.send(command).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "r-1");
        // the event inherits the command's hop (1 for a top-level send)
        assert_eq!(seen[0].1, 1);
    }

    #[tokio::test]
    async fn hop_ceiling_refuses_before_the_handler() {
        let bus = bus_with(Arc::new(EventRegistry::new())).with_max_hops(3);
        let ctx = ExecutionContext {
            hop_count: 3,
            ..Default::default()
        };
        let err = ContextStore::scope(ctx, bus.send(Create::default()))
            .await
            .unwrap_err();
        match err {
            BusError::AsyncRecursionTooDeep { hops, max } => {
                assert_eq!(hops, 4);
                assert_eq!(max, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
