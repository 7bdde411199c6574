//! Stream-backed event bus.
//!
//! Publication appends to the stream and never invokes local handlers;
//! delivery happens solely through the consumer loop so idempotency stays
//! uniform. The loop is supervised: broker errors are logged and ridden
//! out, handler failures retry with backoff and dead-letter on exhaustion,
//! and nothing ever propagates back to the broker.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use soda_core::{AnyEvent, BoxedEvent, BusError, ExecutionContext, HandlerFailure};
use soda_events::{ContextStore, EventRegistry, interceptor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RedisConfig;
use crate::error::TransportError;
use crate::idempotency::IdempotencyStore;
use crate::retry::RetryPolicy;
use crate::serialization::{EventCodec, probe_event_id};
use crate::stream::{
    EventStream, FIELD_DEAD_LETTER_REASON, FIELD_DEAD_LETTER_TIMESTAMP, FIELD_EVENT,
    FIELD_ORIGINAL_ID, FIELD_ORIGINAL_STREAM, FIELD_TYPE, INIT_EVENT_TYPE, StreamMessage,
};

const DEAD_LETTER_MAX_RETRIES: &str = "Max retries exceeded";
const DEAD_LETTER_INTERRUPTED: &str = "Retry interrupted by shutdown";

/// Seconds between idempotency cleanup sweeps.
const CLEANUP_INTERVAL_SECS: u64 = 3_600;

/// Running consumer/cleanup tasks for one stream bus.
pub struct StreamBusHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamBusHandle {
    /// Signal shutdown and wait for the workers to stop. In-flight retry
    /// sleeps are interrupted and their messages dead-lettered.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Consumer-group event bus over a black-box stream.
pub struct StreamEventBus {
    stream: Arc<dyn EventStream>,
    registry: Arc<EventRegistry>,
    codec: EventCodec,
    config: RedisConfig,
    retry: RetryPolicy,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
}

impl StreamEventBus {
    pub fn new(
        stream: Arc<dyn EventStream>,
        registry: Arc<EventRegistry>,
        codec: EventCodec,
        config: RedisConfig,
        idempotency: Option<Arc<dyn IdempotencyStore>>,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&config.stream);
        // local dispatch over this registry now belongs to the consumer loop
        registry.mark_stream_transport();
        Self {
            stream,
            registry,
            codec,
            config,
            retry,
            idempotency,
        }
    }

    /// Ensure the stream and the consumer group exist.
    pub async fn bootstrap(&self) -> Result<(), TransportError> {
        if !self.stream.exists(&self.config.topic).await? {
            let mut fields = BTreeMap::new();
            fields.insert(FIELD_TYPE.to_string(), INIT_EVENT_TYPE.to_string());
            fields.insert(FIELD_EVENT.to_string(), "{}".to_string());
            self.stream.add(&self.config.topic, &fields, None).await?;
            info!(stream = %self.config.topic, "created stream with init sentinel");
        }
        self.stream
            .create_group(&self.config.topic, &self.config.stream.group_name)
            .await?;
        Ok(())
    }

    /// Start the polling workers (and the cleanup sweep when idempotency
    /// is enabled).
    pub fn start(self: &Arc<Self>) -> StreamBusHandle {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        let count = self.config.stream.consumer_count.max(1);
        for index in 0..count {
            let consumer = if count == 1 {
                self.config.stream.consumer_name.clone()
            } else {
                format!("{}-{index}", self.config.stream.consumer_name)
            };
            tasks.push(tokio::spawn(
                self.clone().poll_loop(consumer, shutdown.subscribe()),
            ));
        }

        if self.idempotency.is_some() {
            tasks.push(tokio::spawn(self.clone().cleanup_loop(shutdown.subscribe())));
        }

        StreamBusHandle { shutdown, tasks }
    }

    async fn poll_loop(self: Arc<Self>, consumer: String, mut shutdown: watch::Receiver<bool>) {
        let group = self.config.stream.group_name.clone();
        info!(
            stream = %self.config.topic,
            group = %group,
            consumer = %consumer,
            "stream consumer started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                _ = shutdown.changed() => None,
                polled = self.stream.read_group(
                    &self.config.topic,
                    &group,
                    &consumer,
                    self.config.stream.batch_size,
                    self.config.stream.poll_timeout(),
                ) => Some(polled),
            };
            let Some(polled) = polled else { break };
            match polled {
                Ok(messages) => {
                    for message in messages {
                        self.process_message(message, &group, &mut shutdown).await;
                    }
                }
                Err(e) => {
                    // supervised loop: log, back off one poll interval, go on
                    error!(stream = %self.config.topic, error = %e, "stream poll failed");
                    let interrupted = tokio::select! {
                        _ = shutdown.changed() => true,
                        _ = tokio::time::sleep(self.config.stream.poll_timeout()) => false,
                    };
                    if interrupted {
                        break;
                    }
                }
            }
        }
        info!(stream = %self.config.topic, consumer = %consumer, "stream consumer stopped");
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(store) = self.idempotency.clone() else {
            return;
        };
        let period = std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS);
        loop {
            let interrupted = tokio::select! {
                _ = shutdown.changed() => true,
                _ = tokio::time::sleep(period) => false,
            };
            if interrupted {
                break;
            }
            match store.cleanup_expired().await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "idempotency cleanup removed expired records");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "idempotency cleanup failed"),
            }
        }
    }

    /// Process one polled entry through precheck → claim → decode →
    /// dispatch-with-retry → ack/DLQ. Never propagates; every path logs.
    async fn process_message(
        &self,
        message: StreamMessage,
        group: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let type_name = message.field(FIELD_TYPE).unwrap_or_default().to_string();
        if type_name == INIT_EVENT_TYPE {
            self.ack(group, &message.id).await;
            return;
        }
        let Some(payload) = message.field(FIELD_EVENT).map(str::to_string) else {
            warn!(id = %message.id, "entry without event field; dropping");
            self.ack(group, &message.id).await;
            return;
        };

        // cheap id probe, then idempotency precheck and claim
        let event_id = probe_event_id(&payload);
        if let (Some(store), Some(event_id)) = (self.idempotency.as_ref(), event_id.as_deref()) {
            match store.status(event_id).await {
                Ok(Some(crate::idempotency::IdempotencyStatus::Success)) => {
                    debug!(event_id, "event already processed; ack and drop");
                    self.ack(group, &message.id).await;
                    return;
                }
                Ok(Some(crate::idempotency::IdempotencyStatus::Processing)) => {
                    // another worker owns it; leave the entry pending
                    debug!(event_id, "event in flight elsewhere; leaving unacked");
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(event_id, error = %e, "idempotency precheck failed; proceeding"),
            }
            match store.begin_processing(event_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(event_id, "lost begin-processing race; ack and drop");
                    self.ack(group, &message.id).await;
                    return;
                }
                Err(e) => warn!(event_id, error = %e, "begin-processing failed; proceeding"),
            }
        }

        // resolve the concrete type; an unknown name is the expected
        // fan-out case for consumers without that event class
        let Some(deserialize) = self.registry.deserializer(&type_name) else {
            warn!(
                id = %message.id,
                event_type = %type_name,
                "event type not present in this consumer; ack and drop"
            );
            self.release_claim(event_id.as_deref(), "event type not present in this consumer")
                .await;
            self.ack(group, &message.id).await;
            return;
        };
        let event: BoxedEvent = match EventCodec::parse_payload(&payload)
            .map_err(|e| e.to_string())
            .and_then(|value| deserialize(value).map_err(|e| e.to_string()))
        {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    id = %message.id,
                    event_type = %type_name,
                    error = %e,
                    "payload does not match the registered type; ack and drop"
                );
                self.release_claim(event_id.as_deref(), "payload deserialization failed")
                    .await;
                self.ack(group, &message.id).await;
                return;
            }
        };

        // dispatch on a stream-consumer context so local delivery is
        // permitted and nested sends inherit the transported hop
        let consumer_ctx = ExecutionContext::default().with_stream_consumer(true);
        let mut attempt: u32 = 0;
        loop {
            let (failures, results) = ContextStore::scope(
                consumer_ctx.clone(),
                self.dispatch_once(event.as_ref(), event_id.as_deref()),
            )
            .await;

            if failures.is_empty() {
                if let (Some(store), Some(event_id)) =
                    (self.idempotency.as_ref(), event_id.as_deref())
                {
                    if let Err(e) = store.mark_success(event_id, Some(results)).await {
                        warn!(event_id, error = %e, "failed to record event success");
                    }
                }
                self.ack(group, &message.id).await;
                return;
            }

            if attempt >= self.retry.max_retries {
                warn!(
                    id = %message.id,
                    event_type = %type_name,
                    attempts = attempt + 1,
                    failed_handlers = failures.len(),
                    "retries exhausted; dead-lettering"
                );
                self.mark_event_failed(event_id.as_deref(), &failures).await;
                self.dead_letter(&message, DEAD_LETTER_MAX_RETRIES).await;
                self.ack(group, &message.id).await;
                return;
            }

            let delay = self.retry.delay(attempt);
            attempt += 1;
            debug!(
                id = %message.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "handler failure; retrying after backoff"
            );
            let interrupted = tokio::select! {
                _ = shutdown.changed() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                self.mark_event_failed(event_id.as_deref(), &failures).await;
                self.dead_letter(&message, DEAD_LETTER_INTERRUPTED).await;
                self.ack(group, &message.id).await;
                return;
            }
        }
    }

    /// One delivery attempt: every registered handler, in order, skipping
    /// handlers with a per-(event, handler) SUCCESS record.
    async fn dispatch_once(
        &self,
        event: &dyn AnyEvent,
        event_id: Option<&str>,
    ) -> (Vec<HandlerFailure>, BTreeMap<String, bool>) {
        let handlers = self.registry.handlers_for(event);
        let mut failures = Vec::new();
        let mut results = BTreeMap::new();

        for handler in &handlers {
            let handler_key =
                event_id.map(|event_id| format!("{event_id}::{}", handler.name()));

            if let (Some(store), Some(key)) = (self.idempotency.as_ref(), handler_key.as_deref()) {
                match store.status(key).await {
                    Ok(Some(crate::idempotency::IdempotencyStatus::Success)) => {
                        debug!(handler = handler.name(), "handler already succeeded; skipping");
                        results.insert(handler.name().to_string(), true);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(handler = handler.name(), error = %e, "handler status check failed")
                    }
                }
            }

            match interceptor::dispatch_to_handler(handler, event).await {
                Ok(()) => {
                    results.insert(handler.name().to_string(), true);
                    if let (Some(store), Some(key)) =
                        (self.idempotency.as_ref(), handler_key.as_deref())
                    {
                        if let Err(e) = store.mark_success(key, None).await {
                            warn!(handler = handler.name(), error = %e, "failed to record handler success");
                        }
                    }
                }
                Err(error) => {
                    results.insert(handler.name().to_string(), false);
                    if let (Some(store), Some(key)) =
                        (self.idempotency.as_ref(), handler_key.as_deref())
                    {
                        if let Err(e) = store.mark_failed(key, error.message()).await {
                            warn!(handler = handler.name(), error = %e, "failed to record handler failure");
                        }
                    }
                    failures.push(HandlerFailure {
                        handler: handler.name().to_string(),
                        error,
                    });
                }
            }
        }

        (failures, results)
    }

    /// Undo an event-level PROCESSING claim when the message is dropped
    /// before dispatch, so other consumers sharing the store can claim it.
    async fn release_claim(&self, event_id: Option<&str>, reason: &str) {
        if let (Some(store), Some(event_id)) = (self.idempotency.as_ref(), event_id) {
            if let Err(e) = store.mark_failed(event_id, reason).await {
                warn!(event_id, error = %e, "failed to release processing claim");
            }
        }
    }

    async fn mark_event_failed(&self, event_id: Option<&str>, failures: &[HandlerFailure]) {
        if let (Some(store), Some(event_id)) = (self.idempotency.as_ref(), event_id) {
            let summary = failures
                .iter()
                .map(|f| format!("{}: {}", f.handler, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            if let Err(e) = store.mark_failed(event_id, &summary).await {
                warn!(event_id, error = %e, "failed to record event failure");
            }
        }
    }

    /// Copy the entry to the dead-letter stream with routing metadata.
    async fn dead_letter(&self, message: &StreamMessage, reason: &str) {
        let mut fields = message.fields.clone();
        fields.insert(FIELD_DEAD_LETTER_REASON.to_string(), reason.to_string());
        fields.insert(
            FIELD_DEAD_LETTER_TIMESTAMP.to_string(),
            Utc::now().to_rfc3339(),
        );
        fields.insert(
            FIELD_ORIGINAL_STREAM.to_string(),
            self.config.topic.clone(),
        );
        fields.insert(FIELD_ORIGINAL_ID.to_string(), message.id.clone());

        match self
            .stream
            .add(&self.config.stream.dead_letter_stream, &fields, None)
            .await
        {
            Ok(dlq_id) => warn!(
                id = %message.id,
                dlq_id = %dlq_id,
                reason,
                "message moved to dead-letter stream"
            ),
            Err(e) => error!(
                id = %message.id,
                error = %e,
                "failed to write dead-letter entry"
            ),
        }
    }

    async fn ack(&self, group: &str, id: &str) {
        if let Err(e) = self.stream.ack(&self.config.topic, group, id).await {
            error!(id, error = %e, "XACK failed");
        }
    }
}

#[async_trait]
impl soda_events::EventPublisher for StreamEventBus {
    fn defers_command_results(&self) -> bool {
        true
    }

    /// Serialize and append; local handlers are never invoked here.
    async fn publish(&self, event: BoxedEvent) -> Result<(), BusError> {
        let payload = self.codec.encode(event.as_ref())?;
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_EVENT.to_string(), payload);
        fields.insert(FIELD_TYPE.to_string(), event.event_type().to_string());
        let id = self
            .stream
            .add(
                &self.config.topic,
                &fields,
                Some(self.config.stream.maxlen),
            )
            .await
            .map_err(BusError::from)?;
        debug!(
            stream = %self.config.topic,
            id = %id,
            event_type = event.event_type(),
            "event appended to stream"
        );
        Ok(())
    }
}
