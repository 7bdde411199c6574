//! Fixed-order advice applied around handler invocations.
//!
//! Order: context-restore → hop-check → log → proceed → log → publish →
//! context-clear. The hop-check and publication steps live in the command
//! bus; this module owns context install/teardown and the structured log
//! lines shared by all three buses.

use std::time::Instant;

use soda_core::{AnyEvent, ExecutionContext, HandlerError};
use tracing::{debug, warn};

use crate::context_store::ContextStore;
use crate::registry::RegisteredEventHandler;

const SUMMARY_LIMIT: usize = 240;

/// Debug-format a message argument for the log line, truncated so large
/// payloads never dominate the log stream.
pub(crate) fn summarize<T: core::fmt::Debug>(value: &T) -> String {
    let mut text = format!("{value:?}");
    if text.len() > SUMMARY_LIMIT {
        let mut cut = SUMMARY_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

/// Last path segment of a type name; used for breadcrumb trails and logs.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Invoke one event handler with the interceptor applied: the event's
/// envelope is installed as the task context for the duration of the call
/// and cleared on exit. The stream-consumer bit of the enclosing context is
/// carried forward so nested dispatch stays permitted on consumer tasks.
pub async fn dispatch_to_handler(
    handler: &RegisteredEventHandler,
    event: &dyn AnyEvent,
) -> Result<(), HandlerError> {
    let ctx = ExecutionContext::from_event(event.metadata())
        .with_stream_consumer(ContextStore::is_stream_consumer());
    let event_type = event.event_type();
    let user = ctx.user_name.clone();
    debug!(
        event_type,
        handler = handler.name(),
        user = %user,
        hop = ctx.hop_count,
        "event handler start"
    );

    let started = Instant::now();
    let result = ContextStore::scope(ctx, handler.invoke(event)).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(()) => debug!(
            event_type,
            handler = handler.name(),
            duration_ms,
            user = %user,
            "event handler done"
        ),
        Err(error) => warn!(
            event_type,
            handler = handler.name(),
            duration_ms,
            user = %user,
            error = %error,
            "event handler failed"
        ),
    }
    result
}
