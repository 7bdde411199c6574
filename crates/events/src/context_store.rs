//! Task-local carrier for the execution context.
//!
//! Installation is scope-based: the value is present exactly for the
//! duration of the wrapped future and is torn down on every exit path,
//! including panics and cancellation, so reused worker tasks never observe
//! a predecessor's context.

use std::future::Future;

use soda_core::ExecutionContext;

tokio::task_local! {
    static CONTEXT: ExecutionContext;
    static SEND_DEPTH: SendDepth;
}

/// Synchronous command-nesting bookkeeping for the facade guard.
#[derive(Debug, Clone, Default)]
pub(crate) struct SendDepth {
    pub depth: u32,
    pub trail: Vec<&'static str>,
}

/// Access to the current task's execution context.
pub struct ContextStore;

impl ContextStore {
    /// Snapshot of the current context, if one is installed.
    pub fn current() -> Option<ExecutionContext> {
        CONTEXT.try_with(Clone::clone).ok()
    }

    /// Hop depth the current handler runs at; 0 outside any handler.
    pub fn current_hop() -> u32 {
        CONTEXT.try_with(|ctx| ctx.hop_count).unwrap_or(0)
    }

    pub fn is_stream_consumer() -> bool {
        CONTEXT.try_with(|ctx| ctx.stream_consumer).unwrap_or(false)
    }

    /// Run `fut` with `ctx` installed as the task's execution context.
    pub async fn scope<F: Future>(ctx: ExecutionContext, fut: F) -> F::Output {
        CONTEXT.scope(ctx, fut).await
    }
}

pub(crate) fn current_depth() -> SendDepth {
    SEND_DEPTH.try_with(Clone::clone).unwrap_or_default()
}

pub(crate) async fn depth_scope<F: Future>(depth: SendDepth, fut: F) -> F::Output {
    SEND_DEPTH.scope(depth, fut).await
}
