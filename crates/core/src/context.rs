//! Per-unit-of-work execution context.

use crate::event::EventMetadata;
use crate::message::CommandMetadata;

/// Metadata carried across one unit of work.
///
/// Created when a command or event handler is entered, destroyed when it
/// exits. Within a task it travels via task-local storage; across the
/// stream transport it travels embedded in the event payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub request_id: String,
    pub user_name: String,
    pub authorities: Vec<String>,
    pub jti: String,
    pub caller_uid: String,
    pub tenant_id: String,
    /// Depth in the command→event→command chain the current handler runs at.
    pub hop_count: u32,
    /// True only on stream-consumer tasks; gates local event dispatch when a
    /// persistent transport is configured.
    pub stream_consumer: bool,
}

impl ExecutionContext {
    pub fn from_command(meta: &CommandMetadata) -> Self {
        Self {
            request_id: meta.request_id.clone(),
            user_name: meta.user_name.clone(),
            authorities: meta.authorities.clone(),
            jti: meta.jti.clone(),
            caller_uid: meta.caller_uid.clone(),
            tenant_id: meta.tenant_id.clone(),
            hop_count: meta.hop_count,
            stream_consumer: false,
        }
    }

    pub fn from_event(meta: &EventMetadata) -> Self {
        Self {
            request_id: meta.request_id.clone(),
            user_name: meta.user_name.clone(),
            authorities: meta.authorities.clone(),
            jti: meta.jti.clone(),
            caller_uid: meta.caller_uid.clone(),
            tenant_id: meta.tenant_id.clone(),
            hop_count: meta.hop_count,
            stream_consumer: false,
        }
    }

    pub fn with_stream_consumer(mut self, value: bool) -> Self {
        self.stream_consumer = value;
        self
    }
}
