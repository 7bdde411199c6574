//! Command and query contracts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::event::BoxedEvent;

/// Context envelope carried by every command.
///
/// The caller fills in what it knows (often nothing); the send pipeline
/// populates the rest from the current execution context and stamps
/// `hop_count` with the depth the handler will run at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub authorities: Vec<String>,
    /// Token id of the caller's credential.
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub caller_uid: String,
    #[serde(default)]
    pub tenant_id: String,
    /// Free-form extension fields.
    #[serde(default)]
    pub extension: BTreeMap<String, String>,
    /// Depth in the command→event→command chain. Written by the send
    /// pipeline; the value is the depth the handler runs at.
    #[serde(default)]
    pub hop_count: u32,
}

impl CommandMetadata {
    /// Populate empty context fields from the current execution context.
    /// `hop_count` is managed separately by the send pipeline.
    pub fn fill_from_context(&mut self, ctx: &ExecutionContext) {
        if self.request_id.is_empty() {
            self.request_id = ctx.request_id.clone();
        }
        if self.user_name.is_empty() {
            self.user_name = ctx.user_name.clone();
        }
        if self.authorities.is_empty() {
            self.authorities = ctx.authorities.clone();
        }
        if self.jti.is_empty() {
            self.jti = ctx.jti.clone();
        }
        if self.caller_uid.is_empty() {
            self.caller_uid = ctx.caller_uid.clone();
        }
        if self.tenant_id.is_empty() {
            self.tenant_id = ctx.tenant_id.clone();
        }
    }
}

/// Same envelope as [`CommandMetadata`] minus the hop counter; queries do
/// not participate in the recursion chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub authorities: Vec<String>,
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub caller_uid: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub extension: BTreeMap<String, String>,
}

/// An intent to change state; processed by exactly one handler.
///
/// Commands are transient: they are not persisted and never cross the
/// stream transport. Immutable after submission except for context
/// enrichment by the send pipeline.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Handler result type. Results that carry domain events surface them
    /// through [`CommandOutput::emitted_events`] for automatic publication.
    type Output: CommandOutput;

    fn metadata(&self) -> &CommandMetadata;

    fn metadata_mut(&mut self) -> &mut CommandMetadata;
}

/// A read intent; processed by exactly one handler, side-effect free by
/// contract.
pub trait Query: Clone + core::fmt::Debug + Send + Sync + 'static {
    type Output: Send + 'static;

    fn metadata(&self) -> &QueryMetadata;
}

/// Result of a command handler.
///
/// The send pipeline asks the result for the domain events it carries and
/// publishes them (with the command's context synchronized on) when the
/// in-process bus is active. Results that carry no events use the default.
///
/// Implement this for an aggregate output type when handlers return the
/// aggregate itself; the blanket impls cover plain and event-set outputs.
pub trait CommandOutput: Send + 'static {
    fn emitted_events(&self) -> Vec<BoxedEvent> {
        Vec::new()
    }
}

impl CommandOutput for () {}

impl CommandOutput for BoxedEvent {
    fn emitted_events(&self) -> Vec<BoxedEvent> {
        vec![self.clone_boxed()]
    }
}

impl CommandOutput for Vec<BoxedEvent> {
    fn emitted_events(&self) -> Vec<BoxedEvent> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_from_context_respects_existing_values() {
        let mut meta = CommandMetadata {
            request_id: "preset".into(),
            ..Default::default()
        };
        let ctx = ExecutionContext {
            request_id: "ctx".into(),
            user_name: "alice".into(),
            ..Default::default()
        };

        meta.fill_from_context(&ctx);
        assert_eq!(meta.request_id, "preset");
        assert_eq!(meta.user_name, "alice");
    }

    #[test]
    fn unit_output_emits_nothing() {
        assert!(().emitted_events().is_empty());
    }
}
