//! Unified Stream Model
//!
//! A stream produces zero or more non-terminal events followed by exactly
//! one terminal event (`Done` or `Error`). Consumers must stop iterating
//! after a terminal event; the orchestrator's instrumentation enforces this
//! for adapter-produced streams. On external cancellation the stream simply
//! ends without a terminal event.

use std::pin::Pin;

use futures::Stream;

use crate::error::AiError;
use crate::types::{FinishReason, TokenUsage, ToolCall};
use crate::utils::cancel::CancelHandle;

/// Closed set of unified stream events.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content.
    Text { delta: String },
    /// A complete tool call, emitted once accumulation finishes.
    ToolCall(ToolCall),
    /// Partial tool-call arguments (vendor-dependent).
    ToolCallDelta {
        id: String,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Interim or final usage update.
    Usage(TokenUsage),
    /// Terminal: the vendor finished cleanly.
    Done {
        finish_reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    },
    /// Terminal: a typed mid-stream failure.
    Error(AiError),
}

impl StreamEvent {
    /// Whether this event terminates the stream.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}

/// Unified event stream produced by adapters and the orchestrator.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// An event stream paired with its cancellation handle.
pub struct StreamHandle {
    pub stream: EventStream,
    pub cancel: CancelHandle,
}
