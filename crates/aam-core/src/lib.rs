//! Shared model for the agent activity monitor: the transport envelope and
//! its validation gate, typed agent events, the reconnect backoff schedule,
//! the bounded event log, and the activity reducer.

pub mod activity;
pub mod backoff;
pub mod envelope;
pub mod event;
pub mod event_log;
pub mod reducer;

pub use activity::{AgentActivity, AgentStatus, TokenUsage, ToolCall};
pub use backoff::BackoffPolicy;
pub use envelope::{
    classify_frame, is_valid_message, Envelope, EnvelopeValidator, FrameValidator, Inbound,
    LoggedFrame, Priority, ValidationError,
};
pub use event::{AgentEvent, EventError, EventKind, EventPayload};
pub use event_log::BoundedLog;
pub use reducer::ActivityStore;
