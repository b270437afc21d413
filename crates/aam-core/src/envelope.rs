use crate::event::AgentEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

pub const AGENT_EVENT: &str = "agent_event";
pub const AGENT_ACTIVITY: &str = "agent_activity";
pub const HEARTBEAT: &str = "heartbeat";
pub const ERROR: &str = "error";
/// Tag given to frames that were not JSON and were kept as plain text.
pub const RAW: &str = "raw";

pub const DEFAULT_ACCEPTED_TYPES: [&str; 4] = [AGENT_EVENT, AGENT_ACTIVITY, HEARTBEAT, ERROR];

/// Transport wrapper `{ "type", "payload" }`. The tag here is the coarse
/// transport tag, not `AgentEvent::kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn agent_event(event: &AgentEvent) -> Self {
        Self::new(AGENT_EVENT, event.to_value())
    }

    pub fn raw(text: &str) -> Self {
        Self::new(RAW, serde_json::json!({ "message": text }))
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(ERROR, serde_json::json!({ "code": code, "message": message }))
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is not a structured value")]
    NotStructured,
    #[error("message type is missing or not a string")]
    MissingType,
    #[error("message type '{0}' is not accepted")]
    UnacceptedType(String),
    #[error("message payload is missing or not structured")]
    MissingPayload,
}

/// Shape check applied to every decoded frame before it is stored.
pub trait FrameValidator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<(), ValidationError>;

    fn check(&self, value: Value) -> Result<Envelope, ValidationError> {
        self.validate(&value)?;
        let Value::Object(mut object) = value else {
            return Err(ValidationError::NotStructured);
        };
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ValidationError::MissingType),
        };
        let payload = object
            .remove("payload")
            .ok_or(ValidationError::MissingPayload)?;
        Ok(Envelope { kind, payload })
    }
}

/// Accepts `{type, payload}` messages whose tag is in a configured set.
///
/// `payload` only has to be an object or an array. Arrays pass on purpose:
/// existing producers send list payloads and consumers rely on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeValidator {
    accepted: BTreeSet<String>,
}

impl Default for EnvelopeValidator {
    fn default() -> Self {
        Self::new(DEFAULT_ACCEPTED_TYPES)
    }
}

impl EnvelopeValidator {
    pub fn new<I, S>(accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted: accepted.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, kind: &str) -> bool {
        self.accepted.contains(kind)
    }
}

impl FrameValidator for EnvelopeValidator {
    fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        if !is_structured(value) {
            return Err(ValidationError::NotStructured);
        }
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ValidationError::MissingType),
        };
        if !self.accepts(kind) {
            return Err(ValidationError::UnacceptedType(kind.clone()));
        }
        match value.get("payload") {
            Some(payload) if is_structured(payload) => Ok(()),
            _ => Err(ValidationError::MissingPayload),
        }
    }
}

fn is_structured(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

/// Standalone gate with the default accepted tags.
pub fn is_valid_message(value: &Value) -> bool {
    EnvelopeValidator::default().validate(value).is_ok()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
}

/// One entry of the connection event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggedFrame {
    pub seq: u64,
    pub received_at_ms: i64,
    pub priority: Priority,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Accepted(Envelope),
    /// Not JSON; kept as a low-priority raw entry.
    Undecodable(String),
    Rejected(ValidationError),
}

/// Decodes one text frame and runs it through `validator`.
pub fn classify_frame(text: &str, validator: &dyn FrameValidator) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Inbound::Undecodable(text.to_string()),
    };
    match validator.check(value) {
        Ok(envelope) => Inbound::Accepted(envelope),
        Err(err) => Inbound::Rejected(err),
    }
}
