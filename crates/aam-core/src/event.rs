use crate::activity::AgentStatus;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentStarted,
    AgentEnded,
    ToolCalled,
    ModelSwitched,
    TokenUpdate,
    Heartbeat,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::AgentStarted,
        EventKind::AgentEnded,
        EventKind::ToolCalled,
        EventKind::ModelSwitched,
        EventKind::TokenUpdate,
        EventKind::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentStarted => "agent_started",
            EventKind::AgentEnded => "agent_ended",
            EventKind::ToolCalled => "tool_called",
            EventKind::ModelSwitched => "model_switched",
            EventKind::TokenUpdate => "token_update",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input)
            .ok_or_else(|| format!("Unknown event kind: {input}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event is not an object")]
    NotAnObject,
    #[error("event type is missing or not a string")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownKind(String),
    #[error("agentId is missing or empty")]
    MissingAgentId,
    #[error("timestamp is missing or not a number")]
    MissingTimestamp,
    #[error("invalid {kind} data: {reason}")]
    InvalidData { kind: EventKind, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStarted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentEnded {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_token_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCalled {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSwitched {
    pub new_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_model: Option<String>,
}

/// Cumulative counters. `delta` is carried for display only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUpdate {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatData {
    pub status: AgentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    AgentStarted(AgentStarted),
    AgentEnded(AgentEnded),
    ToolCalled(ToolCalled),
    ModelSwitched(ModelSwitched),
    TokenUpdate(TokenUpdate),
    Heartbeat(HeartbeatData),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AgentStarted(_) => EventKind::AgentStarted,
            EventPayload::AgentEnded(_) => EventKind::AgentEnded,
            EventPayload::ToolCalled(_) => EventKind::ToolCalled,
            EventPayload::ModelSwitched(_) => EventKind::ModelSwitched,
            EventPayload::TokenUpdate(_) => EventKind::TokenUpdate,
            EventPayload::Heartbeat(_) => EventKind::Heartbeat,
        }
    }

    fn decode(kind: EventKind, data: Value) -> Result<Self, EventError> {
        if !data.is_object() {
            return Err(EventError::InvalidData {
                kind,
                reason: "data must be an object".to_string(),
            });
        }
        let payload = match kind {
            EventKind::AgentStarted => EventPayload::AgentStarted(decode_data(kind, data)?),
            EventKind::AgentEnded => EventPayload::AgentEnded(decode_data(kind, data)?),
            EventKind::ToolCalled => EventPayload::ToolCalled(decode_data(kind, data)?),
            EventKind::ModelSwitched => EventPayload::ModelSwitched(decode_data(kind, data)?),
            EventKind::TokenUpdate => EventPayload::TokenUpdate(decode_data(kind, data)?),
            EventKind::Heartbeat => EventPayload::Heartbeat(decode_data(kind, data)?),
        };
        Ok(payload)
    }
}

fn decode_data<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, EventError> {
    serde_json::from_value(data).map_err(|err| EventError::InvalidData {
        kind,
        reason: err.to_string(),
    })
}

/// One lifecycle occurrence for an agent, as carried in an `agent_event`
/// envelope: `{ "type", "agentId", "timestamp", "data"? }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentEvent {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    pub fn new(agent_id: impl Into<String>, timestamp: i64, payload: EventPayload) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Decodes and checks a raw event. The tag is checked before the
    /// kind-specific data so that unknown kinds are reported as such.
    pub fn from_value(value: &Value) -> Result<Self, EventError> {
        let object = value.as_object().ok_or(EventError::NotAnObject)?;
        let kind = match object.get("type") {
            Some(Value::String(raw)) => raw
                .parse::<EventKind>()
                .map_err(|_| EventError::UnknownKind(raw.clone()))?,
            _ => return Err(EventError::MissingType),
        };
        let agent_id = match object.get("agentId") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(EventError::MissingAgentId),
        };
        let timestamp = object
            .get("timestamp")
            .and_then(timestamp_ms)
            .ok_or(EventError::MissingTimestamp)?;
        let data = match object.get("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(other) => other.clone(),
        };
        let payload = EventPayload::decode(kind, data)?;
        Ok(Self {
            agent_id,
            timestamp,
            payload,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl<'de> Deserialize<'de> for AgentEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        AgentEvent::from_value(&value).map_err(de::Error::custom)
    }
}

fn timestamp_ms(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|millis| millis.is_finite())
            .map(|millis| millis as i64)
    })
}
