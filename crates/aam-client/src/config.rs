use aam_core::backoff::BackoffPolicy;
use aam_core::envelope::{Envelope, EnvelopeValidator, DEFAULT_ACCEPTED_TYPES};
use aam_core::event::{AgentEnded, AgentStarted, EventPayload, ModelSwitched, ToolCalled};
use aam_core::event_log::DEFAULT_MAX_EVENTS;
use aam_core::AgentEvent;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:18789";
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MOCK_INTERVAL: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub url: String,
    pub backoff: BackoffPolicy,
    pub max_events: usize,
    pub auto_reconnect: bool,
    pub accepted_types: Vec<String>,
    /// Pause between tearing down and reopening on a manual `reconnect()`.
    pub restart_delay: Duration,
    /// When set, no network socket is opened; frames are replayed instead.
    pub mock: Option<MockConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            backoff: BackoffPolicy::default(),
            max_events: DEFAULT_MAX_EVENTS,
            auto_reconnect: true,
            accepted_types: DEFAULT_ACCEPTED_TYPES
                .iter()
                .map(|kind| kind.to_string())
                .collect(),
            restart_delay: DEFAULT_RESTART_DELAY,
            mock: None,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn validator(&self) -> EnvelopeValidator {
        EnvelopeValidator::new(self.accepted_types.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockConfig {
    /// Raw text frames, delivered exactly as a socket would.
    pub frames: Vec<String>,
    pub interval: Duration,
    pub repeat: bool,
}

impl MockConfig {
    pub fn from_events(events: &[AgentEvent], interval: Duration) -> Self {
        Self {
            frames: events
                .iter()
                .map(|event| Envelope::agent_event(event).to_text())
                .collect(),
            interval,
            repeat: false,
        }
    }

    /// One agent's full lifecycle: start, a tool call, a model switch, end.
    pub fn demo() -> Self {
        let base = chrono::Utc::now().timestamp_millis();
        let events = [
            AgentEvent::new(
                "a1",
                base,
                EventPayload::AgentStarted(AgentStarted {
                    model: Some("gpt-4".to_string()),
                    metadata: None,
                }),
            ),
            AgentEvent::new(
                "a1",
                base + 1_000,
                EventPayload::ToolCalled(ToolCalled {
                    tool_name: Some("read".to_string()),
                    duration: None,
                    tool_input: None,
                }),
            ),
            AgentEvent::new(
                "a1",
                base + 2_000,
                EventPayload::ModelSwitched(ModelSwitched {
                    new_model: "gpt-4-turbo".to_string(),
                    previous_model: Some("gpt-4".to_string()),
                }),
            ),
            AgentEvent::new(
                "a1",
                base + 3_000,
                EventPayload::AgentEnded(AgentEnded {
                    reason: Some("completed".to_string()),
                    final_token_count: None,
                }),
            ),
        ];
        Self::from_events(&events, DEFAULT_MOCK_INTERVAL)
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Flag value if non-empty, else the environment variable, else `default`.
pub fn resolve_string(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

pub fn resolve_parsed<T: FromStr>(flag: Option<T>, key: &str, default: T) -> T {
    if let Some(value) = flag {
        return value;
    }
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn resolve_optional<T: FromStr>(flag: Option<T>, key: &str) -> Option<T> {
    flag.or_else(|| {
        std::env::var(key)
            .ok()
            .and_then(|value| value.trim().parse::<T>().ok())
    })
}

pub fn resolve_bool(flag: Option<bool>, key: &str, default: bool) -> bool {
    if let Some(value) = flag {
        return value;
    }
    std::env::var(key)
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(default)
}
