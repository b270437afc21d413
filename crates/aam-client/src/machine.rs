use crate::config::ClientConfig;
use crate::error::ConnectionError;
use aam_core::backoff::BackoffPolicy;
use aam_core::envelope::{
    classify_frame, Envelope, FrameValidator, Inbound, LoggedFrame, Priority,
};
use aam_core::event_log::BoundedLog;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identifies one physical socket. Callbacks carrying an id other than the
/// current one belong to a socket that was already replaced and are ignored.
pub type SocketId = u64;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<ConnectionError>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Automatic reconnect after an unexpected close.
    Reconnect,
    /// Second half of a manual `reconnect()`.
    Restart,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Open { socket: SocketId },
    Close { socket: SocketId },
    Transmit { socket: SocketId, text: String },
    ScheduleTimer { kind: TimerKind, delay: Duration },
    CancelTimer,
    Deliver(LoggedFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Json(Value),
}

impl OutboundMessage {
    fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            OutboundMessage::Text(text) => Ok(text),
            OutboundMessage::Json(value) => serde_json::to_string(&value),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        OutboundMessage::Text(text)
    }
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        OutboundMessage::Text(text.to_string())
    }
}

impl From<Value> for OutboundMessage {
    fn from(value: Value) -> Self {
        OutboundMessage::Json(value)
    }
}

impl From<&Envelope> for OutboundMessage {
    fn from(envelope: &Envelope) -> Self {
        OutboundMessage::Text(envelope.to_text())
    }
}

/// Connection policy with no I/O of its own.
///
/// Inputs are caller operations and socket callbacks; outputs are
/// [`Action`]s for a driver to carry out. Each input is handled to
/// completion before the next, which is the only ordering the log and the
/// reconnect bookkeeping rely on.
pub struct ConnectionMachine {
    backoff: BackoffPolicy,
    auto_reconnect: bool,
    restart_delay: Duration,
    validator: Box<dyn FrameValidator>,
    state: ConnectionState,
    socket: Option<SocketId>,
    next_socket: SocketId,
    manual_close: bool,
    attempts: u32,
    timer: Option<TimerKind>,
    last_error: Option<ConnectionError>,
    log: BoundedLog<LoggedFrame>,
    next_seq: u64,
}

impl ConnectionMachine {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_validator(config, Box::new(config.validator()))
    }

    pub fn with_validator(config: &ClientConfig, validator: Box<dyn FrameValidator>) -> Self {
        Self {
            backoff: config.backoff,
            auto_reconnect: config.auto_reconnect,
            restart_delay: config.restart_delay,
            validator,
            state: ConnectionState::Disconnected,
            socket: None,
            next_socket: 0,
            manual_close: false,
            attempts: 0,
            timer: None,
            last_error: None,
            log: BoundedLog::new(config.max_events),
            next_seq: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            attempts: self.attempts,
        }
    }

    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.socket
    }

    pub fn pending_timer(&self) -> Option<TimerKind> {
        self.timer
    }

    pub fn events(&self) -> Vec<LoggedFrame> {
        self.log.to_vec()
    }

    pub fn clear_events(&mut self) {
        self.log.clear();
    }

    /// Opens a socket unless one is already open or opening.
    pub fn connect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.socket.is_some()
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            debug!(event = "connect_skipped", state = %self.state);
            return actions;
        }
        if let Some(stale) = self.socket.take() {
            actions.push(Action::Close { socket: stale });
        }
        self.manual_close = false;
        self.attempts = 0;
        self.cancel_timer(&mut actions);
        self.last_error = None;
        self.open_socket(&mut actions);
        actions
    }

    /// Closes the socket and stops any further automatic reconnects.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.manual_close = true;
        self.cancel_timer(&mut actions);
        if let Some(socket) = self.socket.take() {
            actions.push(Action::Close { socket });
        }
        self.attempts = 0;
        self.set_state(ConnectionState::Disconnected);
        actions
    }

    /// Drops `message` unless connected; there is no outbound queue.
    pub fn send(&mut self, message: OutboundMessage) -> Vec<Action> {
        let socket = match (self.state, self.socket) {
            (ConnectionState::Connected, Some(socket)) => socket,
            _ => {
                warn!(event = "send_dropped", state = %self.state);
                return Vec::new();
            }
        };
        match message.into_text() {
            Ok(text) => vec![Action::Transmit { socket, text }],
            Err(err) => {
                warn!(event = "send_encode_error", error = %err);
                Vec::new()
            }
        }
    }

    /// Tears everything down, empties the log, and connects again after
    /// the restart delay.
    pub fn reconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.manual_close = true;
        self.cancel_timer(&mut actions);
        if let Some(socket) = self.socket.take() {
            actions.push(Action::Close { socket });
        }
        self.log.clear();
        self.attempts = 0;
        self.set_state(ConnectionState::Disconnected);
        info!(event = "manual_reconnect", delay_ms = self.restart_delay.as_millis() as u64);
        self.timer = Some(TimerKind::Restart);
        actions.push(Action::ScheduleTimer {
            kind: TimerKind::Restart,
            delay: self.restart_delay,
        });
        actions
    }

    pub fn on_timer(&mut self, kind: TimerKind) -> Vec<Action> {
        if self.timer != Some(kind) {
            debug!(event = "timer_stale", kind = ?kind);
            return Vec::new();
        }
        self.timer = None;
        match kind {
            TimerKind::Restart => self.connect(),
            TimerKind::Reconnect => {
                let mut actions = Vec::new();
                if self.manual_close || self.socket.is_some() {
                    return actions;
                }
                info!(event = "reconnect_attempt", attempt = self.attempts);
                self.open_socket(&mut actions);
                actions
            }
        }
    }

    pub fn on_open(&mut self, socket: SocketId) -> Vec<Action> {
        if !self.is_current(socket, "open") {
            return Vec::new();
        }
        self.attempts = 0;
        self.last_error = None;
        self.set_state(ConnectionState::Connected);
        Vec::new()
    }

    /// Records the error. Reconnection waits for the close that follows.
    pub fn on_error(&mut self, socket: SocketId, error: ConnectionError) -> Vec<Action> {
        if !self.is_current(socket, "error") {
            return Vec::new();
        }
        warn!(event = "socket_error", socket, error = %error);
        self.last_error = Some(error);
        self.set_state(ConnectionState::Error);
        Vec::new()
    }

    pub fn on_close(&mut self, socket: SocketId, reason: Option<&str>) -> Vec<Action> {
        if !self.is_current(socket, "close") {
            return Vec::new();
        }
        self.socket = None;
        info!(
            event = "socket_closed",
            socket,
            reason = reason.unwrap_or(""),
            manual = self.manual_close
        );
        self.set_state(ConnectionState::Disconnected);

        let mut actions = Vec::new();
        if self.manual_close || !self.auto_reconnect {
            return actions;
        }
        if self.backoff.exhausted(self.attempts) {
            warn!(event = "reconnect_exhausted", attempts = self.attempts);
            self.last_error = Some(ConnectionError::MaxAttemptsReached {
                attempts: self.attempts,
            });
            return actions;
        }
        let delay = self.backoff.delay(self.attempts);
        self.attempts += 1;
        info!(
            event = "reconnect_scheduled",
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64
        );
        self.timer = Some(TimerKind::Reconnect);
        actions.push(Action::ScheduleTimer {
            kind: TimerKind::Reconnect,
            delay,
        });
        actions
    }

    pub fn on_message(&mut self, socket: SocketId, text: &str) -> Vec<Action> {
        if !self.is_current(socket, "message") {
            return Vec::new();
        }
        let (envelope, priority) = match classify_frame(text, self.validator.as_ref()) {
            Inbound::Accepted(envelope) => (envelope, Priority::Normal),
            Inbound::Undecodable(raw) => {
                debug!(event = "message_not_json", size = raw.len());
                (Envelope::raw(&raw), Priority::Low)
            }
            Inbound::Rejected(err) => {
                warn!(event = "message_invalid", error = %err);
                return Vec::new();
            }
        };
        self.next_seq += 1;
        let frame = LoggedFrame {
            seq: self.next_seq,
            received_at_ms: Utc::now().timestamp_millis(),
            priority,
            envelope,
        };
        let evicted = self.log.push(frame.clone());
        if evicted > 0 {
            debug!(event = "event_log_trimmed", evicted, max = self.log.max_entries());
        }
        vec![Action::Deliver(frame)]
    }

    fn open_socket(&mut self, actions: &mut Vec<Action>) {
        self.next_socket += 1;
        let socket = self.next_socket;
        self.socket = Some(socket);
        self.set_state(ConnectionState::Connecting);
        actions.push(Action::Open { socket });
    }

    fn cancel_timer(&mut self, actions: &mut Vec<Action>) {
        if self.timer.take().is_some() {
            actions.push(Action::CancelTimer);
        }
    }

    fn is_current(&self, socket: SocketId, callback: &'static str) -> bool {
        if self.socket == Some(socket) {
            return true;
        }
        debug!(event = "callback_stale", callback, socket, current = ?self.socket);
        false
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!(event = "state_transition", from = %self.state, to = %next);
        self.state = next;
    }
}
