use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Terminal: automatic reconnection has given up.
    #[error("max reconnect attempts reached ({attempts})")]
    MaxAttemptsReached { attempts: u32 },
}

impl ConnectionError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionError::MaxAttemptsReached { .. })
    }
}
