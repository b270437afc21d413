use std::time::Duration;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_DECAY: f64 = 2.0;

/// Reconnect delay schedule: `min(initial * decay^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub decay: f64,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            decay: DEFAULT_DECAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_ms = self.max_delay.as_millis() as f64;
        let scaled = self.initial_delay.as_millis() as f64 * self.decay.powi(exponent);
        if !scaled.is_finite() || scaled >= max_ms {
            return self.max_delay;
        }
        if scaled <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(scaled.round() as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts
            .map(|max| attempts >= max)
            .unwrap_or(false)
    }
}
