use crate::manager::ConnectionManager;
use aam_core::envelope::{self, LoggedFrame};
use aam_core::event_log::{BoundedLog, DEFAULT_FEED_WINDOW};
use aam_core::{ActivityStore, AgentEvent};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What presentation code reads: the folded store plus the recent feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivitySnapshot {
    pub store: ActivityStore,
    /// Most recent events, oldest first.
    pub feed: Vec<AgentEvent>,
}

/// Single fold pipeline from delivered envelopes to an [`ActivityStore`].
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    store: ActivityStore,
    feed: BoundedLog<AgentEvent>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_WINDOW)
    }
}

impl ActivityTracker {
    pub fn new(feed_window: usize) -> Self {
        Self {
            store: ActivityStore::new(),
            feed: BoundedLog::new(feed_window),
        }
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    pub fn feed(&self) -> &BoundedLog<AgentEvent> {
        &self.feed
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            store: self.store.clone(),
            feed: self.feed.to_vec(),
        }
    }

    pub fn clear(&mut self) {
        self.store.clear();
        self.feed.clear();
    }

    /// Folds whatever agent events `frame` carries. Returns true when the
    /// store or the feed changed.
    pub fn apply_frame(&mut self, frame: &LoggedFrame) -> bool {
        let envelope = &frame.envelope;
        match envelope.kind.as_str() {
            envelope::AGENT_EVENT => self.apply_events(std::slice::from_ref(&envelope.payload)),
            envelope::AGENT_ACTIVITY => match batch_items(&envelope.payload) {
                Some(items) => self.apply_events(items),
                None => {
                    debug!(event = "activity_batch_unrecognized", seq = frame.seq);
                    false
                }
            },
            envelope::ERROR => {
                warn!(event = "upstream_error", payload = %envelope.payload);
                false
            }
            _ => false,
        }
    }

    fn apply_events(&mut self, raw: &[Value]) -> bool {
        let mut decoded = Vec::with_capacity(raw.len());
        for value in raw {
            match AgentEvent::from_value(value) {
                Ok(event) => decoded.push(event),
                Err(err) => warn!(event = "activity_event_invalid", error = %err),
            }
        }
        if decoded.is_empty() {
            return false;
        }
        self.store = self.store.fold_batch(decoded.iter());
        self.feed.extend(decoded);
        true
    }

    /// Folds every frame `manager` delivers from now on and publishes a
    /// snapshot after each change. The task ends when the manager is
    /// dropped or the returned handle is aborted.
    pub fn spawn(
        manager: &ConnectionManager,
        feed_window: usize,
    ) -> (watch::Receiver<ActivitySnapshot>, JoinHandle<()>) {
        let mut frames = manager.subscribe();
        let (tx, rx) = watch::channel(ActivitySnapshot::default());
        let mut tracker = ActivityTracker::new(feed_window);
        let task = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        if tracker.apply_frame(&frame) && tx.send(tracker.snapshot()).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "activity_frames_lagged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!(event = "activity_tracker_stopped");
        });
        (rx, task)
    }
}

/// `agent_activity` carries either a bare array of events or
/// `{ "events": [...] }`.
fn batch_items(payload: &Value) -> Option<&[Value]> {
    match payload {
        Value::Array(items) => Some(items.as_slice()),
        Value::Object(map) => map
            .get("events")
            .and_then(Value::as_array)
            .map(Vec::as_slice),
        _ => None,
    }
}
