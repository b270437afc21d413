use crate::activity::{AgentActivity, AgentStatus, TokenUsage, ToolCall};
use crate::event::{AgentEvent, EventPayload};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-agent state table produced by folding [`AgentEvent`]s.
///
/// Folding returns a new store. Entries are shared between stores through
/// `Arc`, and a changed entry is always a fresh allocation, so an
/// `AgentActivity` obtained from an older store never changes underneath
/// its holder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityStore {
    agents: HashMap<String, Arc<AgentActivity>>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> Option<&Arc<AgentActivity>> {
        self.agents.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentActivity>> {
        self.agents.values()
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<Arc<AgentActivity>> {
        self.agents.remove(agent_id)
    }

    pub fn clear(&mut self) {
        self.agents.clear();
    }

    pub fn fold(&self, event: &AgentEvent) -> ActivityStore {
        let mut next = self.clone();
        next.apply(event);
        next
    }

    /// Same result as calling [`fold`](Self::fold) once per event, in order.
    pub fn fold_batch<'a, I>(&self, events: I) -> ActivityStore
    where
        I: IntoIterator<Item = &'a AgentEvent>,
    {
        let mut next = self.clone();
        for event in events {
            next.apply(event);
        }
        next
    }

    /// Validates and folds an undecoded event. Malformed input is logged
    /// and leaves the store as it was.
    pub fn fold_value(&self, raw: &Value) -> ActivityStore {
        match AgentEvent::from_value(raw) {
            Ok(event) => self.fold(&event),
            Err(err) => {
                warn!(event = "activity_event_invalid", error = %err);
                self.clone()
            }
        }
    }

    /// Agents whose status is `active` or `idle`.
    pub fn active_count(&self) -> usize {
        self.agents
            .values()
            .filter(|activity| activity.status.is_live())
            .count()
    }

    pub fn total_token_usage(&self) -> TokenUsage {
        self.agents
            .values()
            .fold(TokenUsage::default(), |sum, activity| {
                sum + activity.token_usage
            })
    }

    /// Live agents first, then most recent activity, then id.
    pub fn sorted(&self) -> Vec<Arc<AgentActivity>> {
        let mut rows: Vec<_> = self.agents.values().cloned().collect();
        rows.sort_by(|a, b| {
            b.status
                .is_live()
                .cmp(&a.status.is_live())
                .then_with(|| b.last_activity.cmp(&a.last_activity))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        rows
    }

    fn apply(&mut self, event: &AgentEvent) {
        if event.agent_id.is_empty() {
            warn!(event = "activity_event_invalid", error = "agentId is empty");
            return;
        }
        let mut activity = match self.agents.get(&event.agent_id) {
            Some(existing) => AgentActivity::clone(existing),
            None => {
                debug!(
                    event = "activity_agent_created",
                    agent_id = %event.agent_id,
                    kind = %event.kind()
                );
                AgentActivity::placeholder(&event.agent_id, event.timestamp)
            }
        };
        apply_event(&mut activity, event);
        self.agents
            .insert(event.agent_id.clone(), Arc::new(activity));
    }
}

fn apply_event(activity: &mut AgentActivity, event: &AgentEvent) {
    match &event.payload {
        EventPayload::AgentStarted(data) => {
            activity.status = AgentStatus::Active;
            if let Some(model) = &data.model {
                activity.current_model = Some(model.clone());
            }
            if let Some(metadata) = &data.metadata {
                merge_metadata(activity.metadata.get_or_insert_with(Map::new), metadata);
            }
        }
        EventPayload::AgentEnded(data) => {
            activity.status = if data.reason.as_deref() == Some("error") {
                AgentStatus::Error
            } else {
                AgentStatus::Ended
            };
            activity.ended_at = Some(event.timestamp);
            // Only the total is overwritten; the prompt/completion split
            // keeps its last reported values.
            if let Some(total) = data.final_token_count {
                activity.token_usage.total_tokens = total;
            }
        }
        EventPayload::ToolCalled(data) => {
            activity.tools_used.push(ToolCall {
                tool_name: data.tool_name.clone(),
                timestamp: event.timestamp,
                duration: data.duration,
                input: data.tool_input.clone(),
            });
        }
        EventPayload::ModelSwitched(data) => {
            activity.current_model = Some(data.new_model.clone());
        }
        EventPayload::TokenUpdate(data) => {
            activity.token_usage = TokenUsage {
                prompt_tokens: data.prompt_tokens,
                completion_tokens: data.completion_tokens,
                total_tokens: data.total_tokens,
            };
        }
        EventPayload::Heartbeat(data) => {
            activity.status = data.status;
        }
    }
    activity.last_activity = event.timestamp;
}

fn merge_metadata(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        target.insert(key.clone(), value.clone());
    }
}
