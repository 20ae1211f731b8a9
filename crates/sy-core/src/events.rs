use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kinds of engine events. Serialized in kebab-case (`task-assigned`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    AgentRegistered,
    AgentUnregistered,
    AgentStatusChanged,
    TaskCreated,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    MessageSent,
    MessageReceived,
    SystemError,
    MetricsUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentRegistered => "agent-registered",
            EventType::AgentUnregistered => "agent-unregistered",
            EventType::AgentStatusChanged => "agent-status-changed",
            EventType::TaskCreated => "task-created",
            EventType::TaskAssigned => "task-assigned",
            EventType::TaskCompleted => "task-completed",
            EventType::TaskFailed => "task-failed",
            EventType::WorkflowStarted => "workflow-started",
            EventType::WorkflowCompleted => "workflow-completed",
            EventType::WorkflowFailed => "workflow-failed",
            EventType::MessageSent => "message-sent",
            EventType::MessageReceived => "message-received",
            EventType::SystemError => "system-error",
            EventType::MetricsUpdated => "metrics-updated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published on the event bus: `{id, type, timestamp, source, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Component that raised the event, e.g. `scheduler`.
    pub source: String,
    pub data: Value,
}

impl EngineEvent {
    pub fn new(event_type: EventType, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            source: source.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let ev = EngineEvent::new(EventType::AgentStatusChanged, "registry", json!({"agentId": "w1"}));
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "agent-status-changed");
        assert_eq!(value["source"], "registry");
        assert_eq!(value["data"]["agentId"], "w1");
        assert_eq!(EventType::MetricsUpdated.to_string(), "metrics-updated");
    }
}
