use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{Task, TaskConstraints};

// ---------------------------------------------------------------------------
// Envelope enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    ErrorReport,
    Heartbeat,
    HumanApprovalRequest,
    HumanApprovalResponse,
    Coordination,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::StatusUpdate => "status_update",
            MessageType::ErrorReport => "error_report",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HumanApprovalRequest => "human_approval_request",
            MessageType::HumanApprovalResponse => "human_approval_response",
            MessageType::Coordination => "coordination",
        }
    }
}

/// Delivery priority. Declared most-urgent first so the derived ordering sorts
/// `Urgent` ahead of `Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl From<crate::types::Priority> for MessagePriority {
    fn from(p: crate::types::Priority) -> Self {
        use crate::types::Priority;
        match p {
            Priority::Critical => MessagePriority::Urgent,
            Priority::High => MessagePriority::High,
            Priority::Medium => MessagePriority::Normal,
            Priority::Low => MessagePriority::Low,
        }
    }
}

/// Sender or recipient of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Worker(String),
    System,
    Broadcast,
    Human,
}

impl Endpoint {
    pub fn worker(id: impl Into<String>) -> Self {
        Endpoint::Worker(id.into())
    }

    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Endpoint::Worker(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Worker(id) => write!(f, "worker:{id}"),
            Endpoint::System => f.write_str("system"),
            Endpoint::Broadcast => f.write_str("broadcast"),
            Endpoint::Human => f.write_str("human"),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub sender: Endpoint,
    pub recipient: Endpoint,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(message_type: MessageType, sender: Endpoint, recipient: Endpoint, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            priority: MessagePriority::Normal,
            sender,
            recipient,
            payload,
            timestamp: Utc::now(),
            expires_at: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn correlated_with(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Task request / response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
}

/// Body of a `TaskRequest` sent from the scheduler to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequestPayload {
    pub task_id: Uuid,
    pub task_type: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub constraints: TaskConstraints,
    pub context: RequestContext,
}

impl From<&Task> for TaskRequestPayload {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            description: task.description.clone(),
            requirements: task.required_capabilities.clone(),
            constraints: task.constraints.clone(),
            context: RequestContext {
                workflow_id: task.context.workflow_id.clone(),
                parent_task_id: task.context.parent_task_id,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
    Completed,
    Failed,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetrics {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// Body of a `TaskResponse` sent from a worker back to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponsePayload {
    pub task_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub metrics: ResponseMetrics,
}

impl TaskResponsePayload {
    pub fn completed(task_id: Uuid, result: Value) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Completed,
            result: Some(result),
            error: None,
            metrics: ResponseMetrics {
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                duration: None,
            },
        }
    }

    pub fn failed(task_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_id,
            status: ResponseStatus::Failed,
            result: None,
            error: Some(ResponseError {
                code: code.into(),
                message: message.into(),
            }),
            metrics: ResponseMetrics {
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                duration: None,
            },
        }
    }

    pub fn with_status(task_id: Uuid, status: ResponseStatus) -> Self {
        Self {
            task_id,
            status,
            result: None,
            error: None,
            metrics: ResponseMetrics {
                start_time: Utc::now(),
                end_time: None,
                duration: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Human approval payloads
// ---------------------------------------------------------------------------

/// What a human is asked to approve: either a task or a workflow gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ApprovalTarget {
    Task {
        #[serde(rename = "taskId")]
        task_id: Uuid,
    },
    Workflow {
        #[serde(rename = "executionId")]
        execution_id: Uuid,
        #[serde(rename = "nodeId")]
        node_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequestPayload {
    #[serde(flatten)]
    pub target: ApprovalTarget,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponsePayload {
    #[serde(flatten)]
    pub target: ApprovalTarget,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskSpec;
    use serde_json::json;

    #[test]
    fn urgent_sorts_first() {
        let mut v = vec![
            MessagePriority::Low,
            MessagePriority::Urgent,
            MessagePriority::Normal,
            MessagePriority::High,
        ];
        v.sort();
        assert_eq!(v[0], MessagePriority::Urgent);
        assert_eq!(v[3], MessagePriority::Low);
    }

    #[test]
    fn request_payload_uses_camel_case() {
        let mut spec = TaskSpec::new("security_scan").requires(["sast"]);
        spec.context.workflow_id = Some("audit".into());
        let task = Task::from_spec(spec, 3);
        let value = serde_json::to_value(TaskRequestPayload::from(&task)).unwrap();
        assert_eq!(value["taskType"], "security_scan");
        assert_eq!(value["requirements"][0], "sast");
        assert_eq!(value["context"]["workflowId"], "audit");
        assert!(value["context"].get("parentTaskId").is_none());
    }

    #[test]
    fn response_payload_parses_worker_json() {
        let id = Uuid::new_v4();
        let raw = json!({
            "taskId": id,
            "status": "failed",
            "error": {"code": "E_TIMEOUT", "message": "scanner hung"},
            "metrics": {"startTime": "2026-01-01T00:00:00Z", "duration": 1200}
        });
        let parsed: TaskResponsePayload = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.status, ResponseStatus::Failed);
        assert_eq!(parsed.error.unwrap().code, "E_TIMEOUT");
        assert_eq!(parsed.metrics.duration, Some(1200));
    }

    #[test]
    fn approval_payload_is_flat() {
        let exec = Uuid::new_v4();
        let payload = ApprovalResponsePayload {
            target: ApprovalTarget::Workflow {
                execution_id: exec,
                node_id: "review".into(),
            },
            approved: true,
            approver: Some("ops".into()),
            comment: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["target"], "workflow");
        assert_eq!(value["nodeId"], "review");
        let back: ApprovalResponsePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let msg = Message::new(MessageType::Heartbeat, Endpoint::System, Endpoint::Broadcast, Value::Null)
            .expires_at(now);
        assert!(msg.is_expired(now));
        assert!(!msg.is_expired(now - chrono::Duration::seconds(1)));
    }
}
