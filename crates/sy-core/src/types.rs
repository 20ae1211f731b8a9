use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Workers are addressed by a caller-chosen string id.
pub type WorkerId = String;

// ---------------------------------------------------------------------------
// WorkerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Idle,
    Busy,
    Error,
    Offline,
    Terminated,
}

impl WorkerStatus {
    /// Offline and errored workers never receive new work.
    pub fn accepts_work(&self) -> bool {
        !matches!(self, WorkerStatus::Offline | WorkerStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Initializing => "initializing",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority class shared by workers and tasks. Ordered `Low < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Multiplier applied to a worker's match score.
    pub fn score_multiplier(&self) -> f64 {
        match self {
            Priority::Critical => 1.5,
            Priority::High => 1.2,
            Priority::Medium | Priority::Low => 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Fraction of finished tasks that completed successfully, in `[0, 1]`.
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            average_response_time_ms: 0.0,
            max_concurrent_tasks: 1,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }
}

/// An external process that performs task work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    /// Free-form worker family, e.g. `code_generator` or `security_auditor`.
    pub kind: String,
    pub capabilities: BTreeSet<String>,
    pub specializations: BTreeSet<String>,
    pub status: WorkerStatus,
    pub priority: Priority,
    pub metrics: WorkerMetrics,
    /// Number of tasks currently held by this worker.
    pub current_load: u32,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Set while a liveness probe is outstanding.
    pub probe_sent_at: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            kind: String::new(),
            capabilities: BTreeSet::new(),
            specializations: BTreeSet::new(),
            status: WorkerStatus::Idle,
            priority: Priority::Medium,
            metrics: WorkerMetrics::default(),
            current_load: 0,
            registered_at: now,
            last_activity: now,
            last_heartbeat: None,
            probe_sent_at: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(caps.into_iter().map(Into::into));
        self
    }

    pub fn with_specializations<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specializations.extend(specs.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.metrics.max_concurrent_tasks = max;
        self
    }

    pub fn with_performance(mut self, success_rate: f64, average_response_time_ms: f64) -> Self {
        self.metrics.success_rate = success_rate.clamp(0.0, 1.0);
        self.metrics.average_response_time_ms = average_response_time_ms.max(0.0);
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// `1 - load / max`, clamped to `[0, 1]`. A worker with no slots has
    /// zero availability.
    pub fn availability(&self) -> f64 {
        let max = self.metrics.max_concurrent_tasks;
        if max == 0 {
            return 0.0;
        }
        (1.0 - f64::from(self.current_load) / f64::from(max)).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    AwaitingApproval,
    Approved,
    Rejected,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// Completed, failed, cancelled and rejected tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Rejected
        )
    }

    /// Statuses that hold a worker slot.
    pub fn holds_worker(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// Statuses from which a task may sit in the assignment queue.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Retrying | TaskStatus::Approved
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<f64>,
}

/// Where a task came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
}

/// Caller-supplied description of a task to create. Also used as the task
/// template embedded in workflow nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub required_capabilities: Vec<String>,
    pub optional_capabilities: Vec<String>,
    pub dependencies: Vec<Uuid>,
    /// Falls back to the scheduler default when absent.
    pub max_retries: Option<u32>,
    pub input: Value,
    pub constraints: TaskConstraints,
    pub context: TaskContext,
    pub timeout_ms: Option<u64>,
    pub requires_approval: bool,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        Self {
            title: task_type.clone(),
            task_type,
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn requires<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(caps.into_iter().map(Into::into));
        self
    }

    pub fn prefers<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_capabilities
            .extend(caps.into_iter().map(Into::into));
        self
    }

    pub fn depends_on<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = Uuid>,
    {
        self.dependencies.extend(deps);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub required_capabilities: Vec<String>,
    pub optional_capabilities: Vec<String>,
    pub dependencies: BTreeSet<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_to: Option<WorkerId>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub constraints: TaskConstraints,
    pub context: TaskContext,
    pub timeout_ms: Option<u64>,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh `Pending` task with a new id.
    pub fn from_spec(spec: TaskSpec, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: spec.task_type,
            title: spec.title,
            description: spec.description,
            status: TaskStatus::Pending,
            priority: spec.priority,
            required_capabilities: spec.required_capabilities,
            optional_capabilities: spec.optional_capabilities,
            dependencies: spec.dependencies.into_iter().collect(),
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            assigned_to: None,
            input: spec.input,
            output: None,
            error: None,
            constraints: spec.constraints,
            context: spec.context,
            timeout_ms: spec.timeout_ms,
            requires_approval: spec.requires_approval,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Task,
    Decision,
    Parallel,
    HumanApproval,
    ErrorHandler,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

/// Present in the definition schema; the evaluator only looks at a single
/// condition per edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

/// A predicate over the execution context. `field` is a dotted path such as
/// `outputs.scan.severity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combinator: Option<Combinator>,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            combinator: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            name: None,
            task: None,
            conditions: Vec::new(),
            config: Value::Null,
            position: None,
        }
    }

    /// Shorthand for a `Task` node carrying the given template.
    pub fn task(id: impl Into<String>, spec: TaskSpec) -> Self {
        let mut node = Self::new(id, NodeType::Task);
        node.task = Some(spec);
        node
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{source}->{target}"),
            source,
            target,
            condition: None,
            label: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowConfig {
    #[serde(rename = "maxExecutionTime")]
    pub max_execution_time_ms: Option<u64>,
    pub max_retries: u32,
    pub parallelism_limit: u32,
    pub requires_approval: bool,
    pub notification_channels: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_execution_time_ms: None,
            max_retries: 3,
            parallelism_limit: 1,
            requires_approval: false,
            notification_channels: Vec::new(),
        }
    }
}

/// A static directed graph describing a multi-step process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl Workflow {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Map::new(),
            config: WorkflowConfig::default(),
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The single `Start` node, if the graph has exactly one.
    pub fn start_node(&self) -> Option<&WorkflowNode> {
        let mut starts = self.nodes.iter().filter(|n| n.node_type == NodeType::Start);
        match (starts.next(), starts.next()) {
            (Some(start), None) => Some(start),
            _ => None,
        }
    }

    /// Outgoing edges of `node_id` in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }
}

// ---------------------------------------------------------------------------
// Workflow execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

/// Progress that arrived while an execution was paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingStep {
    Enter { node_id: String },
    Leave { node_id: String, outcome: StepOutcome },
}

/// An open human-approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub node_id: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One run of a [`Workflow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_node: String,
    pub execution_path: Vec<String>,
    pub context: Map<String, Value>,
    /// Scheduler task created for each entered task node.
    pub node_tasks: BTreeMap<String, Uuid>,
    pub pending_approvals: BTreeMap<String, ApprovalGate>,
    pub deferred: Vec<PendingStep>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, start_node: impl Into<String>, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Running,
            current_node: start_node.into(),
            execution_path: Vec::new(),
            context,
            node_tasks: BTreeMap::new(),
            pending_approvals: BTreeMap::new(),
            deferred: Vec::new(),
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
