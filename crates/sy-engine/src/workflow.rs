use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use sy_core::events::EventType;
use sy_core::types::{
    ApprovalGate, ExecutionStatus, NodeType, PendingStep, StepOutcome, TaskSpec, Workflow,
    WorkflowExecution,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::condition;
use crate::events::EventBus;
use crate::scheduler::Settlement;

const SOURCE: &str = "workflow";

/// Transitions applied in one advance before the execution is failed. Guards
/// against graphs that loop without ever reaching a task or gate.
const MAX_STEPS_PER_ADVANCE: usize = 1_000;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow not found: `{0}`")]
    WorkflowNotFound(String),
    #[error("duplicate workflow id: `{0}`")]
    DuplicateWorkflow(String),
    #[error("invalid workflow `{id}`: {reason}")]
    InvalidWorkflow { id: String, reason: String },
    #[error("workflow input must be a JSON object")]
    InvalidInput,
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
    #[error("no open approval gate `{node}` on execution {execution}")]
    GateNotFound { execution: Uuid, node: String },
    #[error("execution {execution} is {status:?}")]
    InvalidTransition {
        execution: Uuid,
        status: ExecutionStatus,
    },
}

/// Side effects the interpreter needs the engine to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowAction {
    /// Create a scheduler task for a task node, then report the id back via
    /// [`WorkflowEngine::bind_task`].
    CreateTask {
        execution_id: Uuid,
        node_id: String,
        spec: TaskSpec,
    },
    RequestApproval {
        execution_id: Uuid,
        node_id: String,
        summary: String,
        expires_at: Option<DateTime<Utc>>,
    },
    CancelTask { task_id: Uuid },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Registered workflow definitions and their executions.
///
/// Executions begin at their start node; the first transition out of it is
/// taken by [`run_ready`](WorkflowEngine::run_ready) on the next engine tick.
#[derive(Debug)]
pub struct WorkflowEngine {
    workflows: AHashMap<String, Arc<Workflow>>,
    executions: AHashMap<Uuid, WorkflowExecution>,
    /// Outstanding task id -> (execution, node).
    task_index: AHashMap<Uuid, (Uuid, String)>,
    ready: Vec<Uuid>,
    approval_timeout: Duration,
    events: EventBus,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(86_400_000, EventBus::new())
    }
}

impl WorkflowEngine {
    pub fn new(approval_timeout_ms: u64, events: EventBus) -> Self {
        Self {
            workflows: AHashMap::new(),
            executions: AHashMap::new(),
            task_index: AHashMap::new(),
            ready: Vec::new(),
            approval_timeout: Duration::milliseconds(approval_timeout_ms as i64),
            events,
        }
    }

    /// Validate and store a definition. Definitions are immutable once
    /// registered.
    pub fn register(&mut self, workflow: Workflow) -> Result<(), WorkflowError> {
        if self.workflows.contains_key(&workflow.id) {
            return Err(WorkflowError::DuplicateWorkflow(workflow.id));
        }
        validate(&workflow)?;
        info!(workflow_id = %workflow.id, nodes = workflow.nodes.len(), edges = workflow.edges.len(), "registered workflow");
        self.workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn workflow(&self, id: &str) -> Option<&Workflow> {
        self.workflows.get(id).map(Arc::as_ref)
    }

    pub fn get(&self, execution: Uuid) -> Option<&WorkflowExecution> {
        self.executions.get(&execution)
    }

    /// Executions that are running or paused.
    pub fn active_executions(&self) -> impl Iterator<Item = &WorkflowExecution> {
        self.executions.values().filter(|e| !e.status.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        self.active_executions().count()
    }

    /// Execution and node a scheduler task was created for.
    pub fn task_origin(&self, task: Uuid) -> Option<(Uuid, &str)> {
        self.task_index.get(&task).map(|(e, n)| (*e, n.as_str()))
    }

    // -- Lifecycle --

    /// Create an execution sitting at the start node. `input` overrides the
    /// workflow's default variables key by key.
    pub fn start(&mut self, workflow_id: &str, input: Value) -> Result<Uuid, WorkflowError> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        let input = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(WorkflowError::InvalidInput),
        };
        let start = workflow.start_node().ok_or_else(|| WorkflowError::InvalidWorkflow {
            id: workflow.id.clone(),
            reason: "no unique start node".into(),
        })?;

        let mut context = workflow.variables.clone();
        context.extend(input);
        let mut execution = WorkflowExecution::new(&workflow.id, &start.id, context);
        execution.execution_path.push(start.id.clone());
        let id = execution.id;
        self.executions.insert(id, execution);
        self.ready.push(id);

        info!(workflow_id = %workflow.id, execution_id = %id, "workflow started");
        self.events.emit(
            EventType::WorkflowStarted,
            SOURCE,
            json!({ "workflowId": workflow.id, "executionId": id }),
        );
        Ok(id)
    }

    /// Take the first transition of every execution started since the last
    /// call.
    pub fn run_ready(&mut self) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        for id in std::mem::take(&mut self.ready) {
            let Some(start) = self.executions.get(&id).map(|e| e.current_node.clone()) else {
                continue;
            };
            self.apply(
                id,
                PendingStep::Leave {
                    node_id: start,
                    outcome: StepOutcome::Succeeded,
                },
                &mut actions,
            );
        }
        actions
    }

    pub fn pause(&mut self, execution: Uuid) -> Result<(), WorkflowError> {
        let exec = self.execution_mut(execution)?;
        match exec.status {
            ExecutionStatus::Running => {
                exec.status = ExecutionStatus::Paused;
                exec.updated_at = Utc::now();
                info!(execution_id = %execution, "workflow paused");
                Ok(())
            }
            ExecutionStatus::Paused => Ok(()),
            status => Err(WorkflowError::InvalidTransition { execution, status }),
        }
    }

    /// Resume a paused execution and replay progress that arrived meanwhile.
    pub fn resume(&mut self, execution: Uuid) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let exec = self.execution_mut(execution)?;
        match exec.status {
            ExecutionStatus::Paused => {}
            ExecutionStatus::Running => return Ok(Vec::new()),
            status => return Err(WorkflowError::InvalidTransition { execution, status }),
        }
        exec.status = ExecutionStatus::Running;
        exec.updated_at = Utc::now();
        let deferred = std::mem::take(&mut exec.deferred);
        info!(execution_id = %execution, replayed = deferred.len(), "workflow resumed");

        let mut actions = Vec::new();
        for step in deferred {
            self.apply(execution, step, &mut actions);
        }
        Ok(actions)
    }

    /// Stop an execution. Its outstanding tasks are returned for
    /// cancellation.
    pub fn cancel(&mut self, execution: Uuid) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let exec = self.execution_mut(execution)?;
        if exec.status.is_terminal() {
            return Err(WorkflowError::InvalidTransition {
                execution,
                status: exec.status,
            });
        }
        let now = Utc::now();
        exec.status = ExecutionStatus::Cancelled;
        exec.completed_at = Some(now);
        exec.updated_at = now;
        exec.pending_approvals.clear();
        exec.deferred.clear();
        info!(execution_id = %execution, "workflow cancelled");
        let mut actions = Vec::new();
        self.release_tasks(execution, true, &mut actions);
        Ok(actions)
    }

    /// Fail an execution from outside the interpreter, e.g. when its task
    /// could not be created.
    pub fn fail_execution(&mut self, execution: Uuid, reason: impl Into<String>) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        self.fail(execution, reason.into(), &mut actions);
        actions
    }

    // -- Progress --

    /// Record the scheduler task created for a task node.
    pub fn bind_task(&mut self, execution: Uuid, node_id: &str, task: Uuid) {
        if let Some(exec) = self.executions.get_mut(&execution) {
            exec.node_tasks.insert(node_id.to_string(), task);
            self.task_index.insert(task, (execution, node_id.to_string()));
        }
    }

    /// Advance past the node whose task just settled. Tasks not created by a
    /// workflow are ignored.
    pub fn on_task_settled(&mut self, task: Uuid, settlement: &Settlement) -> Vec<WorkflowAction> {
        let mut actions = Vec::new();
        let Some((execution, node_id)) = self.task_index.remove(&task) else {
            return actions;
        };
        let Some(exec) = self.executions.get_mut(&execution) else {
            return actions;
        };
        if exec.status.is_terminal() {
            return actions;
        }
        let outcome = match settlement {
            Settlement::Completed(output) => {
                set_in(&mut exec.context, "outputs", &node_id, output.clone());
                StepOutcome::Succeeded
            }
            Settlement::Failed(error) => {
                set_in(&mut exec.context, "errors", &node_id, json!(error));
                StepOutcome::Failed
            }
            Settlement::Cancelled => {
                set_in(&mut exec.context, "errors", &node_id, json!("task cancelled"));
                StepOutcome::Failed
            }
        };
        debug!(execution_id = %execution, node_id = %node_id, ?outcome, "task node settled");
        self.apply(execution, PendingStep::Leave { node_id, outcome }, &mut actions);
        actions
    }

    /// Resolve an open approval gate. The decision is written to
    /// `approvals.<node_id>` and the gate's outgoing edges are evaluated like
    /// a decision node.
    pub fn approve(
        &mut self,
        execution: Uuid,
        node_id: &str,
        approved: bool,
    ) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let exec = self.execution_mut(execution)?;
        if exec.pending_approvals.remove(node_id).is_none() {
            return Err(WorkflowError::GateNotFound {
                execution,
                node: node_id.to_string(),
            });
        }
        set_in(&mut exec.context, "approvals", node_id, json!(approved));
        info!(execution_id = %execution, node_id, approved, "approval gate resolved");
        let mut actions = Vec::new();
        self.apply(
            execution,
            PendingStep::Leave {
                node_id: node_id.to_string(),
                outcome: StepOutcome::Succeeded,
            },
            &mut actions,
        );
        Ok(actions)
    }

    /// Fail executions whose approval gate expired or that ran past the
    /// workflow's `maxExecutionTime`. Returns the failed execution ids.
    pub fn expire_overdue(&mut self, now: DateTime<Utc>) -> (Vec<Uuid>, Vec<WorkflowAction>) {
        let mut overdue = Vec::new();
        for exec in self.executions.values().filter(|e| !e.status.is_terminal()) {
            let expired_gate = exec
                .pending_approvals
                .values()
                .find(|g| g.expires_at.is_some_and(|at| at <= now));
            if let Some(gate) = expired_gate {
                overdue.push((exec.id, format!("approval gate `{}` expired", gate.node_id)));
                continue;
            }
            let limit = self
                .workflows
                .get(&exec.workflow_id)
                .and_then(|wf| wf.config.max_execution_time_ms);
            if let Some(limit) = limit {
                if (now - exec.started_at).num_milliseconds() >= limit as i64 {
                    overdue.push((exec.id, format!("execution exceeded {limit}ms")));
                }
            }
        }

        let mut actions = Vec::new();
        let ids = overdue.iter().map(|(id, _)| *id).collect();
        for (id, reason) in overdue {
            self.fail(id, reason, &mut actions);
        }
        (ids, actions)
    }

    // -- Interpreter --

    fn apply(&mut self, execution: Uuid, step: PendingStep, actions: &mut Vec<WorkflowAction>) {
        let mut work = VecDeque::from([step]);
        let mut steps = 0;
        while let Some(step) = work.pop_front() {
            steps += 1;
            if steps > MAX_STEPS_PER_ADVANCE {
                self.fail(execution, "step limit exceeded".into(), actions);
                return;
            }
            let Some(exec) = self.executions.get_mut(&execution) else {
                return;
            };
            match exec.status {
                ExecutionStatus::Running => {}
                ExecutionStatus::Paused => {
                    exec.deferred.push(step);
                    continue;
                }
                status => {
                    debug!(execution_id = %execution, ?status, "ignoring progress on finished execution");
                    return;
                }
            }
            let Some(workflow) = self.workflows.get(&exec.workflow_id).cloned() else {
                self.fail(execution, "workflow definition missing".into(), actions);
                return;
            };
            match step {
                PendingStep::Enter { node_id } => {
                    self.enter(execution, &workflow, &node_id, &mut work, actions)
                }
                PendingStep::Leave { node_id, outcome } => {
                    self.leave(execution, &workflow, &node_id, outcome, &mut work, actions)
                }
            }
        }
    }

    fn enter(
        &mut self,
        execution: Uuid,
        workflow: &Workflow,
        node_id: &str,
        work: &mut VecDeque<PendingStep>,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let Some(node) = workflow.node(node_id) else {
            self.fail(execution, format!("unknown node `{node_id}`"), actions);
            return;
        };
        let Some(exec) = self.executions.get_mut(&execution) else {
            return;
        };
        let now = Utc::now();
        exec.current_node = node_id.to_string();
        exec.execution_path.push(node_id.to_string());
        exec.updated_at = now;
        debug!(execution_id = %execution, node_id, node_type = ?node.node_type, "entering node");

        match node.node_type {
            NodeType::Start => work.push_back(PendingStep::Leave {
                node_id: node_id.to_string(),
                outcome: StepOutcome::Succeeded,
            }),
            NodeType::Task => {
                let mut spec = node.task.clone().unwrap_or_else(|| TaskSpec::new(&node.id));
                spec.context.workflow_id = Some(workflow.id.clone());
                spec.context.execution_id = Some(execution);
                spec.context.node_id = Some(node.id.clone());
                if spec.max_retries.is_none() {
                    spec.max_retries = Some(workflow.config.max_retries);
                }
                actions.push(WorkflowAction::CreateTask {
                    execution_id: execution,
                    node_id: node.id.clone(),
                    spec,
                });
            }
            NodeType::Decision => match route(workflow, &exec.context, node_id, true) {
                Some(target) => work.push_back(PendingStep::Enter { node_id: target }),
                None => self.fail(execution, format!("no branch of decision `{node_id}` matched"), actions),
            },
            NodeType::Parallel => {
                for edge in workflow.outgoing(node_id) {
                    work.push_back(PendingStep::Enter {
                        node_id: edge.target.clone(),
                    });
                }
            }
            NodeType::HumanApproval => {
                let timeout = node
                    .config
                    .get("timeout_ms")
                    .and_then(Value::as_u64)
                    .map(|ms| Duration::milliseconds(ms as i64))
                    .unwrap_or(self.approval_timeout);
                let expires_at = Some(now + timeout);
                exec.pending_approvals.insert(
                    node_id.to_string(),
                    ApprovalGate {
                        node_id: node_id.to_string(),
                        requested_at: now,
                        expires_at,
                    },
                );
                actions.push(WorkflowAction::RequestApproval {
                    execution_id: execution,
                    node_id: node_id.to_string(),
                    summary: node.name.clone().unwrap_or_else(|| node_id.to_string()),
                    expires_at,
                });
            }
            NodeType::ErrorHandler => {
                let message = exec
                    .error
                    .clone()
                    .unwrap_or_else(|| "error handler reached".to_string());
                exec.context.insert(
                    "error".to_string(),
                    json!({ "handler": node_id, "message": message }),
                );
                match route(workflow, &exec.context, node_id, true) {
                    Some(target) => work.push_back(PendingStep::Enter { node_id: target }),
                    None => self.fail(execution, message, actions),
                }
            }
            NodeType::End => self.complete(execution),
        }
    }

    fn leave(
        &mut self,
        execution: Uuid,
        workflow: &Workflow,
        node_id: &str,
        outcome: StepOutcome,
        work: &mut VecDeque<PendingStep>,
        actions: &mut Vec<WorkflowAction>,
    ) {
        let Some(node) = workflow.node(node_id) else {
            return;
        };
        let Some(exec) = self.executions.get_mut(&execution) else {
            return;
        };
        match (node.node_type, outcome) {
            (NodeType::Start, _) => match workflow.outgoing(node_id).first() {
                Some(edge) => work.push_back(PendingStep::Enter {
                    node_id: edge.target.clone(),
                }),
                None => self.fail(execution, "start node has no outgoing edge".into(), actions),
            },
            (NodeType::Task, StepOutcome::Succeeded) => {
                let has_path = workflow
                    .outgoing(node_id)
                    .iter()
                    .any(|e| !targets_error_handler(workflow, &e.target));
                if !has_path {
                    let waiting = !work.is_empty()
                        || !exec.pending_approvals.is_empty()
                        || self.task_index.values().any(|(e, _)| *e == execution);
                    if waiting {
                        debug!(execution_id = %execution, node_id, "branch ended");
                    } else {
                        debug!(execution_id = %execution, node_id, "last branch ended without an end node");
                        self.complete(execution);
                    }
                    return;
                }
                match route(workflow, &exec.context, node_id, false) {
                    Some(target) => work.push_back(PendingStep::Enter { node_id: target }),
                    None => self.fail(
                        execution,
                        format!("no outgoing edge of `{node_id}` matched"),
                        actions,
                    ),
                }
            }
            (NodeType::Task, StepOutcome::Failed) => {
                let message = condition::lookup(&exec.context, &format!("errors.{node_id}"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("task node `{node_id}` failed"));
                let handler = workflow
                    .outgoing(node_id)
                    .into_iter()
                    .find(|e| targets_error_handler(workflow, &e.target));
                match handler {
                    Some(edge) => {
                        exec.error = Some(message);
                        work.push_back(PendingStep::Enter {
                            node_id: edge.target.clone(),
                        });
                    }
                    None => self.fail(execution, message, actions),
                }
            }
            (NodeType::HumanApproval, _) => match route(workflow, &exec.context, node_id, true) {
                Some(target) => work.push_back(PendingStep::Enter { node_id: target }),
                None => self.fail(
                    execution,
                    format!("no branch after approval `{node_id}` matched"),
                    actions,
                ),
            },
            (node_type, _) => {
                debug!(execution_id = %execution, node_id, ?node_type, "no exit transition for node type");
            }
        }
    }

    fn complete(&mut self, execution: Uuid) {
        let Some(exec) = self.executions.get_mut(&execution) else {
            return;
        };
        let now = Utc::now();
        exec.status = ExecutionStatus::Completed;
        exec.completed_at = Some(now);
        exec.updated_at = now;
        exec.pending_approvals.clear();
        let workflow_id = exec.workflow_id.clone();
        let mut ignored = Vec::new();
        self.release_tasks(execution, false, &mut ignored);
        info!(workflow_id = %workflow_id, execution_id = %execution, "workflow completed");
        self.events.emit(
            EventType::WorkflowCompleted,
            SOURCE,
            json!({ "workflowId": workflow_id, "executionId": execution }),
        );
    }

    fn fail(&mut self, execution: Uuid, reason: String, actions: &mut Vec<WorkflowAction>) {
        let Some(exec) = self.executions.get_mut(&execution) else {
            return;
        };
        if exec.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        exec.status = ExecutionStatus::Failed;
        exec.error = Some(reason.clone());
        exec.completed_at = Some(now);
        exec.updated_at = now;
        exec.pending_approvals.clear();
        exec.deferred.clear();
        let workflow_id = exec.workflow_id.clone();
        self.release_tasks(execution, true, actions);
        warn!(workflow_id = %workflow_id, execution_id = %execution, reason = %reason, "workflow failed");
        self.events.emit(
            EventType::WorkflowFailed,
            SOURCE,
            json!({ "workflowId": workflow_id, "executionId": execution, "error": reason }),
        );
    }

    /// Forget the execution's outstanding tasks, optionally asking for their
    /// cancellation.
    fn release_tasks(&mut self, execution: Uuid, cancel: bool, actions: &mut Vec<WorkflowAction>) {
        let outstanding: Vec<Uuid> = self
            .task_index
            .iter()
            .filter(|(_, (e, _))| *e == execution)
            .map(|(t, _)| *t)
            .collect();
        for task_id in outstanding {
            self.task_index.remove(&task_id);
            if cancel {
                actions.push(WorkflowAction::CancelTask { task_id });
            }
        }
    }

    fn execution_mut(&mut self, id: Uuid) -> Result<&mut WorkflowExecution, WorkflowError> {
        self.executions
            .get_mut(&id)
            .ok_or(WorkflowError::ExecutionNotFound(id))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate(workflow: &Workflow) -> Result<(), WorkflowError> {
    let invalid = |reason: String| WorkflowError::InvalidWorkflow {
        id: workflow.id.clone(),
        reason,
    };
    let starts = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Start)
        .count();
    if starts != 1 {
        return Err(invalid(format!("expected exactly one start node, found {starts}")));
    }
    let mut ids = AHashSet::new();
    for node in &workflow.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(invalid(format!("duplicate node id `{}`", node.id)));
        }
    }
    for edge in &workflow.edges {
        for end in [&edge.source, &edge.target] {
            if !ids.contains(end.as_str()) {
                return Err(invalid(format!("edge `{}` references unknown node `{end}`", edge.id)));
            }
        }
    }
    Ok(())
}

fn targets_error_handler(workflow: &Workflow, target: &str) -> bool {
    workflow
        .node(target)
        .is_some_and(|n| n.node_type == NodeType::ErrorHandler)
}

/// First outgoing edge, in declaration order, whose condition is absent or
/// holds.
fn route(
    workflow: &Workflow,
    context: &Map<String, Value>,
    node_id: &str,
    include_error_handlers: bool,
) -> Option<String> {
    workflow
        .outgoing(node_id)
        .into_iter()
        .filter(|e| include_error_handlers || !targets_error_handler(workflow, &e.target))
        .find(|e| {
            e.condition
                .as_ref()
                .is_none_or(|c| condition::evaluate(c, context))
        })
        .map(|e| e.target.clone())
}

/// `context[section][key] = value`, creating the section object on demand.
fn set_in(context: &mut Map<String, Value>, section: &str, key: &str, value: Value) {
    let slot = context
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(map) = slot {
        map.insert(key.to_string(), value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sy_core::types::{Condition, ConditionOperator, WorkflowEdge, WorkflowNode};

    fn linear() -> Workflow {
        Workflow::new("linear")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::task("build", TaskSpec::new("build")))
            .with_node(WorkflowNode::new("end", NodeType::End))
            .with_edge(WorkflowEdge::new("start", "build"))
            .with_edge(WorkflowEdge::new("build", "end"))
    }

    fn created(actions: &[WorkflowAction]) -> Vec<(Uuid, String)> {
        actions
            .iter()
            .filter_map(|a| match a {
                WorkflowAction::CreateTask {
                    execution_id,
                    node_id,
                    ..
                } => Some((*execution_id, node_id.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn validation_rejects_bad_graphs() {
        let mut engine = WorkflowEngine::default();
        let two_starts = Workflow::new("a")
            .with_node(WorkflowNode::new("s1", NodeType::Start))
            .with_node(WorkflowNode::new("s2", NodeType::Start));
        assert!(matches!(engine.register(two_starts), Err(WorkflowError::InvalidWorkflow { .. })));

        let dangling = Workflow::new("b")
            .with_node(WorkflowNode::new("s", NodeType::Start))
            .with_edge(WorkflowEdge::new("s", "nowhere"));
        let err = engine.register(dangling).unwrap_err();
        assert!(err.to_string().contains("nowhere"));

        let dup = Workflow::new("c")
            .with_node(WorkflowNode::new("s", NodeType::Start))
            .with_node(WorkflowNode::new("s", NodeType::End));
        assert!(engine.register(dup).is_err());

        engine.register(linear()).unwrap();
        assert!(matches!(engine.register(linear()), Err(WorkflowError::DuplicateWorkflow(_))));
    }

    #[test]
    fn start_waits_at_start_node() {
        let mut engine = WorkflowEngine::default();
        engine.register(linear()).unwrap();
        let id = engine.start("linear", json!({"env": "ci"})).unwrap();
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.current_node, "start");
        assert_eq!(exec.context["env"], "ci");

        let actions = engine.run_ready();
        assert_eq!(created(&actions), vec![(id, "build".to_string())]);
        assert_eq!(engine.get(id).unwrap().current_node, "build");
        assert!(engine.run_ready().is_empty());
    }

    #[test]
    fn unknown_workflow_is_an_error() {
        let mut engine = WorkflowEngine::default();
        assert!(matches!(
            engine.start("ghost", Value::Null),
            Err(WorkflowError::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn input_overrides_variables() {
        let mut engine = WorkflowEngine::default();
        engine
            .register(linear().with_variable("env", json!("dev")).with_variable("region", json!("eu")))
            .unwrap();
        let id = engine.start("linear", json!({"env": "prod"})).unwrap();
        let ctx = &engine.get(id).unwrap().context;
        assert_eq!(ctx["env"], "prod");
        assert_eq!(ctx["region"], "eu");
    }

    #[test]
    fn task_completion_advances_to_end() {
        let mut engine = WorkflowEngine::default();
        engine.register(linear()).unwrap();
        let id = engine.start("linear", Value::Null).unwrap();
        engine.run_ready();
        let task = Uuid::new_v4();
        engine.bind_task(id, "build", task);
        assert_eq!(engine.task_origin(task), Some((id, "build")));

        engine.on_task_settled(task, &Settlement::Completed(json!({"artifact": "a.tar"})));
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.context["outputs"]["build"]["artifact"], "a.tar");
        assert_eq!(exec.execution_path, vec!["start", "build", "end"]);
        assert!(exec.completed_at.is_some());
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn decision_takes_first_matching_edge() {
        let wf = Workflow::new("d")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("route", NodeType::Decision))
            .with_node(WorkflowNode::new("big", NodeType::End))
            .with_node(WorkflowNode::new("small", NodeType::End))
            .with_edge(WorkflowEdge::new("start", "route"))
            .with_edge(
                WorkflowEdge::new("route", "big")
                    .when(Condition::new("amount", ConditionOperator::Gt, json!(100))),
            )
            .with_edge(WorkflowEdge::new("route", "small"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();

        let big = engine.start("d", json!({"amount": 500})).unwrap();
        let small = engine.start("d", json!({"amount": 5})).unwrap();
        engine.run_ready();
        assert_eq!(engine.get(big).unwrap().current_node, "big");
        assert_eq!(engine.get(small).unwrap().current_node, "small");
    }

    #[test]
    fn decision_without_match_fails() {
        let wf = Workflow::new("d")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("route", NodeType::Decision))
            .with_node(WorkflowNode::new("end", NodeType::End))
            .with_edge(WorkflowEdge::new("start", "route"))
            .with_edge(
                WorkflowEdge::new("route", "end")
                    .when(Condition::new("ok", ConditionOperator::Eq, json!(true))),
            );
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();
        let id = engine.start("d", Value::Null).unwrap();
        engine.run_ready();
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.as_deref().unwrap().contains("route"));
    }

    #[test]
    fn parallel_fans_out_without_join() {
        let wf = Workflow::new("p")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("fan", NodeType::Parallel))
            .with_node(WorkflowNode::task("lint", TaskSpec::new("lint")))
            .with_node(WorkflowNode::task("test", TaskSpec::new("test")))
            .with_node(WorkflowNode::new("end", NodeType::End))
            .with_edge(WorkflowEdge::new("start", "fan"))
            .with_edge(WorkflowEdge::new("fan", "lint"))
            .with_edge(WorkflowEdge::new("fan", "test"))
            .with_edge(WorkflowEdge::new("lint", "end"))
            .with_edge(WorkflowEdge::new("test", "end"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();
        let id = engine.start("p", Value::Null).unwrap();
        let actions = engine.run_ready();
        let nodes: Vec<_> = created(&actions).into_iter().map(|(_, n)| n).collect();
        assert_eq!(nodes, vec!["lint", "test"]);
        assert_eq!(engine.get(id).unwrap().current_node, "test");

        let (lint, test) = (Uuid::new_v4(), Uuid::new_v4());
        engine.bind_task(id, "lint", lint);
        engine.bind_task(id, "test", test);
        engine.on_task_settled(lint, &Settlement::Completed(json!(1)));
        assert_eq!(engine.get(id).unwrap().status, ExecutionStatus::Completed);
        // the slower branch reports after completion and is ignored
        assert!(engine.on_task_settled(test, &Settlement::Completed(json!(2))).is_empty());
        assert!(engine.get(id).unwrap().context["outputs"].get("test").is_none());
    }

    #[test]
    fn dead_end_task_completes_once_nothing_is_outstanding() {
        let wf = Workflow::new("tail")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("fan", NodeType::Parallel))
            .with_node(WorkflowNode::task("a", TaskSpec::new("a")))
            .with_node(WorkflowNode::task("b", TaskSpec::new("b")))
            .with_node(WorkflowNode::new("oops", NodeType::ErrorHandler))
            .with_edge(WorkflowEdge::new("start", "fan"))
            .with_edge(WorkflowEdge::new("fan", "a"))
            .with_edge(WorkflowEdge::new("fan", "b"))
            .with_edge(WorkflowEdge::new("b", "oops"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();
        let id = engine.start("tail", Value::Null).unwrap();
        engine.run_ready();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        engine.bind_task(id, "a", a);
        engine.bind_task(id, "b", b);

        engine.on_task_settled(a, &Settlement::Completed(json!(1)));
        assert_eq!(engine.get(id).unwrap().status, ExecutionStatus::Running);

        // only an error-handler edge leaves `b`, so success ends the run
        engine.on_task_settled(b, &Settlement::Completed(json!(2)));
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.completed_at.is_some());
        assert_eq!(exec.context["outputs"]["b"], 2);
    }

    #[test]
    fn single_dead_end_task_completes() {
        let wf = Workflow::new("solo")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::task("only", TaskSpec::new("only")))
            .with_edge(WorkflowEdge::new("start", "only"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();
        let id = engine.start("solo", Value::Null).unwrap();
        engine.run_ready();
        let task = Uuid::new_v4();
        engine.bind_task(id, "only", task);
        engine.on_task_settled(task, &Settlement::Completed(Value::Null));
        assert_eq!(engine.get(id).unwrap().status, ExecutionStatus::Completed);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn failure_routes_to_wired_error_handler() {
        let wf = Workflow::new("e")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::task("charge", TaskSpec::new("payment")))
            .with_node(WorkflowNode::new("refund", NodeType::ErrorHandler))
            .with_node(WorkflowNode::new("end", NodeType::End))
            .with_edge(WorkflowEdge::new("start", "charge"))
            .with_edge(WorkflowEdge::new("charge", "refund"))
            .with_edge(WorkflowEdge::new("charge", "end"))
            .with_edge(WorkflowEdge::new("refund", "end"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();

        let ok = engine.start("e", Value::Null).unwrap();
        let bad = engine.start("e", Value::Null).unwrap();
        engine.run_ready();
        let (t_ok, t_bad) = (Uuid::new_v4(), Uuid::new_v4());
        engine.bind_task(ok, "charge", t_ok);
        engine.bind_task(bad, "charge", t_bad);

        engine.on_task_settled(t_ok, &Settlement::Completed(Value::Null));
        assert_eq!(engine.get(ok).unwrap().execution_path, vec!["start", "charge", "end"]);

        engine.on_task_settled(t_bad, &Settlement::Failed("card declined".into()));
        let exec = engine.get(bad).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.execution_path, vec!["start", "charge", "refund", "end"]);
        assert_eq!(exec.context["error"]["message"], "card declined");
    }

    #[test]
    fn unhandled_failure_fails_execution_and_cancels_siblings() {
        let wf = Workflow::new("p")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("fan", NodeType::Parallel))
            .with_node(WorkflowNode::task("a", TaskSpec::new("a")))
            .with_node(WorkflowNode::task("b", TaskSpec::new("b")))
            .with_edge(WorkflowEdge::new("start", "fan"))
            .with_edge(WorkflowEdge::new("fan", "a"))
            .with_edge(WorkflowEdge::new("fan", "b"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();
        let id = engine.start("p", Value::Null).unwrap();
        engine.run_ready();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        engine.bind_task(id, "a", a);
        engine.bind_task(id, "b", b);
        let actions = engine.on_task_settled(a, &Settlement::Failed("exit 1".into()));
        assert_eq!(actions, vec![WorkflowAction::CancelTask { task_id: b }]);
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("exit 1"));
    }

    #[test]
    fn approval_gate_routes_on_decision() {
        let wf = Workflow::new("g")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("review", NodeType::HumanApproval))
            .with_node(WorkflowNode::new("ship", NodeType::End))
            .with_node(WorkflowNode::new("reject", NodeType::ErrorHandler))
            .with_edge(WorkflowEdge::new("start", "review"))
            .with_edge(
                WorkflowEdge::new("review", "ship")
                    .when(Condition::new("approvals.review", ConditionOperator::Eq, json!(true))),
            )
            .with_edge(WorkflowEdge::new("review", "reject"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();

        let yes = engine.start("g", Value::Null).unwrap();
        let no = engine.start("g", Value::Null).unwrap();
        let actions = engine.run_ready();
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, WorkflowAction::RequestApproval { .. }))
                .count(),
            2
        );
        assert!(engine.get(yes).unwrap().pending_approvals.contains_key("review"));

        engine.approve(yes, "review", true).unwrap();
        assert_eq!(engine.get(yes).unwrap().status, ExecutionStatus::Completed);

        engine.approve(no, "review", false).unwrap();
        let exec = engine.get(no).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.context["approvals"]["review"], false);

        assert!(matches!(
            engine.approve(yes, "review", true),
            Err(WorkflowError::GateNotFound { .. })
        ));
    }

    #[test]
    fn paused_execution_defers_progress() {
        let mut engine = WorkflowEngine::default();
        engine.register(linear()).unwrap();
        let id = engine.start("linear", Value::Null).unwrap();
        engine.run_ready();
        let task = Uuid::new_v4();
        engine.bind_task(id, "build", task);

        engine.pause(id).unwrap();
        engine.on_task_settled(task, &Settlement::Completed(json!("done")));
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Paused);
        assert_eq!(exec.current_node, "build");
        assert_eq!(exec.deferred.len(), 1);

        engine.resume(id).unwrap();
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.deferred.is_empty());
    }

    #[test]
    fn cancel_stops_progress() {
        let mut engine = WorkflowEngine::default();
        engine.register(linear()).unwrap();
        let id = engine.start("linear", Value::Null).unwrap();
        engine.run_ready();
        let task = Uuid::new_v4();
        engine.bind_task(id, "build", task);
        let actions = engine.cancel(id).unwrap();
        assert_eq!(actions, vec![WorkflowAction::CancelTask { task_id: task }]);
        assert!(engine.on_task_settled(task, &Settlement::Cancelled).is_empty());
        let exec = engine.get(id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(exec.completed_at.is_some());
        assert!(matches!(engine.pause(id), Err(WorkflowError::InvalidTransition { .. })));
    }

    #[test]
    fn expired_gate_fails_execution() {
        let wf = Workflow::new("g")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("review", NodeType::HumanApproval).with_config(json!({"timeout_ms": 1000})))
            .with_node(WorkflowNode::new("end", NodeType::End))
            .with_edge(WorkflowEdge::new("start", "review"))
            .with_edge(WorkflowEdge::new("review", "end"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();
        let id = engine.start("g", Value::Null).unwrap();
        engine.run_ready();
        let expires = engine.get(id).unwrap().pending_approvals["review"].expires_at.unwrap();

        let (failed, _) = engine.expire_overdue(expires - Duration::milliseconds(1));
        assert!(failed.is_empty());
        let (failed, _) = engine.expire_overdue(expires);
        assert_eq!(failed, vec![id]);
        assert!(engine.get(id).unwrap().error.as_deref().unwrap().contains("expired"));
    }

    #[test]
    fn looping_graph_hits_step_limit() {
        let wf = Workflow::new("loop")
            .with_node(WorkflowNode::new("start", NodeType::Start))
            .with_node(WorkflowNode::new("a", NodeType::Decision))
            .with_node(WorkflowNode::new("b", NodeType::Decision))
            .with_edge(WorkflowEdge::new("start", "a"))
            .with_edge(WorkflowEdge::new("a", "b"))
            .with_edge(WorkflowEdge::new("b", "a"));
        let mut engine = WorkflowEngine::default();
        engine.register(wf).unwrap();
        let id = engine.start("loop", Value::Null).unwrap();
        engine.run_ready();
        assert_eq!(engine.get(id).unwrap().status, ExecutionStatus::Failed);
    }
}
