use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sy_core::config::Config;
use sy_core::events::{EngineEvent, EventType};
use sy_core::messages::{
    ApprovalRequestPayload, ApprovalResponsePayload, ApprovalTarget, Endpoint, Message,
    MessagePriority, MessageType, ResponseStatus, TaskResponsePayload,
};
use sy_core::snapshot::SystemSnapshot;
use sy_core::types::{Task, TaskSpec, Worker, WorkerId, WorkerStatus, Workflow, WorkflowExecution};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::registry::{Registry, SweepReport};
use crate::scheduler::Scheduler;
use crate::workflow::{WorkflowAction, WorkflowEngine};

const SOURCE: &str = "engine";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one [`Engine::tick`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub expired_messages: usize,
    pub urgent_reprocessed: usize,
    pub dispatched: usize,
    pub assigned: usize,
    pub sweep: Option<SweepReport>,
    pub reap: Option<ReapReport>,
}

/// What one [`Engine::reap`] pass failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapReport {
    pub timed_out_tasks: Vec<Uuid>,
    pub failed_executions: Vec<Uuid>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out_tasks.is_empty() && self.failed_executions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns every component and routes effects between them.
///
/// Public operations apply one change and then drain the resulting effects
/// (outgoing messages, settled tasks, workflow actions) until nothing is left,
/// so callers always observe a settled state.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    registry: Registry,
    scheduler: Scheduler,
    workflows: WorkflowEngine,
    bus: MessageBus,
    events: EventBus,
    last_sweep: Option<DateTime<Utc>>,
    last_reap: Option<DateTime<Utc>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl Engine {
    /// Build an engine with a running scheduler.
    pub fn new(config: &Config) -> Self {
        let events = EventBus::new();
        let mut scheduler = Scheduler::new(config.scheduler.clone(), events.clone());
        scheduler.start();
        Self {
            registry: Registry::new(config.registry.clone(), events.clone()),
            scheduler,
            workflows: WorkflowEngine::new(config.reaper.approval_timeout_ms, events.clone()),
            bus: MessageBus::new(config.bus.clone(), events.clone()),
            events,
            config: config.clone(),
            last_sweep: None,
            last_reap: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> flume::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Mailbox for messages addressed to `endpoint`.
    pub fn subscribe(&mut self, endpoint: Endpoint) -> flume::Receiver<Message> {
        self.bus.subscribe(endpoint)
    }

    pub fn start(&mut self) {
        self.scheduler.start();
        self.assign_queued();
    }

    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    // -- Workers --

    pub fn register_worker(&mut self, worker: Worker) -> Result<()> {
        self.registry.register(worker)?;
        self.assign_queued();
        Ok(())
    }

    /// Remove a worker. Tasks it held go back to the queue.
    pub fn unregister_worker(&mut self, id: &str) -> Result<Worker> {
        let worker = self.registry.unregister(id)?;
        self.scheduler.release_worker(id);
        self.assign_queued();
        Ok(worker)
    }

    pub fn set_worker_status(&mut self, id: &str, status: WorkerStatus) -> Result<()> {
        self.registry.set_status(id, status)?;
        if status.accepts_work() {
            self.assign_queued();
        }
        Ok(())
    }

    pub fn record_heartbeat(&mut self, id: &str) -> Result<()> {
        self.registry.record_heartbeat(id, Utc::now())?;
        self.assign_queued();
        Ok(())
    }

    // -- Tasks --

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.scheduler.get(id)
    }

    pub fn create_task(&mut self, spec: TaskSpec) -> Result<Uuid> {
        let id = self.scheduler.create_task(spec, &mut self.registry)?;
        self.pump(Vec::new());
        Ok(id)
    }

    pub fn add_dependency(&mut self, task: Uuid, dependency: Uuid) -> Result<()> {
        self.scheduler.add_dependency(task, dependency)?;
        Ok(())
    }

    /// Assign explicitly to `worker`, or to the best match when `None`.
    pub fn assign_task(&mut self, id: Uuid, worker: Option<&str>) -> Result<Option<WorkerId>> {
        let assigned = self.scheduler.assign_task(id, worker, &mut self.registry)?;
        self.pump(Vec::new());
        Ok(assigned)
    }

    pub fn start_task(&mut self, id: Uuid) -> Result<bool> {
        Ok(self.scheduler.start_task(id)?)
    }

    pub fn complete_task(&mut self, id: Uuid, output: Value) -> Result<bool> {
        let changed = self.scheduler.complete_task(id, output, &mut self.registry)?;
        self.pump(Vec::new());
        Ok(changed)
    }

    pub fn fail_task(&mut self, id: Uuid, error: impl Into<String>) -> Result<bool> {
        let changed = self.scheduler.fail_task(id, error, &mut self.registry)?;
        self.pump(Vec::new());
        Ok(changed)
    }

    pub fn cancel_task(&mut self, id: Uuid) -> Result<bool> {
        let changed = self.scheduler.cancel_task(id, &mut self.registry)?;
        self.pump(Vec::new());
        Ok(changed)
    }

    pub fn reject_task(&mut self, id: Uuid, reason: &str) -> Result<bool> {
        let changed = self.scheduler.reject_task(id, reason, &mut self.registry)?;
        self.assign_queued();
        Ok(changed)
    }

    pub fn resolve_task_approval(&mut self, id: Uuid, approved: bool) -> Result<bool> {
        let changed = self.scheduler.resolve_approval(id, approved, &mut self.registry)?;
        self.pump(Vec::new());
        Ok(changed)
    }

    // -- Workflows --

    pub fn execution(&self, id: Uuid) -> Option<&WorkflowExecution> {
        self.workflows.get(id)
    }

    pub fn register_workflow(&mut self, workflow: Workflow) -> Result<()> {
        self.workflows.register(workflow)?;
        Ok(())
    }

    /// Start an execution. It sits at its start node until the next
    /// [`tick`](Engine::tick).
    pub fn start_workflow(&mut self, workflow_id: &str, input: Value) -> Result<Uuid> {
        Ok(self.workflows.start(workflow_id, input)?)
    }

    pub fn pause_workflow(&mut self, execution: Uuid) -> Result<()> {
        self.workflows.pause(execution)?;
        Ok(())
    }

    pub fn resume_workflow(&mut self, execution: Uuid) -> Result<()> {
        let actions = self.workflows.resume(execution)?;
        self.pump(actions);
        Ok(())
    }

    pub fn cancel_workflow(&mut self, execution: Uuid) -> Result<()> {
        let actions = self.workflows.cancel(execution)?;
        self.pump(actions);
        Ok(())
    }

    pub fn approve_workflow(&mut self, execution: Uuid, node_id: &str, approved: bool) -> Result<()> {
        let actions = self.workflows.approve(execution, node_id, approved)?;
        self.pump(actions);
        Ok(())
    }

    // -- Messaging --

    /// Queue a message. Urgent messages are processed before this returns.
    pub fn send_message(&mut self, message: Message) -> Result<Uuid> {
        let urgent = message.priority == MessagePriority::Urgent;
        let id = self.bus.send(message);
        if urgent {
            self.process_message(id)?;
        }
        Ok(id)
    }

    /// Take a queued message off the bus and route it.
    pub fn process_message(&mut self, id: Uuid) -> Result<()> {
        let message = self.bus.take(id).ok_or(EngineError::MessageNotFound(id))?;
        let routed = self.route(message);
        self.pump(Vec::new());
        routed
    }

    /// Route up to `max` queued messages in priority order.
    pub fn dispatch_pending(&mut self, max: usize) -> usize {
        let mut dispatched = 0;
        while dispatched < max {
            let Some(message) = self.bus.pop_next() else {
                break;
            };
            let id = message.id;
            if let Err(e) = self.route(message) {
                warn!(message_id = %id, error = %e, "message routing failed");
            }
            dispatched += 1;
        }
        self.pump(Vec::new());
        dispatched
    }

    // -- Maintenance --

    /// Offer queued tasks to workers. Returns how many were assigned.
    pub fn process_queue(&mut self) -> usize {
        let assigned = self.scheduler.process_queue(&mut self.registry);
        self.pump(Vec::new());
        assigned
    }

    /// One cooperative maintenance step: kick off new executions, expire and
    /// dispatch messages, retry the queue, and run the liveness sweep and
    /// reaper when their intervals are due.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let kickoff = self.workflows.run_ready();
        self.pump(kickoff);

        let bus_tick = self.bus.tick(now);
        report.expired_messages = bus_tick.expired.len();
        for id in bus_tick.urgent {
            if let Some(message) = self.bus.take(id) {
                if let Err(e) = self.route(message) {
                    warn!(message_id = %id, error = %e, "urgent message routing failed");
                }
                report.urgent_reprocessed += 1;
            }
        }
        self.pump(Vec::new());

        report.dispatched = self.dispatch_pending(self.config.bus.dispatch_batch);
        report.assigned = self.process_queue();

        let sweep_every = millis(self.config.registry.health_sweep_interval_ms);
        if self.last_sweep.is_none_or(|at| now - at >= sweep_every) {
            report.sweep = Some(self.sweep_workers(now));
        }
        let reap_every = millis(self.config.reaper.interval_ms);
        if self.config.reaper.enabled && self.last_reap.is_none_or(|at| now - at >= reap_every) {
            report.reap = Some(self.reap(now));
        }
        report
    }

    /// Probe quiet idle workers and flag those whose probe went unanswered.
    pub fn sweep_workers(&mut self, now: DateTime<Utc>) -> SweepReport {
        self.last_sweep = Some(now);
        let report = self.registry.health_sweep(now);
        for id in &report.probed {
            self.bus.send(
                Message::new(
                    MessageType::Heartbeat,
                    Endpoint::System,
                    Endpoint::worker(id.as_str()),
                    json!({ "probe": true }),
                )
                .with_priority(MessagePriority::High),
            );
        }
        report
    }

    /// Fail overdue tasks and executions.
    pub fn reap(&mut self, now: DateTime<Utc>) -> ReapReport {
        self.last_reap = Some(now);
        let timed_out_tasks = self.scheduler.reap_overdue(now, &mut self.registry);
        let (failed_executions, actions) = self.workflows.expire_overdue(now);
        self.pump(actions);
        let report = ReapReport {
            timed_out_tasks,
            failed_executions,
        };
        if !report.is_empty() {
            info!(
                tasks = report.timed_out_tasks.len(),
                executions = report.failed_executions.len(),
                "reaped overdue work"
            );
        }
        report
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Utc::now(),
            scheduler: self.scheduler.stats(),
            registry: self.registry.stats(),
            message_queue_depth: self.bus.queue_len(),
            message_history_len: self.bus.history_len(),
            active_executions: self.workflows.active_count(),
        }
    }

    // -- Routing --

    fn route(&mut self, message: Message) -> Result<()> {
        self.events.emit(
            EventType::MessageReceived,
            SOURCE,
            json!({
                "messageId": message.id,
                "type": message.message_type,
                "recipient": message.recipient.to_string(),
            }),
        );
        if message.recipient != Endpoint::System {
            self.bus.deliver(&message);
            return Ok(());
        }
        match message.message_type {
            MessageType::TaskResponse => self.on_task_response(&message),
            MessageType::HumanApprovalResponse => self.on_approval_response(&message),
            MessageType::Heartbeat => match message.sender.worker_id() {
                Some(worker) => Ok(self.registry.record_heartbeat(worker, message.timestamp)?),
                None => Ok(()),
            },
            MessageType::StatusUpdate => self.on_status_update(&message),
            MessageType::ErrorReport => {
                warn!(sender = %message.sender, payload = %message.payload, "error reported");
                self.events.emit(
                    EventType::SystemError,
                    SOURCE,
                    json!({ "sender": message.sender.to_string(), "report": message.payload }),
                );
                Ok(())
            }
            other => {
                debug!(message_type = other.as_str(), "ignoring message addressed to system");
                Ok(())
            }
        }
    }

    fn on_task_response(&mut self, message: &Message) -> Result<()> {
        let response: TaskResponsePayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| EngineError::Payload {
                kind: "task_response",
                reason: e.to_string(),
            })?;
        let id = response.task_id;
        if self.scheduler.get(id).is_none() {
            debug!(task_id = %id, "response for unknown task");
            return Ok(());
        }
        let error_text = response
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.code, e.message));
        match response.status {
            ResponseStatus::Accepted => {
                self.scheduler.start_task(id)?;
            }
            ResponseStatus::Rejected => {
                let reason = error_text.unwrap_or_else(|| "rejected by worker".into());
                self.scheduler.reject_task(id, &reason, &mut self.registry)?;
                self.scheduler.process_queue(&mut self.registry);
            }
            ResponseStatus::Completed => {
                let output = response.result.unwrap_or(Value::Null);
                self.scheduler.complete_task(id, output, &mut self.registry)?;
            }
            ResponseStatus::Failed => {
                let error = error_text.unwrap_or_else(|| "task failed".into());
                self.scheduler.fail_task(id, error, &mut self.registry)?;
            }
            ResponseStatus::Partial => {
                info!(task_id = %id, "partial result");
                self.scheduler
                    .record_partial(id, response.result.unwrap_or(Value::Null))?;
            }
        }
        Ok(())
    }

    fn on_approval_response(&mut self, message: &Message) -> Result<()> {
        let response: ApprovalResponsePayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| EngineError::Payload {
                kind: "human_approval_response",
                reason: e.to_string(),
            })?;
        info!(
            approved = response.approved,
            approver = response.approver.as_deref().unwrap_or("unknown"),
            "approval response"
        );
        match response.target {
            ApprovalTarget::Task { task_id } => {
                self.scheduler
                    .resolve_approval(task_id, response.approved, &mut self.registry)?;
            }
            ApprovalTarget::Workflow {
                execution_id,
                node_id,
            } => {
                let actions = self
                    .workflows
                    .approve(execution_id, &node_id, response.approved)?;
                self.pump(actions);
            }
        }
        Ok(())
    }

    /// A worker announcing its own status, e.g. `{"status": "offline"}`.
    fn on_status_update(&mut self, message: &Message) -> Result<()> {
        let status = message
            .payload
            .get("status")
            .cloned()
            .and_then(|s| serde_json::from_value::<WorkerStatus>(s).ok());
        match (message.sender.worker_id(), status) {
            (Some(worker), Some(status)) => {
                self.registry.set_status(worker, status)?;
                if status.accepts_work() {
                    self.scheduler.process_queue(&mut self.registry);
                }
            }
            _ => info!(sender = %message.sender, payload = %message.payload, "status update"),
        }
        Ok(())
    }

    // -- Effects --

    fn assign_queued(&mut self) {
        self.process_queue();
    }

    /// Drain scheduler output and workflow actions until both are empty.
    fn pump(&mut self, mut actions: Vec<WorkflowAction>) {
        loop {
            for action in std::mem::take(&mut actions) {
                let follow_up = self.apply_action(action);
                actions.extend(follow_up);
            }
            let outbox = self.scheduler.take_outbox();
            let settled = self.scheduler.take_settled();
            if outbox.is_empty() && settled.is_empty() && actions.is_empty() {
                break;
            }
            for message in outbox {
                self.post(message);
            }
            for task in settled {
                actions.extend(self.workflows.on_task_settled(task.task_id, &task.settlement));
            }
        }
    }

    fn apply_action(&mut self, action: WorkflowAction) -> Vec<WorkflowAction> {
        match action {
            WorkflowAction::CreateTask {
                execution_id,
                node_id,
                spec,
            } => match self.scheduler.create_task(spec, &mut self.registry) {
                Ok(task) => {
                    self.workflows.bind_task(execution_id, &node_id, task);
                    Vec::new()
                }
                Err(e) => self.workflows.fail_execution(
                    execution_id,
                    format!("could not create task for node `{node_id}`: {e}"),
                ),
            },
            WorkflowAction::RequestApproval {
                execution_id,
                node_id,
                summary,
                expires_at,
            } => {
                let payload = ApprovalRequestPayload {
                    target: ApprovalTarget::Workflow {
                        execution_id,
                        node_id,
                    },
                    summary,
                    expires_at,
                };
                let mut message = Message::new(
                    MessageType::HumanApprovalRequest,
                    Endpoint::System,
                    Endpoint::Human,
                    serde_json::to_value(payload).unwrap_or(Value::Null),
                )
                .with_priority(MessagePriority::High)
                .correlated_with(execution_id);
                if let Some(at) = expires_at {
                    message = message.expires_at(at);
                }
                self.post(message);
                Vec::new()
            }
            WorkflowAction::CancelTask { task_id } => {
                if let Err(e) = self.scheduler.cancel_task(task_id, &mut self.registry) {
                    warn!(task_id = %task_id, error = %e, "cancel workflow task");
                }
                Vec::new()
            }
        }
    }

    /// Queue a component-generated message; urgent ones are routed at once.
    fn post(&mut self, message: Message) {
        let urgent = message.priority == MessagePriority::Urgent;
        let id = self.bus.send(message);
        if urgent {
            if let Some(message) = self.bus.take(id) {
                if let Err(e) = self.route(message) {
                    warn!(message_id = %id, error = %e, "urgent message routing failed");
                }
            }
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms as i64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
