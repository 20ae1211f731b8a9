use std::cmp::Reverse;
use std::collections::BTreeSet;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sy_core::config::SchedulerConfig;
use sy_core::events::EventType;
use sy_core::messages::{
    ApprovalRequestPayload, ApprovalTarget, Endpoint, Message, MessagePriority, MessageType,
    TaskRequestPayload,
};
use sy_core::snapshot::SchedulerStats;
use sy_core::types::{Priority, Task, TaskSpec, TaskStatus, WorkerId, WorkerStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::EventBus;
use crate::registry::{MatchConstraints, Registry};

const SOURCE: &str = "scheduler";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("unknown dependency {dependency} for task {task}")]
    UnknownDependency { task: Uuid, dependency: Uuid },
    #[error("task {0} has unfinished dependencies")]
    DependenciesUnsatisfied(Uuid),
    #[error("task {id} cannot be assigned while {status}")]
    NotAssignable { id: Uuid, status: TaskStatus },
    #[error("worker not found: `{0}`")]
    WorkerNotFound(String),
    #[error("task {0} is not awaiting approval")]
    NotAwaitingApproval(Uuid),
    #[error("dependency {dependency} of task {task} would close a cycle")]
    CycleDetected { task: Uuid, dependency: Uuid },
    #[error("scheduler is stopped")]
    NotRunning,
}

// ---------------------------------------------------------------------------
// Settlement notices
// ---------------------------------------------------------------------------

/// How a task left the scheduler's hands.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed(Value),
    Failed(String),
    Cancelled,
}

/// Emitted whenever a task reaches a terminal status, so the engine can
/// route it to whoever created the task.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledTask {
    pub task_id: Uuid,
    pub settlement: Settlement,
}

type QueueKey = (Reverse<Priority>, u64, Uuid);

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Task records, the assignment queue and retry policy.
///
/// Operations that hand work to workers take the [`Registry`] by reference.
/// Outgoing messages and terminal-state notices are buffered and drained by
/// the caller with [`take_outbox`](Scheduler::take_outbox) and
/// [`take_settled`](Scheduler::take_settled).
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    tasks: AHashMap<Uuid, Task>,
    /// Creation sequence, used to break priority ties in the queue.
    order: AHashMap<Uuid, u64>,
    next_seq: u64,
    queue: BTreeSet<QueueKey>,
    active: AHashMap<Uuid, WorkerId>,
    running: bool,
    total_created: u64,
    total_processed: u64,
    total_failed: u64,
    total_cancelled: u64,
    total_retried: u64,
    average_duration_ms: f64,
    outbox: Vec<Message>,
    settled: Vec<SettledTask>,
    events: EventBus,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default(), EventBus::new())
    }
}

impl Scheduler {
    /// A new scheduler starts stopped; call [`start`](Scheduler::start).
    pub fn new(config: SchedulerConfig, events: EventBus) -> Self {
        Self {
            config,
            tasks: AHashMap::new(),
            order: AHashMap::new(),
            next_seq: 0,
            queue: BTreeSet::new(),
            active: AHashMap::new(),
            running: false,
            total_created: 0,
            total_processed: 0,
            total_failed: 0,
            total_cancelled: 0,
            total_retried: 0,
            average_duration_ms: 0.0,
            outbox: Vec::new(),
            settled: Vec::new(),
            events,
        }
    }

    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            info!("scheduler started");
        }
    }

    /// Stop assigning work. Tasks are still accepted and queued.
    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Queued task ids in assignment order.
    pub fn queued(&self) -> Vec<Uuid> {
        self.queue.iter().map(|(_, _, id)| *id).collect()
    }

    /// Worker currently holding `task`, if any.
    pub fn holder(&self, task: Uuid) -> Option<&str> {
        self.active.get(&task).map(String::as_str)
    }

    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_settled(&mut self) -> Vec<SettledTask> {
        std::mem::take(&mut self.settled)
    }

    // -- Creation --

    pub fn create_task(&mut self, spec: TaskSpec, registry: &mut Registry) -> Result<Uuid, SchedulerError> {
        let task = Task::from_spec(spec, self.config.default_max_retries);
        let id = task.id;
        if let Some(dep) = task.dependencies.iter().find(|d| !self.tasks.contains_key(d)) {
            return Err(SchedulerError::UnknownDependency { task: id, dependency: *dep });
        }

        self.order.insert(id, self.next_seq);
        self.next_seq += 1;
        self.total_created += 1;
        info!(task_id = %id, task_type = %task.task_type, priority = ?task.priority, "task created");
        self.events.emit(
            EventType::TaskCreated,
            SOURCE,
            json!({ "taskId": id, "type": task.task_type, "priority": task.priority }),
        );

        let needs_approval = task.requires_approval;
        let summary = task.title.clone();
        self.tasks.insert(id, task);

        if needs_approval {
            self.set_status(id, TaskStatus::AwaitingApproval);
            let payload = ApprovalRequestPayload {
                target: ApprovalTarget::Task { task_id: id },
                summary,
                expires_at: None,
            };
            self.outbox.push(
                Message::new(
                    MessageType::HumanApprovalRequest,
                    Endpoint::System,
                    Endpoint::Human,
                    serde_json::to_value(payload).unwrap_or(Value::Null),
                )
                .correlated_with(id),
            );
            return Ok(id);
        }

        if self.dependencies_met(id) {
            self.enqueue(id);
            self.try_assign(id, registry);
        }
        Ok(id)
    }

    /// Add `dependency` to a task that has not been handed out yet.
    pub fn add_dependency(&mut self, task: Uuid, dependency: Uuid) -> Result<(), SchedulerError> {
        let status = self.task(task)?.status;
        if !self.tasks.contains_key(&dependency) {
            return Err(SchedulerError::UnknownDependency { task, dependency });
        }
        if !(status.is_queueable() || status == TaskStatus::AwaitingApproval) {
            return Err(SchedulerError::NotAssignable { id: task, status });
        }
        if task == dependency || (self.config.detect_cycles && self.reaches(dependency, task)) {
            return Err(SchedulerError::CycleDetected { task, dependency });
        }
        if let Some(t) = self.tasks.get_mut(&task) {
            t.dependencies.insert(dependency);
            t.updated_at = Utc::now();
        }
        if !self.dependencies_met(task) {
            self.dequeue(task);
        }
        Ok(())
    }

    // -- Assignment --

    /// Hand a queued task to `worker`, or to the best match when `None`.
    ///
    /// Returns `Ok(None)` when no worker is suitable; the task stays queued.
    pub fn assign_task(
        &mut self,
        id: Uuid,
        worker: Option<&str>,
        registry: &mut Registry,
    ) -> Result<Option<WorkerId>, SchedulerError> {
        if !self.running {
            return Err(SchedulerError::NotRunning);
        }
        let task = self.task(id)?;
        if !task.status.is_queueable() {
            return Err(SchedulerError::NotAssignable { id, status: task.status });
        }
        if !self.dependencies_met(id) {
            return Err(SchedulerError::DependenciesUnsatisfied(id));
        }

        let worker_id = match worker {
            Some(w) if registry.contains(w) => w.to_string(),
            Some(w) => return Err(SchedulerError::WorkerNotFound(w.to_string())),
            None => {
                let constraints = MatchConstraints {
                    min_success_rate: Some(self.config.min_success_rate),
                    exclude: registry.ids_with_status(WorkerStatus::Busy),
                    ..Default::default()
                };
                match registry.find_best(
                    &task.required_capabilities,
                    &task.optional_capabilities,
                    &constraints,
                ) {
                    Some(w) => w,
                    None => {
                        debug!(task_id = %id, "no suitable worker, task stays queued");
                        return Ok(None);
                    }
                }
            }
        };

        self.dequeue(id);
        let now = Utc::now();
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(SchedulerError::TaskNotFound(id));
        };
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(worker_id.clone());
        task.assigned_at = Some(now);
        task.updated_at = now;
        let payload = TaskRequestPayload::from(&*task);
        let priority = MessagePriority::from(task.priority);
        self.active.insert(id, worker_id.clone());

        if let Err(e) = registry.acquire_slot(&worker_id) {
            warn!(error = %e, "acquire slot");
        }
        self.outbox.push(
            Message::new(
                MessageType::TaskRequest,
                Endpoint::System,
                Endpoint::worker(worker_id.as_str()),
                serde_json::to_value(payload).unwrap_or(Value::Null),
            )
            .with_priority(priority)
            .correlated_with(id),
        );
        if let Err(e) = registry.set_status(&worker_id, WorkerStatus::Busy) {
            warn!(error = %e, "mark worker busy");
        }

        info!(task_id = %id, worker_id = %worker_id, "task assigned");
        self.events.emit(
            EventType::TaskAssigned,
            SOURCE,
            json!({ "taskId": id, "agentId": worker_id }),
        );
        Ok(Some(worker_id))
    }

    /// Walk the queue in order attempting assignment. Returns the number of
    /// tasks handed out.
    pub fn process_queue(&mut self, registry: &mut Registry) -> usize {
        if !self.running {
            return 0;
        }
        let mut assigned = 0;
        for id in self.queued() {
            if !self.dependencies_met(id) {
                continue;
            }
            if self.try_assign(id, registry) {
                assigned += 1;
            }
        }
        assigned
    }

    // -- Worker reports --

    /// Worker accepted the task.
    pub fn start_task(&mut self, id: Uuid) -> Result<bool, SchedulerError> {
        let task = self.task(id)?;
        if task.status != TaskStatus::Assigned {
            debug!(task_id = %id, status = %task.status, "ignoring start for task not assigned");
            return Ok(false);
        }
        let now = Utc::now();
        if let Some(task) = self.tasks.get_mut(&id) {
            task.started_at = Some(now);
        }
        self.set_status(id, TaskStatus::InProgress);
        Ok(true)
    }

    /// Record an intermediate result without changing status.
    pub fn record_partial(&mut self, id: Uuid, result: Value) -> Result<bool, SchedulerError> {
        let task = self.task_mut(id)?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.output = Some(result);
        task.updated_at = Utc::now();
        Ok(true)
    }

    /// Mark a task completed. Returns `false` for tasks that already reached
    /// a terminal status; those reports are ignored.
    pub fn complete_task(
        &mut self,
        id: Uuid,
        output: Value,
        registry: &mut Registry,
    ) -> Result<bool, SchedulerError> {
        let task = self.task(id)?;
        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "ignoring completion for settled task");
            return Ok(false);
        }

        let now = Utc::now();
        let began = task.started_at.or(task.assigned_at).unwrap_or(task.created_at);
        let duration_ms = (now - began).num_milliseconds().max(0) as f64;

        self.dequeue(id);
        let holder = self.active.remove(&id);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Completed;
            task.output = Some(output.clone());
            task.completed_at = Some(now);
            task.updated_at = now;
        }

        self.total_processed += 1;
        let n = self.total_processed as f64;
        self.average_duration_ms = (self.average_duration_ms * (n - 1.0) + duration_ms) / n;

        if let Some(worker) = holder {
            self.release_worker_slot(&worker, Some((true, duration_ms)), registry);
        }

        info!(task_id = %id, duration_ms, "task completed");
        self.events.emit(
            EventType::TaskCompleted,
            SOURCE,
            json!({ "taskId": id, "durationMs": duration_ms }),
        );
        self.settled.push(SettledTask {
            task_id: id,
            settlement: Settlement::Completed(output),
        });

        self.enqueue_unblocked();
        self.process_queue(registry);
        Ok(true)
    }

    /// Record a failure. Retries while `retry_count < max_retries`, then the
    /// task fails for good. Returns `false` for already settled tasks.
    pub fn fail_task(
        &mut self,
        id: Uuid,
        error: impl Into<String>,
        registry: &mut Registry,
    ) -> Result<bool, SchedulerError> {
        let error = error.into();
        let task = self.task(id)?;
        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "ignoring failure for settled task");
            return Ok(false);
        }
        let retry = task.retry_count < task.max_retries;

        if let Some(worker) = self.active.remove(&id) {
            self.release_worker_slot(&worker, Some((false, 0.0)), registry);
        }
        let now = Utc::now();
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(SchedulerError::TaskNotFound(id));
        };
        task.error = Some(error.clone());
        task.assigned_to = None;
        task.updated_at = now;

        if retry {
            task.retry_count += 1;
            task.status = TaskStatus::Retrying;
            let attempt = task.retry_count;
            let max = task.max_retries;
            self.total_retried += 1;
            warn!(task_id = %id, attempt, max, error = %error, "task failed, retrying");
            if self.dependencies_met(id) {
                self.enqueue(id);
            }
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            self.dequeue(id);
            self.total_failed += 1;
            warn!(task_id = %id, error = %error, "task failed");
            self.events.emit(
                EventType::TaskFailed,
                SOURCE,
                json!({ "taskId": id, "error": error }),
            );
            self.settled.push(SettledTask {
                task_id: id,
                settlement: Settlement::Failed(error),
            });
        }
        Ok(true)
    }

    /// Drop a task from the queue and active map. Dependents are left alone.
    pub fn cancel_task(&mut self, id: Uuid, registry: &mut Registry) -> Result<bool, SchedulerError> {
        let task = self.task(id)?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        self.dequeue(id);
        if let Some(worker) = self.active.remove(&id) {
            self.release_worker_slot(&worker, None, registry);
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.completed_at = Some(Utc::now());
        }
        self.set_status(id, TaskStatus::Cancelled);
        self.total_cancelled += 1;
        info!(task_id = %id, "task cancelled");
        self.settled.push(SettledTask {
            task_id: id,
            settlement: Settlement::Cancelled,
        });
        Ok(true)
    }

    /// Worker declined the task: give the slot back and requeue without
    /// consuming a retry.
    pub fn reject_task(
        &mut self,
        id: Uuid,
        reason: &str,
        registry: &mut Registry,
    ) -> Result<bool, SchedulerError> {
        let task = self.task(id)?;
        if !task.status.holds_worker() {
            return Ok(false);
        }
        if let Some(worker) = self.active.remove(&id) {
            self.release_worker_slot(&worker, None, registry);
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.assigned_to = None;
            task.assigned_at = None;
            task.started_at = None;
        }
        self.set_status(id, TaskStatus::Pending);
        self.enqueue(id);
        info!(task_id = %id, reason, "task rejected by worker, requeued");
        Ok(true)
    }

    /// Resolve a task held for human approval.
    pub fn resolve_approval(
        &mut self,
        id: Uuid,
        approved: bool,
        registry: &mut Registry,
    ) -> Result<bool, SchedulerError> {
        if self.task(id)?.status != TaskStatus::AwaitingApproval {
            return Err(SchedulerError::NotAwaitingApproval(id));
        }
        if approved {
            self.set_status(id, TaskStatus::Approved);
            info!(task_id = %id, "task approved");
            if self.dependencies_met(id) {
                self.enqueue(id);
                self.try_assign(id, registry);
            }
        } else {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.completed_at = Some(Utc::now());
            }
            self.set_status(id, TaskStatus::Rejected);
            info!(task_id = %id, "task rejected by approver");
            self.settled.push(SettledTask {
                task_id: id,
                settlement: Settlement::Failed("approval rejected".into()),
            });
        }
        Ok(true)
    }

    /// Requeue every task held by `worker` without consuming retries. Used
    /// when a worker leaves the registry.
    pub fn release_worker(&mut self, worker: &str) -> Vec<Uuid> {
        let held: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, w)| w.as_str() == worker)
            .map(|(id, _)| *id)
            .collect();
        for id in &held {
            self.active.remove(id);
            if let Some(task) = self.tasks.get_mut(id) {
                task.assigned_to = None;
                task.assigned_at = None;
                task.started_at = None;
            }
            self.set_status(*id, TaskStatus::Pending);
            self.enqueue(*id);
        }
        if !held.is_empty() {
            info!(worker_id = %worker, count = held.len(), "requeued tasks of departed worker");
        }
        held
    }

    /// Fail tasks whose timeout elapsed since assignment. Returns the ids
    /// that were failed (and possibly retried).
    pub fn reap_overdue(&mut self, now: DateTime<Utc>, registry: &mut Registry) -> Vec<Uuid> {
        let overdue: Vec<(Uuid, u64)> = self
            .tasks
            .values()
            .filter(|t| t.status.holds_worker())
            .filter_map(|t| {
                let timeout = t.timeout_ms?;
                let since = t.assigned_at?;
                ((now - since).num_milliseconds() >= timeout as i64).then_some((t.id, timeout))
            })
            .collect();
        for (id, timeout) in &overdue {
            if let Err(e) = self.fail_task(*id, format!("timed out after {timeout}ms"), registry) {
                warn!(task_id = %id, error = %e, "reap overdue task");
            }
        }
        overdue.into_iter().map(|(id, _)| id).collect()
    }

    // -- Dependency graph --

    /// Every dependency cycle, each listed once as the ids along the cycle.
    pub fn find_cycles(&self) -> Vec<Vec<Uuid>> {
        let mut state: AHashMap<Uuid, u8> = AHashMap::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        let mut ids: Vec<Uuid> = self.tasks.keys().copied().collect();
        ids.sort_by_key(|id| self.order.get(id).copied().unwrap_or(u64::MAX));
        for id in ids {
            self.dfs_cycles(id, &mut state, &mut stack, &mut cycles);
        }
        cycles
    }

    fn dfs_cycles(
        &self,
        id: Uuid,
        state: &mut AHashMap<Uuid, u8>,
        stack: &mut Vec<Uuid>,
        cycles: &mut Vec<Vec<Uuid>>,
    ) {
        match state.get(&id) {
            Some(1) => {
                // back edge
                if let Some(pos) = stack.iter().position(|s| *s == id) {
                    cycles.push(stack[pos..].to_vec());
                }
                return;
            }
            Some(2) => return,
            _ => {}
        }
        state.insert(id, 1);
        stack.push(id);
        if let Some(task) = self.tasks.get(&id) {
            for dep in &task.dependencies {
                self.dfs_cycles(*dep, state, stack, cycles);
            }
        }
        stack.pop();
        state.insert(id, 2);
    }

    /// Whether `to` is reachable from `from` along dependency edges.
    fn reaches(&self, from: Uuid, to: Uuid) -> bool {
        let mut seen = AHashSet::new();
        let mut frontier = vec![from];
        while let Some(id) = frontier.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(&id) {
                frontier.extend(task.dependencies.iter().copied());
            }
        }
        false
    }

    pub fn dependencies_met(&self, id: Uuid) -> bool {
        self.tasks.get(&id).is_some_and(|task| {
            task.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
        })
    }

    // -- Stats --

    pub fn stats(&self) -> SchedulerStats {
        let finished = self.total_failed + self.total_processed;
        SchedulerStats {
            running: self.running,
            total_created: self.total_created,
            total_processed: self.total_processed,
            total_failed: self.total_failed,
            total_cancelled: self.total_cancelled,
            total_retried: self.total_retried,
            queue_length: self.queue.len(),
            active_tasks: self.active.len(),
            average_duration_ms: self.average_duration_ms,
            error_rate: if finished == 0 {
                0.0
            } else {
                self.total_failed as f64 / finished as f64
            },
        }
    }

    // -- Internals --

    fn task(&self, id: Uuid) -> Result<&Task, SchedulerError> {
        self.tasks.get(&id).ok_or(SchedulerError::TaskNotFound(id))
    }

    fn task_mut(&mut self, id: Uuid) -> Result<&mut Task, SchedulerError> {
        self.tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))
    }

    fn set_status(&mut self, id: Uuid, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = status;
            task.updated_at = Utc::now();
        }
    }

    fn queue_key(&self, id: Uuid) -> Option<QueueKey> {
        let task = self.tasks.get(&id)?;
        let seq = self.order.get(&id).copied()?;
        Some((Reverse(task.priority), seq, id))
    }

    fn enqueue(&mut self, id: Uuid) {
        if let Some(key) = self.queue_key(id) {
            self.queue.insert(key);
        }
    }

    fn dequeue(&mut self, id: Uuid) {
        if let Some(key) = self.queue_key(id) {
            self.queue.remove(&key);
        }
    }

    fn is_queued(&self, id: Uuid) -> bool {
        self.queue_key(id).is_some_and(|key| self.queue.contains(&key))
    }

    /// Queue every queueable task whose dependencies are now all complete.
    fn enqueue_unblocked(&mut self) {
        let ready: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.status.is_queueable() && !t.dependencies.is_empty())
            .map(|t| t.id)
            .filter(|id| !self.is_queued(*id) && self.dependencies_met(*id))
            .collect();
        for id in ready {
            debug!(task_id = %id, "dependencies satisfied, queued");
            self.enqueue(id);
        }
    }

    fn try_assign(&mut self, id: Uuid, registry: &mut Registry) -> bool {
        if !self.running {
            return false;
        }
        match self.assign_task(id, None, registry) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(task_id = %id, error = %e, "assignment attempt failed");
                false
            }
        }
    }

    /// Give back a worker slot, optionally folding in the task outcome, and
    /// return a busy worker to idle when it holds nothing else.
    fn release_worker_slot(
        &mut self,
        worker: &str,
        outcome: Option<(bool, f64)>,
        registry: &mut Registry,
    ) {
        if let Err(e) = registry.release_slot(worker) {
            debug!(worker_id = %worker, error = %e, "release slot");
            return;
        }
        if let Some((success, duration)) = outcome {
            let duration = success.then_some(duration);
            if let Err(e) = registry.record_outcome(worker, success, duration) {
                warn!(error = %e, "record worker outcome");
            }
        }
        // Keep any status the caller set while the task ran.
        let holds_other = self.active.values().any(|w| w == worker);
        let marked_busy = registry
            .get(worker)
            .is_some_and(|w| w.status == WorkerStatus::Busy);
        if !holds_other && marked_busy {
            if let Err(e) = registry.set_status(worker, WorkerStatus::Idle) {
                warn!(error = %e, "idle worker");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
