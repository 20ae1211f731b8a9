//! Task lifecycle through the engine: assignment, retries, dependencies,
//! approvals and the reaper.

use chrono::{Duration, Utc};
use serde_json::json;
use sy_core::events::EventType;
use sy_core::messages::{
    ApprovalResponsePayload, ApprovalTarget, Endpoint, Message, MessageType, TaskRequestPayload,
};
use sy_core::types::{Priority, TaskSpec, TaskStatus, Worker, WorkerStatus};
use sy_engine::scheduler::SchedulerError;
use sy_engine::{Engine, EngineError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn worker(id: &str, caps: &[&str]) -> Worker {
    Worker::new(id, format!("{id} worker")).with_capabilities(caps.iter().copied())
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

#[test]
fn capable_worker_receives_new_task() {
    let mut engine = Engine::default();
    let events = engine.subscribe_events();
    let mailbox = engine.subscribe(Endpoint::worker("w"));
    engine.register_worker(worker("w", &["X"])).unwrap();

    let task = engine.create_task(TaskSpec::new("analyze").requires(["X"])).unwrap();

    let t = engine.task(task).unwrap();
    assert_eq!(t.status, TaskStatus::Assigned);
    assert_eq!(t.assigned_to.as_deref(), Some("w"));
    assert_eq!(engine.registry().get("w").unwrap().status, WorkerStatus::Busy);
    assert!(events.try_iter().any(|e| e.event_type == EventType::TaskAssigned));

    engine.tick(Utc::now());
    let request = mailbox.try_recv().unwrap();
    assert_eq!(request.message_type, MessageType::TaskRequest);
    assert_eq!(request.correlation_id, Some(task));
    let payload: TaskRequestPayload = serde_json::from_value(request.payload).unwrap();
    assert_eq!(payload.task_id, task);
    assert_eq!(payload.requirements, vec!["X"]);
}

#[test]
fn task_without_capable_worker_stays_queued() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w", &["python"])).unwrap();
    let task = engine.create_task(TaskSpec::new("build").requires(["rust"])).unwrap();
    assert_eq!(engine.task(task).unwrap().status, TaskStatus::Pending);
    assert_eq!(engine.snapshot().scheduler.queue_length, 1);
}

#[test]
fn higher_priority_is_assigned_first() {
    let mut engine = Engine::default();
    let low = engine.create_task(TaskSpec::new("a").with_priority(Priority::Low)).unwrap();
    let critical = engine
        .create_task(TaskSpec::new("b").with_priority(Priority::Critical))
        .unwrap();
    engine.register_worker(worker("only", &[])).unwrap();
    assert_eq!(engine.task(critical).unwrap().status, TaskStatus::Assigned);
    assert_eq!(engine.task(low).unwrap().status, TaskStatus::Pending);
}

#[test]
fn explicit_assignment_to_unknown_worker_fails() {
    let mut engine = Engine::default();
    let task = engine.create_task(TaskSpec::new("x")).unwrap();
    let err = engine.assign_task(task, Some("ghost")).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Scheduler(SchedulerError::WorkerNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Retries and idempotence
// ---------------------------------------------------------------------------

#[test]
fn retries_are_bounded() {
    let mut engine = Engine::default();
    let task = engine.create_task(TaskSpec::new("flaky").with_max_retries(2)).unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        engine.fail_task(task, "boom").unwrap();
        seen.push(engine.task(task).unwrap().status);
    }
    assert_eq!(
        seen,
        vec![TaskStatus::Retrying, TaskStatus::Retrying, TaskStatus::Failed]
    );
    let stats = engine.snapshot().scheduler;
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_retried, 2);
    assert_eq!(engine.task(task).unwrap().retry_count, 2);
}

#[test]
fn retried_task_is_reassigned_on_tick() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w", &[])).unwrap();
    let task = engine.create_task(TaskSpec::new("flaky")).unwrap();
    engine.fail_task(task, "transient").unwrap();
    assert_eq!(engine.task(task).unwrap().status, TaskStatus::Retrying);
    assert_eq!(engine.registry().get("w").unwrap().status, WorkerStatus::Idle);

    let report = engine.tick(Utc::now());
    assert_eq!(report.assigned, 1);
    assert_eq!(engine.task(task).unwrap().status, TaskStatus::Assigned);
}

#[test]
fn completion_is_idempotent() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w", &[])).unwrap();
    let task = engine.create_task(TaskSpec::new("once")).unwrap();

    assert!(engine.complete_task(task, json!({"ok": true})).unwrap());
    assert!(!engine.complete_task(task, json!({"ok": false})).unwrap());
    assert!(!engine.fail_task(task, "late").unwrap());

    let t = engine.task(task).unwrap();
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.output, Some(json!({"ok": true})));
    let stats = engine.snapshot().scheduler;
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_failed, 0);
    let w = engine.registry().get("w").unwrap();
    assert_eq!(w.metrics.tasks_completed, 1);
    assert_eq!(w.status, WorkerStatus::Idle);
}

#[test]
fn cancelled_task_ignores_late_reports() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w", &[])).unwrap();
    let task = engine.create_task(TaskSpec::new("slow")).unwrap();
    assert!(engine.cancel_task(task).unwrap());
    assert!(!engine.complete_task(task, json!(1)).unwrap());
    assert_eq!(engine.task(task).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(engine.registry().get("w").unwrap().current_load, 0);
}

#[test]
fn settling_keeps_status_set_while_busy() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w", &["x"])).unwrap();
    let first = engine.create_task(TaskSpec::new("job").requires(["x"])).unwrap();
    assert_eq!(engine.registry().get("w").unwrap().status, WorkerStatus::Busy);

    engine.set_worker_status("w", WorkerStatus::Offline).unwrap();
    assert!(engine.complete_task(first, json!({})).unwrap());
    let w = engine.registry().get("w").unwrap();
    assert_eq!(w.status, WorkerStatus::Offline);
    assert_eq!(w.current_load, 0);

    // an offline worker is not handed the next task
    let second = engine.create_task(TaskSpec::new("job").requires(["x"])).unwrap();
    assert_eq!(engine.task(second).unwrap().status, TaskStatus::Pending);
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[test]
fn dependent_waits_for_dependency_to_complete() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w1", &[])).unwrap();
    engine.register_worker(worker("w2", &[])).unwrap();

    let first = engine.create_task(TaskSpec::new("fetch")).unwrap();
    let second = engine
        .create_task(TaskSpec::new("process").depends_on([first]))
        .unwrap();
    assert_eq!(engine.task(second).unwrap().status, TaskStatus::Pending);
    assert!(!engine.scheduler().queued().contains(&second));

    engine.complete_task(first, json!(null)).unwrap();
    let first_done = engine.task(first).unwrap().completed_at.unwrap();
    let t = engine.task(second).unwrap();
    assert_eq!(t.status, TaskStatus::Assigned);
    assert!(t.assigned_at.unwrap() >= first_done);
}

#[test]
fn failed_dependency_blocks_dependent() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w", &[])).unwrap();
    let first = engine.create_task(TaskSpec::new("a").with_max_retries(0)).unwrap();
    let second = engine.create_task(TaskSpec::new("b").depends_on([first])).unwrap();
    engine.fail_task(first, "fatal").unwrap();
    engine.tick(Utc::now());
    assert_eq!(engine.task(second).unwrap().status, TaskStatus::Pending);
}

#[test]
fn unknown_dependency_is_rejected() {
    let mut engine = Engine::default();
    let err = engine
        .create_task(TaskSpec::new("b").depends_on([uuid::Uuid::new_v4()]))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Scheduler(SchedulerError::UnknownDependency { .. })
    ));
    assert_eq!(engine.snapshot().scheduler.total_created, 0);
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

#[test]
fn task_approval_round_trip_over_messages() {
    let mut engine = Engine::default();
    let human = engine.subscribe(Endpoint::Human);
    engine.register_worker(worker("w", &[])).unwrap();

    let task = engine
        .create_task(TaskSpec::new("deploy").with_title("Deploy to prod").with_approval())
        .unwrap();
    assert_eq!(engine.task(task).unwrap().status, TaskStatus::AwaitingApproval);

    engine.tick(Utc::now());
    let request = human.try_recv().unwrap();
    assert_eq!(request.message_type, MessageType::HumanApprovalRequest);
    assert_eq!(request.payload["summary"], "Deploy to prod");

    let response = ApprovalResponsePayload {
        target: ApprovalTarget::Task { task_id: task },
        approved: true,
        approver: Some("ops".into()),
        comment: None,
    };
    let id = engine
        .send_message(Message::new(
            MessageType::HumanApprovalResponse,
            Endpoint::Human,
            Endpoint::System,
            serde_json::to_value(response).unwrap(),
        ))
        .unwrap();
    engine.process_message(id).unwrap();
    assert_eq!(engine.task(task).unwrap().status, TaskStatus::Assigned);
}

#[test]
fn rejected_approval_settles_task() {
    let mut engine = Engine::default();
    let task = engine.create_task(TaskSpec::new("deploy").with_approval()).unwrap();
    engine.resolve_task_approval(task, false).unwrap();
    assert_eq!(engine.task(task).unwrap().status, TaskStatus::Rejected);
    assert!(engine.resolve_task_approval(task, true).is_err());
}

// ---------------------------------------------------------------------------
// Reaper and liveness
// ---------------------------------------------------------------------------

#[test]
fn reaper_fails_overdue_task() {
    let mut engine = Engine::default();
    engine.register_worker(worker("w", &[])).unwrap();
    let task = engine
        .create_task(TaskSpec::new("slow").with_timeout_ms(1_000).with_max_retries(0))
        .unwrap();

    let early = engine.reap(Utc::now());
    assert!(early.timed_out_tasks.is_empty());

    let report = engine.reap(Utc::now() + Duration::seconds(5));
    assert_eq!(report.timed_out_tasks, vec![task]);
    let t = engine.task(task).unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(engine.registry().get("w").unwrap().status, WorkerStatus::Idle);
}

#[test]
fn unanswered_probe_flags_worker() {
    let mut engine = Engine::default();
    let mailbox = engine.subscribe(Endpoint::worker("w"));
    engine.register_worker(worker("w", &[])).unwrap();
    let later = Utc::now() + Duration::minutes(10);

    let report = engine.sweep_workers(later);
    assert_eq!(report.probed, vec!["w".to_string()]);
    engine.dispatch_pending(10);
    assert_eq!(mailbox.try_recv().unwrap().message_type, MessageType::Heartbeat);

    let report = engine.sweep_workers(later + Duration::minutes(1));
    assert_eq!(report.failed, vec!["w".to_string()]);
    assert_eq!(engine.registry().get("w").unwrap().status, WorkerStatus::Error);

    // a heartbeat brings it back
    let id = engine
        .send_message(Message::new(
            MessageType::Heartbeat,
            Endpoint::worker("w"),
            Endpoint::System,
            json!({}),
        ))
        .unwrap();
    engine.process_message(id).unwrap();
    assert_eq!(engine.registry().get("w").unwrap().status, WorkerStatus::Idle);
}
