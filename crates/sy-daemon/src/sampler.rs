use chrono::{DateTime, Utc};
use sy_core::snapshot::{SchedulerStats, SystemSnapshot};
use sy_core::types::WorkerStatus;
use sy_telemetry::health::ResourceUsage;
use sy_telemetry::metrics::{Labels, MetricStore, MetricType, MetricsError};
use tracing::debug;

pub const TASKS_CREATED: &str = "sy_tasks_created_total";
pub const TASKS_COMPLETED: &str = "sy_tasks_completed_total";
pub const TASKS_FAILED: &str = "sy_tasks_failed_total";
pub const TASKS_CANCELLED: &str = "sy_tasks_cancelled_total";
pub const TASKS_RETRIED: &str = "sy_tasks_retried_total";
pub const TASK_QUEUE_LENGTH: &str = "sy_task_queue_length";
pub const TASKS_ACTIVE: &str = "sy_tasks_active";
pub const TASK_ERROR_RATE: &str = "sy_task_error_rate";
pub const TASK_DURATION: &str = "sy_task_duration_ms";
pub const WORKERS: &str = "sy_workers";
pub const WORKER_SUCCESS_RATE: &str = "sy_worker_success_rate";
pub const MESSAGE_QUEUE_DEPTH: &str = "sy_message_queue_depth";
pub const MESSAGE_HISTORY: &str = "sy_message_history_length";
pub const WORKFLOWS_ACTIVE: &str = "sy_workflow_executions_active";
pub const CPU_PERCENT: &str = "sy_cpu_usage_percent";
pub const MEMORY_PERCENT: &str = "sy_memory_usage_percent";

const STANDARD_METRICS: &[(&str, MetricType, &str)] = &[
    (TASKS_CREATED, MetricType::Counter, "Tasks created"),
    (TASKS_COMPLETED, MetricType::Counter, "Tasks completed"),
    (TASKS_FAILED, MetricType::Counter, "Tasks failed after exhausting retries"),
    (TASKS_CANCELLED, MetricType::Counter, "Tasks cancelled"),
    (TASKS_RETRIED, MetricType::Counter, "Task retries scheduled"),
    (TASK_QUEUE_LENGTH, MetricType::Gauge, "Tasks waiting for a worker"),
    (TASKS_ACTIVE, MetricType::Gauge, "Tasks assigned or in progress"),
    (TASK_ERROR_RATE, MetricType::Gauge, "Failed share of finished tasks"),
    (TASK_DURATION, MetricType::Gauge, "Mean completed task duration in milliseconds"),
    (WORKERS, MetricType::Gauge, "Registered workers by status"),
    (WORKER_SUCCESS_RATE, MetricType::Gauge, "Mean worker success rate"),
    (MESSAGE_QUEUE_DEPTH, MetricType::Gauge, "Messages waiting for dispatch"),
    (MESSAGE_HISTORY, MetricType::Gauge, "Messages kept in history"),
    (WORKFLOWS_ACTIVE, MetricType::Gauge, "Running or paused workflow executions"),
    (CPU_PERCENT, MetricType::Gauge, "Host CPU usage"),
    (MEMORY_PERCENT, MetricType::Gauge, "Host memory usage"),
];

const WORKER_STATUSES: [WorkerStatus; 6] = [
    WorkerStatus::Initializing,
    WorkerStatus::Idle,
    WorkerStatus::Busy,
    WorkerStatus::Error,
    WorkerStatus::Offline,
    WorkerStatus::Terminated,
];

/// Turns engine snapshots into metric points.
///
/// Scheduler totals are cumulative, so counters are advanced by the
/// difference from the previous sample.
#[derive(Debug, Default)]
pub struct MetricSampler {
    previous: SchedulerStats,
}

impl MetricSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(store: &mut MetricStore) -> Result<(), MetricsError> {
        for (name, metric_type, description) in STANDARD_METRICS {
            store.register(name, *metric_type, description)?;
        }
        Ok(())
    }

    pub fn sample(
        &mut self,
        store: &mut MetricStore,
        snapshot: &SystemSnapshot,
        at: DateTime<Utc>,
    ) -> Result<(), MetricsError> {
        let none = Labels::empty();
        let s = &snapshot.scheduler;
        let p = &self.previous;

        for (name, now, before) in [
            (TASKS_CREATED, s.total_created, p.total_created),
            (TASKS_COMPLETED, s.total_processed, p.total_processed),
            (TASKS_FAILED, s.total_failed, p.total_failed),
            (TASKS_CANCELLED, s.total_cancelled, p.total_cancelled),
            (TASKS_RETRIED, s.total_retried, p.total_retried),
        ] {
            store.increment_at(name, &none, now.saturating_sub(before) as f64, at)?;
        }

        store.set_gauge_at(TASK_QUEUE_LENGTH, &none, s.queue_length as f64, at)?;
        store.set_gauge_at(TASKS_ACTIVE, &none, s.active_tasks as f64, at)?;
        store.set_gauge_at(TASK_ERROR_RATE, &none, s.error_rate, at)?;
        store.set_gauge_at(TASK_DURATION, &none, s.average_duration_ms, at)?;

        for status in WORKER_STATUSES {
            let labels = Labels::new(&[("status", status.as_str())]);
            store.set_gauge_at(WORKERS, &labels, snapshot.registry.count(status) as f64, at)?;
        }
        store.set_gauge_at(WORKER_SUCCESS_RATE, &none, snapshot.registry.average_success_rate, at)?;
        store.set_gauge_at(MESSAGE_QUEUE_DEPTH, &none, snapshot.message_queue_depth as f64, at)?;
        store.set_gauge_at(MESSAGE_HISTORY, &none, snapshot.message_history_len as f64, at)?;
        store.set_gauge_at(WORKFLOWS_ACTIVE, &none, snapshot.active_executions as f64, at)?;

        self.previous = s.clone();
        debug!(queue = s.queue_length, active = s.active_tasks, "metrics sampled");
        Ok(())
    }

    pub fn sample_resources(
        store: &mut MetricStore,
        usage: ResourceUsage,
        at: DateTime<Utc>,
    ) -> Result<(), MetricsError> {
        let none = Labels::empty();
        store.set_gauge_at(CPU_PERCENT, &none, usage.cpu_percent, at)?;
        store.set_gauge_at(MEMORY_PERCENT, &none, usage.memory_percent, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sy_core::snapshot::RegistryStats;

    fn snapshot(created: u64, failed: u64) -> SystemSnapshot {
        let mut registry = RegistryStats {
            total_workers: 2,
            ..Default::default()
        };
        registry.by_status.insert(WorkerStatus::Idle, 2);
        SystemSnapshot {
            timestamp: Utc::now(),
            scheduler: SchedulerStats {
                running: true,
                total_created: created,
                total_failed: failed,
                queue_length: 4,
                ..Default::default()
            },
            registry,
            message_queue_depth: 1,
            message_history_len: 9,
            active_executions: 0,
        }
    }

    #[test]
    fn counters_follow_cumulative_totals() {
        let mut store = MetricStore::new();
        MetricSampler::register(&mut store).unwrap();
        let mut sampler = MetricSampler::new();

        sampler.sample(&mut store, &snapshot(5, 1), Utc::now()).unwrap();
        sampler.sample(&mut store, &snapshot(8, 1), Utc::now()).unwrap();

        assert_eq!(store.latest(TASKS_CREATED, &Labels::empty()), Some(8.0));
        assert_eq!(store.latest(TASKS_FAILED, &Labels::empty()), Some(1.0));
        assert_eq!(store.latest(TASK_QUEUE_LENGTH, &Labels::empty()), Some(4.0));
        assert_eq!(
            store.latest(WORKERS, &Labels::new(&[("status", "idle")])),
            Some(2.0)
        );
        assert_eq!(
            store.latest(WORKERS, &Labels::new(&[("status", "error")])),
            Some(0.0)
        );
    }

    #[test]
    fn sampling_requires_registration() {
        let mut store = MetricStore::new();
        let err = MetricSampler::new()
            .sample(&mut store, &snapshot(1, 0), Utc::now())
            .unwrap_err();
        assert_eq!(err, MetricsError::NotRegistered(TASKS_CREATED.into()));
    }
}
