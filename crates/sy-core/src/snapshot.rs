//! Point-in-time views of engine state. The telemetry layer samples these
//! instead of reaching into component internals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::WorkerStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub total_created: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retried: u64,
    pub queue_length: usize,
    pub active_tasks: usize,
    /// Running mean of completed task durations, milliseconds.
    pub average_duration_ms: f64,
    /// `failed / (failed + processed)`, 0 when nothing has finished.
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub by_status: BTreeMap<WorkerStatus, usize>,
    pub distinct_capabilities: usize,
    pub average_success_rate: f64,
    pub average_response_time_ms: f64,
}

impl RegistryStats {
    pub fn count(&self, status: WorkerStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Workers that can take work: idle plus busy.
    pub fn healthy_workers(&self) -> usize {
        self.count(WorkerStatus::Idle) + self.count(WorkerStatus::Busy)
    }

    /// `healthy / total`, or `None` with no workers registered.
    pub fn health_ratio(&self) -> Option<f64> {
        if self.total_workers == 0 {
            None
        } else {
            Some(self.healthy_workers() as f64 / self.total_workers as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub scheduler: SchedulerStats,
    pub registry: RegistryStats,
    pub message_queue_depth: usize,
    pub message_history_len: usize,
    pub active_executions: usize,
}

impl SystemSnapshot {
    /// Task queue plus message queue.
    pub fn combined_queue_depth(&self) -> usize {
        self.scheduler.queue_length + self.message_queue_depth
    }
}
