use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sy_core::config::RegistryConfig;
use sy_core::events::EventType;
use sy_core::snapshot::RegistryStats;
use sy_core::types::{Worker, WorkerId, WorkerStatus};
use tracing::{debug, info, warn};

use crate::events::EventBus;

const SOURCE: &str = "registry";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("worker not found: `{0}`")]
    WorkerNotFound(String),
    #[error("duplicate worker id: `{0}`")]
    DuplicateWorker(String),
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// A ranked candidate returned by [`Registry::find_matches`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMatch {
    pub worker_id: WorkerId,
    pub score: f64,
}

/// Post-filters applied by [`Registry::find_best`].
#[derive(Debug, Clone, Default)]
pub struct MatchConstraints {
    pub max_response_time_ms: Option<f64>,
    pub min_success_rate: Option<f64>,
    pub exclude: AHashSet<WorkerId>,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Workers that were sent a probe this sweep.
    pub probed: Vec<WorkerId>,
    /// Workers whose probe went unanswered and are now in `Error`.
    pub failed: Vec<WorkerId>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Catalogue of workers with capability and specialization indexes.
#[derive(Debug)]
pub struct Registry {
    config: RegistryConfig,
    workers: AHashMap<WorkerId, Worker>,
    by_capability: AHashMap<String, AHashSet<WorkerId>>,
    by_specialization: AHashMap<String, AHashSet<WorkerId>>,
    events: EventBus,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default(), EventBus::new())
    }
}

impl Registry {
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        Self {
            config,
            workers: AHashMap::new(),
            by_capability: AHashMap::new(),
            by_specialization: AHashMap::new(),
            events,
        }
    }

    /// Register a worker. Returns error if the id already exists.
    pub fn register(&mut self, mut worker: Worker) -> Result<(), RegistryError> {
        if self.workers.contains_key(&worker.id) {
            return Err(RegistryError::DuplicateWorker(worker.id));
        }
        worker.last_activity = Utc::now();
        for cap in &worker.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(worker.id.clone());
        }
        for spec in &worker.specializations {
            self.by_specialization
                .entry(spec.clone())
                .or_default()
                .insert(worker.id.clone());
        }
        info!(worker_id = %worker.id, kind = %worker.kind, capabilities = worker.capabilities.len(), "registered worker");
        self.events.emit(
            EventType::AgentRegistered,
            SOURCE,
            json!({ "agentId": worker.id, "capabilities": worker.capabilities }),
        );
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    /// Remove a worker and drop it from both indexes.
    pub fn unregister(&mut self, id: &str) -> Result<Worker, RegistryError> {
        let worker = self
            .workers
            .remove(id)
            .ok_or_else(|| RegistryError::WorkerNotFound(id.to_string()))?;
        unindex(&mut self.by_capability, &worker.capabilities, id);
        unindex(&mut self.by_specialization, &worker.specializations, id);
        info!(worker_id = %id, "unregistered worker");
        self.events
            .emit(EventType::AgentUnregistered, SOURCE, json!({ "agentId": id }));
        Ok(worker)
    }

    pub fn get(&self, id: &str) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Ids of workers carrying `specialization`.
    pub fn with_specialization(&self, specialization: &str) -> Vec<WorkerId> {
        self.by_specialization
            .get(specialization)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of workers currently in `status`.
    pub fn ids_with_status(&self, status: WorkerStatus) -> AHashSet<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.status == status)
            .map(|w| w.id.clone())
            .collect()
    }

    // -- Matching --

    /// Rank workers able to serve `required`, best first.
    ///
    /// Candidates hold every required capability (any worker when `required`
    /// is empty) and are neither offline nor errored. Ordering among equal
    /// scores is unspecified.
    pub fn find_matches(&self, required: &[String], optional: &[String]) -> Vec<WorkerMatch> {
        let candidates: Vec<&Worker> = if required.is_empty() {
            self.workers.values().collect()
        } else {
            let mut sets = required.iter().map(|cap| self.by_capability.get(cap));
            let Some(Some(first)) = sets.next() else {
                return Vec::new();
            };
            let mut ids: AHashSet<&WorkerId> = first.iter().collect();
            for set in sets {
                match set {
                    Some(set) => ids.retain(|id| set.contains(*id)),
                    None => return Vec::new(),
                }
            }
            ids.into_iter().filter_map(|id| self.workers.get(id)).collect()
        };

        let mut matches: Vec<WorkerMatch> = candidates
            .into_iter()
            .filter(|w| w.status.accepts_work())
            .map(|w| WorkerMatch {
                worker_id: w.id.clone(),
                score: score(w, required, optional),
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }

    /// Top-ranked worker surviving the post-filters, if any.
    pub fn find_best(
        &self,
        required: &[String],
        optional: &[String],
        constraints: &MatchConstraints,
    ) -> Option<WorkerId> {
        self.find_matches(required, optional)
            .into_iter()
            .find(|m| {
                if constraints.exclude.contains(&m.worker_id) {
                    return false;
                }
                let Some(worker) = self.workers.get(&m.worker_id) else {
                    return false;
                };
                let fast_enough = constraints
                    .max_response_time_ms
                    .is_none_or(|max| worker.metrics.average_response_time_ms <= max);
                let reliable = constraints
                    .min_success_rate
                    .is_none_or(|min| worker.metrics.success_rate >= min);
                fast_enough && reliable
            })
            .map(|m| m.worker_id)
    }

    // -- Utilization --

    pub fn acquire_slot(&mut self, id: &str) -> Result<u32, RegistryError> {
        let worker = self.worker_mut(id)?;
        worker.current_load += 1;
        worker.last_activity = Utc::now();
        Ok(worker.current_load)
    }

    /// Release one slot; returns the remaining load.
    pub fn release_slot(&mut self, id: &str) -> Result<u32, RegistryError> {
        let worker = self.worker_mut(id)?;
        worker.current_load = worker.current_load.saturating_sub(1);
        worker.last_activity = Utc::now();
        Ok(worker.current_load)
    }

    /// Set a worker's status, publishing a change event when it differs.
    pub fn set_status(&mut self, id: &str, status: WorkerStatus) -> Result<(), RegistryError> {
        let worker = self.worker_mut(id)?;
        let previous = worker.status;
        if previous == status {
            return Ok(());
        }
        worker.status = status;
        debug!(worker_id = %id, from = %previous, to = %status, "worker status changed");
        self.events.emit(
            EventType::AgentStatusChanged,
            SOURCE,
            json!({ "agentId": id, "from": previous, "to": status }),
        );
        Ok(())
    }

    /// Fold a finished task into the worker's success rate and mean response
    /// time.
    pub fn record_outcome(
        &mut self,
        id: &str,
        success: bool,
        duration_ms: Option<f64>,
    ) -> Result<(), RegistryError> {
        let worker = self.worker_mut(id)?;
        let m = &mut worker.metrics;
        if success {
            m.tasks_completed += 1;
        } else {
            m.tasks_failed += 1;
        }
        let finished = m.tasks_completed + m.tasks_failed;
        m.success_rate = m.tasks_completed as f64 / finished as f64;
        if let Some(d) = duration_ms {
            let n = finished as f64;
            m.average_response_time_ms = (m.average_response_time_ms * (n - 1.0) + d) / n;
        }
        Ok(())
    }

    // -- Liveness --

    /// Store a heartbeat and clear any outstanding probe. An errored worker
    /// that heartbeats again goes back to `Idle`.
    pub fn record_heartbeat(&mut self, id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        let worker = self.worker_mut(id)?;
        worker.last_heartbeat = Some(at);
        worker.probe_sent_at = None;
        let recovered = worker.status == WorkerStatus::Error;
        if recovered {
            info!(worker_id = %id, "worker recovered after heartbeat");
            self.set_status(id, WorkerStatus::Idle)?;
        }
        Ok(())
    }

    /// Two-phase liveness check.
    ///
    /// Idle workers quiet for longer than `idle_probe_threshold_ms` are
    /// marked as probed (the caller sends the actual probe). Workers whose
    /// probe is older than `probe_timeout_ms` are moved to `Error`.
    pub fn health_sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let idle_threshold = Duration::milliseconds(self.config.idle_probe_threshold_ms as i64);
        let probe_timeout = Duration::milliseconds(self.config.probe_timeout_ms as i64);
        let mut report = SweepReport::default();

        for worker in self.workers.values_mut() {
            match worker.probe_sent_at {
                Some(sent) if now - sent >= probe_timeout => {
                    worker.probe_sent_at = None;
                    report.failed.push(worker.id.clone());
                }
                Some(_) => {}
                None if worker.status == WorkerStatus::Idle => {
                    let last_seen = worker
                        .last_heartbeat
                        .map_or(worker.last_activity, |hb| hb.max(worker.last_activity));
                    if now - last_seen >= idle_threshold {
                        worker.probe_sent_at = Some(now);
                        report.probed.push(worker.id.clone());
                    }
                }
                None => {}
            }
        }

        for id in &report.failed {
            warn!(worker_id = %id, "liveness probe unanswered");
            if let Err(e) = self.set_status(id, WorkerStatus::Error) {
                warn!(error = %e, "failed to flag unresponsive worker");
            }
        }
        if !report.probed.is_empty() {
            debug!(count = report.probed.len(), "probing idle workers");
        }
        report
    }

    // -- Stats --

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_workers: self.workers.len(),
            distinct_capabilities: self.by_capability.len(),
            ..Default::default()
        };
        for w in self.workers.values() {
            *stats.by_status.entry(w.status).or_default() += 1;
        }
        if !self.workers.is_empty() {
            let n = self.workers.len() as f64;
            stats.average_success_rate =
                self.workers.values().map(|w| w.metrics.success_rate).sum::<f64>() / n;
            stats.average_response_time_ms = self
                .workers
                .values()
                .map(|w| w.metrics.average_response_time_ms)
                .sum::<f64>()
                / n;
        }
        stats
    }

    fn worker_mut(&mut self, id: &str) -> Result<&mut Worker, RegistryError> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::WorkerNotFound(id.to_string()))
    }
}

fn unindex<'a>(
    index: &mut AHashMap<String, AHashSet<WorkerId>>,
    keys: impl IntoIterator<Item = &'a String>,
    id: &str,
) {
    for key in keys {
        if let Some(ids) = index.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }
}

fn score(worker: &Worker, required: &[String], optional: &[String]) -> f64 {
    let required_hits = required.iter().filter(|c| worker.has_capability(c)).count() as f64;
    let optional_hits = optional.iter().filter(|c| worker.has_capability(c)).count() as f64;
    let base = 10.0 * required_hits + 5.0 * optional_hits + 10.0 * worker.metrics.success_rate
        - worker.metrics.average_response_time_ms / 1000.0;
    base * worker.availability() * worker.priority.score_multiplier()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
