use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sy_core::config::TelemetryConfig;
use sy_core::snapshot::{RegistryStats, SchedulerStats, SystemSnapshot};
use sysinfo::System;

/// Share of workers that must be idle or busy for the registry to be healthy.
const WORKER_RATIO_HEALTHY: f64 = 0.8;
/// Below this share the registry is unhealthy.
const WORKER_RATIO_DEGRADED: f64 = 0.5;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub metadata: Value,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    fn new(component: &str, status: HealthStatus, message: impl Into<String>, metadata: Value) -> Self {
        Self {
            component: component.to_string(),
            status,
            message: message.into(),
            metadata,
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: Vec<HealthCheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn component(&self, name: &str) -> Option<&HealthCheckResult> {
        self.components.iter().find(|c| c.component == name)
    }
}

/// Unhealthy if any component is unhealthy, degraded if more than one is
/// degraded, otherwise healthy.
pub fn aggregate(results: &[HealthCheckResult]) -> HealthStatus {
    if results.iter().any(|r| r.status == HealthStatus::Unhealthy) {
        return HealthStatus::Unhealthy;
    }
    let degraded = results
        .iter()
        .filter(|r| r.status == HealthStatus::Degraded)
        .count();
    if degraded > 1 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// ---------------------------------------------------------------------------
// Resource probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of host resource usage.
pub trait ResourceProbe: Send {
    /// `None` when usage cannot be read.
    fn sample(&mut self) -> Option<ResourceUsage>;
}

/// Reads global CPU and memory usage through `sysinfo`.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> Option<ResourceUsage> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        Some(ResourceUsage {
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            memory_percent: self.system.used_memory() as f64 / total as f64 * 100.0,
        })
    }
}

// ---------------------------------------------------------------------------
// HealthChecker
// ---------------------------------------------------------------------------

/// Runs the component checks against a [`SystemSnapshot`].
pub struct HealthChecker {
    config: TelemetryConfig,
    probe: Box<dyn ResourceProbe>,
    last_usage: Option<ResourceUsage>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(config: TelemetryConfig, probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            config,
            probe,
            last_usage: None,
        }
    }

    pub fn with_sysinfo(config: TelemetryConfig) -> Self {
        Self::new(config, Box::new(SysinfoProbe::new()))
    }

    /// Resource usage read by the most recent [`check`](Self::check).
    pub fn last_usage(&self) -> Option<ResourceUsage> {
        self.last_usage
    }

    pub fn check(&mut self, snapshot: &SystemSnapshot) -> SystemHealth {
        let usage = self.probe.sample();
        self.last_usage = usage;
        let components = vec![
            check_scheduler(&snapshot.scheduler, &self.config),
            check_registry(&snapshot.registry),
            check_queue(snapshot.combined_queue_depth(), &self.config),
            check_resources(usage, &self.config),
        ];
        SystemHealth {
            status: aggregate(&components),
            components,
            checked_at: Utc::now(),
        }
    }
}

pub fn check_scheduler(stats: &SchedulerStats, config: &TelemetryConfig) -> HealthCheckResult {
    let metadata = json!({
        "running": stats.running,
        "activeTasks": stats.active_tasks,
        "queueLength": stats.queue_length,
        "errorRate": stats.error_rate,
    });
    let (status, message) = if !stats.running {
        (HealthStatus::Unhealthy, "scheduler is not running".to_string())
    } else if stats.error_rate > config.error_rate_degraded {
        (
            HealthStatus::Degraded,
            format!("error rate {:.1}% above threshold", stats.error_rate * 100.0),
        )
    } else {
        (HealthStatus::Healthy, "scheduler running".to_string())
    };
    HealthCheckResult::new("scheduler", status, message, metadata)
}

pub fn check_registry(stats: &RegistryStats) -> HealthCheckResult {
    let healthy = stats.healthy_workers();
    let metadata = json!({
        "totalWorkers": stats.total_workers,
        "healthyWorkers": healthy,
    });
    let (status, message) = match stats.health_ratio() {
        None => (HealthStatus::Degraded, "no workers registered".to_string()),
        Some(ratio) => {
            let status = if ratio >= WORKER_RATIO_HEALTHY {
                HealthStatus::Healthy
            } else if ratio >= WORKER_RATIO_DEGRADED {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            };
            (status, format!("{healthy}/{} workers healthy", stats.total_workers))
        }
    };
    HealthCheckResult::new("registry", status, message, metadata)
}

pub fn check_queue(depth: usize, config: &TelemetryConfig) -> HealthCheckResult {
    let status = if depth > config.queue_depth_unhealthy {
        HealthStatus::Unhealthy
    } else if depth > config.queue_depth_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    HealthCheckResult::new(
        "queue",
        status,
        format!("{depth} items queued"),
        json!({ "depth": depth }),
    )
}

pub fn check_resources(usage: Option<ResourceUsage>, config: &TelemetryConfig) -> HealthCheckResult {
    let Some(usage) = usage else {
        return HealthCheckResult::new(
            "resources",
            HealthStatus::Degraded,
            "resource usage unavailable",
            Value::Null,
        );
    };
    let status = if usage.cpu_percent > config.cpu_unhealthy_percent
        || usage.memory_percent > config.memory_unhealthy_percent
    {
        HealthStatus::Unhealthy
    } else if usage.cpu_percent > config.cpu_degraded_percent
        || usage.memory_percent > config.memory_degraded_percent
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    HealthCheckResult::new(
        "resources",
        status,
        format!("cpu {:.1}%, memory {:.1}%", usage.cpu_percent, usage.memory_percent),
        json!({ "cpuPercent": usage.cpu_percent, "memoryPercent": usage.memory_percent }),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
