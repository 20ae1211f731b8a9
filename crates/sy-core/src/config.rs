use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, usually loaded from `switchyard.toml`.
///
/// Every section and every field has a default, so an empty file is a valid
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.scheduler.validate()?;
        self.registry.validate()?;
        self.bus.validate()?;
        self.telemetry.validate()?;
        self.reaper.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn positive(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{name} must be greater than zero")));
    }
    Ok(())
}

fn unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Validation(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be `pretty` or `json`, got `{other}`"
            ))),
        }
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Workers below this success rate are skipped during assignment.
    #[serde(default)]
    pub min_success_rate: f64,
    /// Reject dependency edges that would close a cycle.
    #[serde(default)]
    pub detect_cycles: bool,
    #[serde(default = "default_queue_interval_ms")]
    pub queue_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            min_success_rate: 0.0,
            detect_cycles: false,
            queue_interval_ms: default_queue_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_interval("scheduler.min_success_rate", self.min_success_rate)?;
        positive("scheduler.queue_interval_ms", self.queue_interval_ms)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_queue_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub health_sweep_interval_ms: u64,
    /// Idle workers quiet for longer than this get a liveness probe.
    #[serde(default = "default_idle_probe_threshold_ms")]
    pub idle_probe_threshold_ms: u64,
    /// A probe unanswered for this long marks the worker as errored.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_sweep_interval_ms: default_sweep_interval_ms(),
            idle_probe_threshold_ms: default_idle_probe_threshold_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("registry.health_sweep_interval_ms", self.health_sweep_interval_ms)?;
        positive("registry.idle_probe_threshold_ms", self.idle_probe_threshold_ms)?;
        positive("registry.probe_timeout_ms", self.probe_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.health_sweep_interval_ms)
    }
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}
fn default_idle_probe_threshold_ms() -> u64 {
    300_000
}
fn default_probe_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_bus_tick_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound on urgent messages reprocessed per tick.
    #[serde(default = "default_urgent_batch")]
    pub urgent_batch: usize,
    /// Upper bound on queued messages delivered per tick.
    #[serde(default = "default_dispatch_batch")]
    pub dispatch_batch: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            tick_interval_ms: default_bus_tick_ms(),
            urgent_batch: default_urgent_batch(),
            dispatch_batch: default_dispatch_batch(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("bus.history_capacity", self.history_capacity as u64)?;
        positive("bus.tick_interval_ms", self.tick_interval_ms)?;
        positive("bus.dispatch_batch", self.dispatch_batch as u64)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_history_capacity() -> usize {
    1_000
}
fn default_bus_tick_ms() -> u64 {
    1_000
}
fn default_urgent_batch() -> usize {
    10
}
fn default_dispatch_batch() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    #[serde(default = "default_alert_interval_ms")]
    pub alert_interval_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Metric points older than this are pruned.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    #[serde(default = "default_queue_depth_degraded")]
    pub queue_depth_degraded: usize,
    #[serde(default = "default_queue_depth_unhealthy")]
    pub queue_depth_unhealthy: usize,
    #[serde(default = "default_error_rate_degraded")]
    pub error_rate_degraded: f64,
    #[serde(default = "default_cpu_degraded")]
    pub cpu_degraded_percent: f64,
    #[serde(default = "default_cpu_unhealthy")]
    pub cpu_unhealthy_percent: f64,
    #[serde(default = "default_memory_degraded")]
    pub memory_degraded_percent: f64,
    #[serde(default = "default_memory_unhealthy")]
    pub memory_unhealthy_percent: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_interval_ms: default_metrics_interval_ms(),
            alert_interval_ms: default_alert_interval_ms(),
            health_interval_ms: default_health_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            retention_ms: default_retention_ms(),
            queue_depth_degraded: default_queue_depth_degraded(),
            queue_depth_unhealthy: default_queue_depth_unhealthy(),
            error_rate_degraded: default_error_rate_degraded(),
            cpu_degraded_percent: default_cpu_degraded(),
            cpu_unhealthy_percent: default_cpu_unhealthy(),
            memory_degraded_percent: default_memory_degraded(),
            memory_unhealthy_percent: default_memory_unhealthy(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("telemetry.metrics_interval_ms", self.metrics_interval_ms)?;
        positive("telemetry.alert_interval_ms", self.alert_interval_ms)?;
        positive("telemetry.health_interval_ms", self.health_interval_ms)?;
        positive("telemetry.cleanup_interval_ms", self.cleanup_interval_ms)?;
        positive("telemetry.retention_ms", self.retention_ms)?;
        unit_interval("telemetry.error_rate_degraded", self.error_rate_degraded)?;
        if self.queue_depth_degraded > self.queue_depth_unhealthy {
            return Err(ConfigError::Validation(
                "telemetry.queue_depth_degraded must not exceed queue_depth_unhealthy".into(),
            ));
        }
        if self.cpu_degraded_percent > self.cpu_unhealthy_percent
            || self.memory_degraded_percent > self.memory_unhealthy_percent
        {
            return Err(ConfigError::Validation(
                "telemetry degraded thresholds must not exceed unhealthy thresholds".into(),
            ));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

fn default_metrics_interval_ms() -> u64 {
    5_000
}
fn default_alert_interval_ms() -> u64 {
    10_000
}
fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_cleanup_interval_ms() -> u64 {
    60_000
}
fn default_retention_ms() -> u64 {
    3_600_000
}
fn default_queue_depth_degraded() -> usize {
    100
}
fn default_queue_depth_unhealthy() -> usize {
    500
}
fn default_error_rate_degraded() -> f64 {
    0.1
}
fn default_cpu_degraded() -> f64 {
    80.0
}
fn default_cpu_unhealthy() -> f64 {
    95.0
}
fn default_memory_degraded() -> f64 {
    85.0
}
fn default_memory_unhealthy() -> f64 {
    95.0
}

/// Periodic pass that fails overdue tasks and expires stale approval gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reaper_interval_ms")]
    pub interval_ms: u64,
    /// Applied to approval gates whose node does not set `timeout_ms`.
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_reaper_interval_ms(),
            approval_timeout_ms: default_approval_timeout_ms(),
        }
    }
}

impl ReaperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("reaper.interval_ms", self.interval_ms)?;
        positive("reaper.approval_timeout_ms", self.approval_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_reaper_interval_ms() -> u64 {
    5_000
}
fn default_approval_timeout_ms() -> u64 {
    86_400_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    /// Serve `/metrics`, `/health` and `/api/stats`.
    #[serde(default = "default_true")]
    pub http_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            http_enabled: true,
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    9890
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.scheduler.default_max_retries, 3);
        assert_eq!(cfg.bus.history_capacity, 1000);
        assert!(cfg.reaper.enabled);
        assert!(!cfg.scheduler.detect_cycles);
    }

    #[test]
    fn rejects_zero_interval() {
        let mut cfg = Config::default();
        cfg.bus.tick_interval_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("bus.tick_interval_ms"));
    }

    #[test]
    fn rejects_out_of_range_rate() {
        let mut cfg = Config::default();
        cfg.scheduler.min_success_rate = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }
}
