use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sy_core::config::{Config, TelemetryConfig};
use sy_core::events::EventType;
use sy_core::snapshot::SystemSnapshot;
use sy_engine::{Engine, EventBus, TickReport};
use sy_telemetry::alerts::{Alert, AlertCondition, AlertManager, AlertNotification, CompareOp, Severity};
use sy_telemetry::health::{HealthChecker, ResourceProbe, SysinfoProbe, SystemHealth};
use sy_telemetry::metrics::{MetricStore, MetricsError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::sampler::{self, MetricSampler};
use crate::shutdown::{DrainResult, ShutdownSignal};

const SOURCE: &str = "daemon";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// DaemonState
// ---------------------------------------------------------------------------

/// Everything the loops and HTTP handlers share.
///
/// The engine is the single writer for orchestration state; every call goes
/// through its mutex. Lock order is engine before metrics.
pub struct DaemonState {
    pub engine: Mutex<Engine>,
    pub metrics: RwLock<MetricStore>,
    pub alerts: Mutex<AlertManager>,
    events: EventBus,
    sampler: Mutex<MetricSampler>,
    checker: Arc<Mutex<HealthChecker>>,
    last_health: RwLock<Option<SystemHealth>>,
}

impl DaemonState {
    pub fn new(config: &Config, probe: Box<dyn ResourceProbe>) -> Result<Self> {
        let engine = Engine::new(config);
        let events = engine.events().clone();
        let mut metrics = MetricStore::new();
        MetricSampler::register(&mut metrics).context("failed to register standard metrics")?;
        let mut alerts = AlertManager::new();
        for alert in default_alerts(&config.telemetry) {
            alerts.add_alert(alert);
        }
        Ok(Self {
            engine: Mutex::new(engine),
            metrics: RwLock::new(metrics),
            alerts: Mutex::new(alerts),
            events,
            sampler: Mutex::new(MetricSampler::new()),
            checker: Arc::new(Mutex::new(HealthChecker::new(config.telemetry.clone(), probe))),
            last_health: RwLock::new(None),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn snapshot(&self) -> SystemSnapshot {
        self.engine.lock().await.snapshot()
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.engine.lock().await.tick(now)
    }

    pub async fn process_queue(&self) -> usize {
        self.engine.lock().await.process_queue()
    }

    /// Record one snapshot into the metric store and announce it.
    pub async fn sample_metrics(&self, now: DateTime<Utc>) -> Result<(), MetricsError> {
        let snapshot = self.snapshot().await;
        {
            let mut store = self.metrics.write().await;
            self.sampler.lock().await.sample(&mut store, &snapshot, now)?;
        }
        self.events.emit(
            EventType::MetricsUpdated,
            SOURCE,
            json!({
                "queueLength": snapshot.scheduler.queue_length,
                "activeTasks": snapshot.scheduler.active_tasks,
                "workers": snapshot.registry.total_workers,
                "messageQueueDepth": snapshot.message_queue_depth,
            }),
        );
        Ok(())
    }

    pub async fn evaluate_alerts(&self, now: DateTime<Utc>) -> Vec<AlertNotification> {
        let store = self.metrics.read().await;
        self.alerts.lock().await.evaluate(&store, now)
    }

    /// Run every health check, keep the result and record resource gauges.
    ///
    /// The resource probe refreshes host statistics synchronously, so the
    /// checks run on the blocking pool.
    pub async fn check_health(&self) -> Result<SystemHealth, JoinError> {
        let snapshot = self.snapshot().await;
        let checker = self.checker.clone();
        let (health, usage) = tokio::task::spawn_blocking(move || {
            let mut checker = checker.blocking_lock();
            let health = checker.check(&snapshot);
            (health, checker.last_usage())
        })
        .await?;
        if let Some(usage) = usage {
            let mut store = self.metrics.write().await;
            if let Err(e) = MetricSampler::sample_resources(&mut store, usage, health.checked_at) {
                warn!(error = %e, "failed to record resource usage");
            }
        }
        *self.last_health.write().await = Some(health.clone());
        Ok(health)
    }

    pub async fn last_health(&self) -> Option<SystemHealth> {
        self.last_health.read().await.clone()
    }

    /// Drop metric points older than `retention`.
    pub async fn cleanup(&self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        self.metrics.write().await.prune(now, retention)
    }
}

/// Alerts installed at startup, sustained for one minute.
pub fn default_alerts(telemetry: &TelemetryConfig) -> Vec<Alert> {
    vec![
        Alert::new(
            "task-queue-backlog",
            Severity::Warning,
            AlertCondition::new(
                sampler::TASK_QUEUE_LENGTH,
                CompareOp::Gt,
                telemetry.queue_depth_degraded as f64,
            )
            .sustained_for(60_000),
        )
        .with_description("Task queue above the degraded threshold"),
        Alert::new(
            "task-error-rate",
            Severity::Error,
            AlertCondition::new(sampler::TASK_ERROR_RATE, CompareOp::Gt, telemetry.error_rate_degraded)
                .sustained_for(60_000),
        )
        .with_description("Failed share of finished tasks above threshold"),
        Alert::new(
            "message-queue-backlog",
            Severity::Warning,
            AlertCondition::new(
                sampler::MESSAGE_QUEUE_DEPTH,
                CompareOp::Gt,
                telemetry.queue_depth_degraded as f64,
            )
            .sustained_for(60_000),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The switchyard background daemon.
///
/// `start` spawns the maintenance loops and, when enabled, the HTTP server;
/// `stop` signals them and waits for the loops to drain.
pub struct Daemon {
    config: Config,
    state: Arc<DaemonState>,
    shutdown: ShutdownSignal,
    loops: Option<JoinHandle<()>>,
    http: Option<JoinHandle<()>>,
}

impl Daemon {
    /// A daemon that probes host resources through `sysinfo`.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_probe(config, Box::new(SysinfoProbe::new()))
    }

    pub fn with_probe(config: Config, probe: Box<dyn ResourceProbe>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let state = Arc::new(DaemonState::new(&config, probe)?);
        Ok(Self {
            config,
            state,
            shutdown: ShutdownSignal::new(),
            loops: None,
            http: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// A handle other tasks can use to request shutdown.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.loops.is_some()
    }

    /// Start the engine, the maintenance loops and the HTTP server.
    ///
    /// Returns the bound HTTP address, or `None` when HTTP is disabled.
    pub async fn start(&mut self) -> Result<Option<SocketAddr>> {
        if self.is_running() {
            warn!("daemon already running");
            return Ok(None);
        }
        if self.shutdown.is_shutting_down() {
            anyhow::bail!("daemon was stopped and cannot be restarted");
        }
        self.state.engine.lock().await.start();

        let mut addr = None;
        if self.config.daemon.http_enabled {
            let bind_addr = self.config.daemon.bind_addr();
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("failed to bind {bind_addr}"))?;
            let local = listener.local_addr()?;
            let router = crate::http::router(self.state.clone());
            let shutdown = self.shutdown.clone();
            self.http = Some(tokio::spawn(async move {
                let serve = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.triggered().await });
                if let Err(e) = serve.await {
                    error!(error = %e, "HTTP server error");
                }
            }));
            info!(addr = %local, "HTTP server listening");
            addr = Some(local);
        }

        let state = self.state.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        self.loops = Some(tokio::spawn(async move {
            run_loops(state, config, shutdown.clone()).await;
            shutdown.confirm_drained();
        }));

        info!(
            tick_ms = self.config.bus.tick_interval_ms,
            queue_ms = self.config.scheduler.queue_interval_ms,
            metrics_ms = self.config.telemetry.metrics_interval_ms,
            "daemon started"
        );
        Ok(addr)
    }

    /// Signal shutdown and wait for the loops and HTTP server to finish.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.trigger();
        let Some(loops) = self.loops.take() else {
            return Ok(());
        };
        if let DrainResult::Timeout { .. } = self.shutdown.wait_for_drain(1, DRAIN_TIMEOUT).await {
            loops.abort();
        }
        if let Err(e) = loops.await {
            if !e.is_cancelled() {
                return Err(e).context("maintenance loops panicked");
            }
        }
        if let Some(http) = self.http.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, http).await.is_err() {
                warn!("HTTP server did not stop in time");
            }
        }
        self.state.engine.lock().await.stop();
        info!("daemon stopped");
        Ok(())
    }

    /// Start, then block until the shutdown signal fires, then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.shutdown.triggered().await;
        self.stop().await
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn run_loops(state: Arc<DaemonState>, config: Config, shutdown: ShutdownSignal) {
    let telemetry = &config.telemetry;
    let retention = chrono::Duration::milliseconds(telemetry.retention_ms as i64);
    let mut tick_interval = tokio::time::interval(config.bus.tick_interval());
    let mut queue_interval = tokio::time::interval(config.scheduler.queue_interval());
    let mut metrics_interval = tokio::time::interval(Duration::from_millis(telemetry.metrics_interval_ms));
    let mut alert_interval = tokio::time::interval(Duration::from_millis(telemetry.alert_interval_ms));
    let mut health_interval = tokio::time::interval(Duration::from_millis(telemetry.health_interval_ms));
    let mut cleanup_interval = tokio::time::interval(Duration::from_millis(telemetry.cleanup_interval_ms));

    // The first tick of every interval fires immediately; let it, so that
    // metrics and health are populated right after start.
    let mut shutdown_rx = shutdown.subscribe();
    if shutdown.is_shutting_down() {
        return;
    }

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                let report = state.tick(Utc::now()).await;
                if report.expired_messages > 0 || report.assigned > 0 {
                    debug!(
                        expired = report.expired_messages,
                        urgent = report.urgent_reprocessed,
                        dispatched = report.dispatched,
                        assigned = report.assigned,
                        "engine tick"
                    );
                }
            }
            _ = queue_interval.tick() => {
                state.process_queue().await;
            }
            _ = metrics_interval.tick() => {
                if let Err(e) = state.sample_metrics(Utc::now()).await {
                    error!(error = %e, "metric sampling failed");
                }
            }
            _ = alert_interval.tick() => {
                state.evaluate_alerts(Utc::now()).await;
            }
            _ = health_interval.tick() => {
                match state.check_health().await {
                    Ok(health) => debug!(status = ?health.status, "health checked"),
                    Err(e) => error!(error = %e, "health check task failed"),
                }
            }
            _ = cleanup_interval.tick() => {
                let removed = state.cleanup(Utc::now(), retention).await;
                if removed > 0 {
                    info!(removed, "metric retention cleanup");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, stopping loops");
                break;
            }
        }
    }
}
