//! Daemon lifecycle, background loops and HTTP endpoints.

use std::io::Write;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};
use sy_core::config::Config;
use sy_core::events::EventType;
use sy_core::types::{TaskSpec, Worker};
use sy_daemon::sampler;
use sy_daemon::{Daemon, DaemonState};
use sy_telemetry::health::{HealthStatus, ResourceProbe, ResourceUsage};
use sy_telemetry::metrics::Labels;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct QuietHost;

impl ResourceProbe for QuietHost {
    fn sample(&mut self) -> Option<ResourceUsage> {
        Some(ResourceUsage {
            cpu_percent: 5.0,
            memory_percent: 30.0,
        })
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.daemon.port = 0;
    config.bus.tick_interval_ms = 10;
    config.scheduler.queue_interval_ms = 10;
    config.telemetry.metrics_interval_ms = 10;
    config.telemetry.alert_interval_ms = 10;
    config.telemetry.health_interval_ms = 10;
    config.telemetry.cleanup_interval_ms = 50;
    config
}

fn daemon(config: Config) -> Daemon {
    Daemon::with_probe(config, Box::new(QuietHost)).unwrap()
}

async fn get(state: &std::sync::Arc<DaemonState>, uri: &str) -> (StatusCode, String) {
    let app = sy_daemon::http::router(state.clone());
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_and_stop() {
    let mut daemon = daemon(fast_config());
    let addr = daemon.start().await.unwrap();
    assert!(addr.is_some_and(|a| a.port() != 0));
    assert!(daemon.is_running());
    assert!(daemon.state().snapshot().await.scheduler.running);

    daemon.stop().await.unwrap();
    assert!(!daemon.is_running());
    assert!(!daemon.state().snapshot().await.scheduler.running);
    // stopping twice is harmless, restarting is not allowed
    daemon.stop().await.unwrap();
    assert!(daemon.start().await.is_err());
}

#[tokio::test]
async fn run_returns_after_shutdown_signal() {
    let mut config = fast_config();
    config.daemon.http_enabled = false;
    let mut daemon = daemon(config);
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
    });
    tokio::time::timeout(Duration::from_secs(5), daemon.run())
        .await
        .expect("daemon did not stop")
        .unwrap();
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = Config::default();
    config.bus.history_capacity = 0;
    assert!(Daemon::with_probe(config, Box::new(QuietHost)).is_err());
}

#[test]
fn config_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[daemon]\nport = 0\nhttp_enabled = false\n\n[bus]\ntick_interval_ms = 25").unwrap();
    let config = Config::load_from(file.path()).unwrap();
    assert_eq!(config.bus.tick_interval_ms, 25);
    let daemon = daemon(config);
    assert!(!daemon.config().daemon.http_enabled);
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loops_sample_metrics_and_assign_work() {
    let mut config = fast_config();
    config.daemon.http_enabled = false;
    let mut daemon = daemon(config);
    let events = daemon.state().events().subscribe();

    {
        let mut engine = daemon.state().engine.lock().await;
        engine.create_task(TaskSpec::new("queued")).unwrap();
    }
    daemon.start().await.unwrap();
    {
        let mut engine = daemon.state().engine.lock().await;
        engine.register_worker(Worker::new("w1", "Worker")).unwrap();
    }

    let updated = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv_async().await.unwrap();
            if event.event_type == EventType::MetricsUpdated && event.data["activeTasks"] == 1 {
                return event;
            }
        }
    })
    .await
    .expect("no metrics update");
    assert_eq!(updated.source, "daemon");

    let metrics = daemon.state().metrics.read().await;
    assert_eq!(metrics.latest(sampler::TASKS_CREATED, &Labels::empty()), Some(1.0));
    drop(metrics);
    assert!(daemon.state().last_health().await.is_some());

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn sustained_backlog_raises_default_alert() {
    let state = DaemonState::new(&Config::default(), Box::new(QuietHost)).unwrap();
    {
        let mut engine = state.engine.lock().await;
        for n in 0..150 {
            engine.create_task(TaskSpec::new(format!("t{n}"))).unwrap();
        }
    }
    let t0 = Utc::now();
    state.sample_metrics(t0).await.unwrap();
    assert!(state.evaluate_alerts(t0).await.is_empty());

    state
        .sample_metrics(t0 + chrono::Duration::seconds(60))
        .await
        .unwrap();
    let fired = state.evaluate_alerts(t0 + chrono::Duration::seconds(60)).await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].alert, "task-queue-backlog");
    assert_eq!(fired[0].value, 150.0);
}

#[tokio::test]
async fn cleanup_prunes_old_points() {
    let state = DaemonState::new(&Config::default(), Box::new(QuietHost)).unwrap();
    let t0 = Utc::now();
    state.sample_metrics(t0 - chrono::Duration::hours(2)).await.unwrap();
    state.sample_metrics(t0).await.unwrap();
    let removed = state.cleanup(t0, chrono::Duration::hours(1)).await;
    assert!(removed > 0);
    let metrics = state.metrics.read().await;
    assert_eq!(metrics.points(sampler::TASK_QUEUE_LENGTH).len(), 1);
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let state = std::sync::Arc::new(DaemonState::new(&Config::default(), Box::new(QuietHost)).unwrap());
    {
        let mut engine = state.engine.lock().await;
        engine.create_task(TaskSpec::new("one")).unwrap();
    }
    state.sample_metrics(Utc::now()).await.unwrap();

    let (status, body) = get(&state, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("# TYPE sy_tasks_created_total counter\n"));
    assert!(body.contains("\nsy_tasks_created_total 1\n"));
    assert!(body.contains("sy_workers{status=\"idle\"} 0\n"));
}

#[tokio::test]
async fn health_endpoint_reports_components() {
    let state = std::sync::Arc::new(DaemonState::new(&Config::default(), Box::new(QuietHost)).unwrap());
    state
        .engine
        .lock()
        .await
        .register_worker(Worker::new("w1", "Worker"))
        .unwrap();

    let (status, body) = get(&state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"].as_array().unwrap().len(), 4);
    assert!(state.last_health().await.is_some());

    let metrics = state.metrics.read().await;
    assert_eq!(metrics.latest(sampler::CPU_PERCENT, &Labels::empty()), Some(5.0));
}

/// Records which thread sampled it.
struct ThreadRecorder(std::sync::Arc<std::sync::Mutex<Option<std::thread::ThreadId>>>);

impl ResourceProbe for ThreadRecorder {
    fn sample(&mut self) -> Option<ResourceUsage> {
        *self.0.lock().unwrap() = Some(std::thread::current().id());
        None
    }
}

#[tokio::test]
async fn resource_sampling_runs_off_the_runtime_thread() {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
    let state = DaemonState::new(&Config::default(), Box::new(ThreadRecorder(seen.clone()))).unwrap();
    let health = state.check_health().await.unwrap();

    let sampled_on = seen.lock().unwrap().expect("usage was not sampled");
    assert_ne!(sampled_on, std::thread::current().id());
    // no usage reading degrades the resource component only
    assert_eq!(health.component("resources").unwrap().status, HealthStatus::Degraded);
}

#[tokio::test]
async fn stopped_engine_is_unhealthy() {
    let state = std::sync::Arc::new(DaemonState::new(&Config::default(), Box::new(QuietHost)).unwrap());
    state.engine.lock().await.stop();
    let (status, body) = get(&state, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn stats_and_alerts_endpoints() {
    let state = std::sync::Arc::new(DaemonState::new(&Config::default(), Box::new(QuietHost)).unwrap());
    state
        .engine
        .lock()
        .await
        .create_task(TaskSpec::new("queued"))
        .unwrap();

    let (status, body) = get(&state, "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    let stats: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["scheduler"]["queue_length"], 1);

    let (_, body) = get(&state, "/api/alerts").await;
    let alerts: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(alerts["alerts"].as_array().unwrap().len(), 3);
    assert_eq!(alerts["active"], json!([]));

    let (status, _) = get(&state, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
