//! Observability for the orchestration engine.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: a time-series store with Prometheus and JSON export
//! - **Alerts**: threshold conditions over recent metric values, edge-triggered
//! - **Health**: per-component checks aggregated into an overall status

pub mod alerts;
pub mod health;
pub mod logging;
pub mod metrics;
