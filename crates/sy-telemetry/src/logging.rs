use tracing_subscriber::{fmt, EnvFilter};

/// Initialize human-readable logging.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info" or
/// "sy_engine=debug,warn"). Later calls are no-ops, so tests may call it
/// freely.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize JSON logging, one object per line.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_current_span(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
}

/// Pick the output format from the `general` config section.
pub fn init_from_config(service_name: &str, general: &sy_core::config::GeneralConfig) {
    if general.json_logs() {
        init_logging_json(service_name, &general.log_level);
    } else {
        init_logging(service_name, &general.log_level);
    }
}
