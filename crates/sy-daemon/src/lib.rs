//! Background daemon for the switchyard orchestration engine.
//!
//! Owns one [`sy_engine::Engine`] behind a mutex and drives it on intervals:
//! engine ticks, queue passes, metric sampling, alert evaluation, health
//! checks and metric retention. Optionally serves `/metrics`, `/health` and
//! `/api/stats` over HTTP.

pub mod daemon;
pub mod http;
pub mod sampler;
pub mod shutdown;

pub use daemon::{Daemon, DaemonState};
pub use shutdown::ShutdownSignal;
