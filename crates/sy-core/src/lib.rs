//! Shared domain types and configuration for the switchyard orchestration
//! engine.
//!
//! - [`types`]: workers, tasks, workflows and executions
//! - [`messages`]: the message envelope and the wire payloads exchanged with
//!   external workers
//! - [`events`]: the event envelope published to observers
//! - [`snapshot`]: point-in-time counters consumed by the observability layer
//! - [`config`]: TOML configuration with per-section defaults

pub mod config;
pub mod events;
pub mod messages;
pub mod snapshot;
pub mod types;
