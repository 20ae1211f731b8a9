//! The orchestration core: worker registry, task scheduler, workflow
//! interpreter, message bus and the [`Engine`] context that wires them
//! together.
//!
//! Every component owns its state and is mutated only through its public
//! operations. The [`Engine`] is the single writer: callers hold it behind a
//! lock and drive it with direct calls plus periodic [`Engine::tick`]s.

pub mod bus;
pub mod condition;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod scheduler;
pub mod workflow;

pub use engine::{Engine, ReapReport, TickReport};
pub use error::EngineError;
pub use events::EventBus;
