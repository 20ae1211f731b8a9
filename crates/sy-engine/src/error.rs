use uuid::Uuid;

use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;
use crate::workflow::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("malformed {kind} payload: {reason}")]
    Payload { kind: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
