use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
