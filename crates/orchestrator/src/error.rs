use formic_core::{CoreError, Stage, TaskStatus};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {task_id} was modified concurrently: expected {expected}, found {actual}")]
    ConcurrentModification {
        task_id: Uuid,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Workflow already running for task: {0}")]
    AlreadyRunning(Uuid),

    #[error("No workflow running for task: {0}")]
    NotRunning(Uuid),

    #[error("Skill '{skill}' is missing required variable ${variable}")]
    MissingVariable { skill: String, variable: String },

    #[error("Unknown skill: {0}")]
    UnknownSkill(String),

    #[error("Stage {stage} failed: {reason}")]
    StageFailure { stage: Stage, reason: String },

    #[error("Task is running and must be stopped first: {0}")]
    TaskRunning(Uuid),

    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Workspace is not open: {0}")]
    WorkspaceNotOpen(PathBuf),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    pub fn stage_failed(stage: Stage, reason: impl Into<String>) -> Self {
        Self::StageFailure {
            stage,
            reason: reason.into(),
        }
    }

    pub fn missing_variable(skill: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::MissingVariable {
            skill: skill.into(),
            variable: variable.into(),
        }
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TaskNotFound(id) => Self::NotFound(id),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
