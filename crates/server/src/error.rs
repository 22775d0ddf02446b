use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::OrchestratorError;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    /// No workspace has been opened yet
    NoWorkspace,
    Orchestrator(OrchestratorError),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
    message: String,
}

impl AppError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NoWorkspace => (
                StatusCode::CONFLICT,
                "no_workspace",
                "No workspace is open".to_string(),
            ),
            AppError::Orchestrator(err) => {
                let message = err.to_string();
                let (status, kind) = match &err {
                    OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    OrchestratorError::WorkspaceNotOpen(_) => {
                        (StatusCode::NOT_FOUND, "workspace_not_open")
                    }
                    OrchestratorError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
                    OrchestratorError::NotRunning(_) => (StatusCode::CONFLICT, "not_running"),
                    OrchestratorError::TaskRunning(_) => (StatusCode::CONFLICT, "task_running"),
                    OrchestratorError::InvalidTransition { .. } => {
                        (StatusCode::CONFLICT, "invalid_transition")
                    }
                    OrchestratorError::ConcurrentModification { .. } => {
                        (StatusCode::CONFLICT, "concurrent_modification")
                    }
                    OrchestratorError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                    OrchestratorError::MissingVariable { .. } => {
                        (StatusCode::BAD_REQUEST, "missing_variable")
                    }
                    OrchestratorError::UnknownSkill(_) => (StatusCode::BAD_REQUEST, "unknown_skill"),
                    OrchestratorError::StageFailure { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "stage_failure")
                    }
                    OrchestratorError::Io(_) | OrchestratorError::Serialization(_) => {
                        tracing::error!(error = %err, "Internal error");
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                    }
                };
                (status, kind, message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Orchestrator(err)
    }
}
