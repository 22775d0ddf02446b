use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use orchestrator::WorkflowStatus;
use uuid::Uuid;

use crate::error::{AppError, ErrorResponse};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/api/tasks/{id}/run",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 202, description = "Workflow started", body = WorkflowStatus),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 409, description = "Already running or not startable", body = ErrorResponse)
    ),
    tag = "workflow"
)]
pub async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<WorkflowStatus>), AppError> {
    let workspace = state.active_workspace()?;
    let status = state.orchestrator.start_workflow(&workspace, id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

#[utoipa::path(
    post,
    path = "/api/tasks/{id}/stop",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Workflow cancelled", body = WorkflowStatus),
        (status = 409, description = "No workflow running", body = ErrorResponse)
    ),
    tag = "workflow"
)]
pub async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatus>, AppError> {
    let workspace = state.active_workspace()?;
    Ok(Json(state.orchestrator.stop_workflow(&workspace, id).await?))
}

#[utoipa::path(
    get,
    path = "/api/tasks/{id}/workflow",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Workflow status", body = WorkflowStatus),
        (status = 404, description = "Task not found", body = ErrorResponse)
    ),
    tag = "workflow"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatus>, AppError> {
    let workspace = state.active_workspace()?;
    Ok(Json(state.orchestrator.get_status(&workspace, id)?))
}
