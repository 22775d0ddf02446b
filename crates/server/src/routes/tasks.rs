use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use formic_core::{CreateTaskRequest, Task, UpdateTaskRequest};
use uuid::Uuid;

use crate::error::{AppError, ErrorResponse};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/api/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 201, description = "Task created", body = Task),
        (status = 400, description = "Invalid task", body = ErrorResponse)
    ),
    tag = "tasks"
)]
pub async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let workspace = state.active_workspace()?;
    let created = state.orchestrator.create_task(&workspace, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/tasks/{id}",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task", body = Task),
        (status = 404, description = "Task not found", body = ErrorResponse)
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    let workspace = state.active_workspace()?;
    Ok(Json(state.orchestrator.get_task(&workspace, id)?))
}

#[utoipa::path(
    put,
    path = "/api/tasks/{id}",
    params(("id" = Uuid, Path, description = "Task ID")),
    request_body = UpdateTaskRequest,
    responses(
        (status = 200, description = "Updated task", body = Task),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 409, description = "Status change while a workflow runs", body = ErrorResponse)
    ),
    tag = "tasks"
)]
pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, AppError> {
    let workspace = state.active_workspace()?;
    Ok(Json(
        state.orchestrator.update_task(&workspace, id, payload).await?,
    ))
}

/// Deleting an absent task still answers 204.
#[utoipa::path(
    delete,
    path = "/api/tasks/{id}",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 204, description = "Task deleted"),
        (status = 409, description = "Workflow running", body = ErrorResponse)
    ),
    tag = "tasks"
)]
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let workspace = state.active_workspace()?;
    let deleted = state.orchestrator.delete_task(&workspace, id).await?;
    if !deleted {
        tracing::debug!(task_id = %id, "Delete of absent task");
    }
    Ok(StatusCode::NO_CONTENT)
}
