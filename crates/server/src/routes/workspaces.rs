use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::Json;
use orchestrator::{Workspace, WorkspaceId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResponse {
    pub path: String,
    pub name: String,
    pub task_count: usize,
    pub active: bool,
}

impl WorkspaceResponse {
    fn from_workspace(workspace: &Workspace, state: &AppState) -> Self {
        let summary = workspace.summary();
        Self {
            active: state.is_active(workspace.id()),
            path: summary.path,
            name: summary.name,
            task_count: summary.task_count,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WorkspacePathRequest {
    #[schema(value_type = String)]
    pub path: PathBuf,
}

#[utoipa::path(
    get,
    path = "/api/workspaces",
    responses(
        (status = 200, description = "Open workspaces", body = Vec<WorkspaceResponse>)
    ),
    tag = "workspaces"
)]
pub async fn list_workspaces(State(state): State<AppState>) -> Json<Vec<WorkspaceResponse>> {
    let entries = state
        .orchestrator
        .list_workspaces()
        .into_iter()
        .map(|summary| {
            let id = WorkspaceId::from_path(Path::new(&summary.path));
            WorkspaceResponse {
                active: state.is_active(&id),
                path: summary.path,
                name: summary.name,
                task_count: summary.task_count,
            }
        })
        .collect();
    Json(entries)
}

#[utoipa::path(
    post,
    path = "/api/workspaces",
    request_body = WorkspacePathRequest,
    responses(
        (status = 200, description = "Workspace opened and active", body = WorkspaceResponse),
        (status = 400, description = "Path is not a directory", body = ErrorResponse)
    ),
    tag = "workspaces"
)]
pub async fn open_workspace(
    State(state): State<AppState>,
    Json(payload): Json<WorkspacePathRequest>,
) -> Result<Json<WorkspaceResponse>, AppError> {
    let workspace = state.open_workspace(&payload.path).await?;
    Ok(Json(WorkspaceResponse::from_workspace(&workspace, &state)))
}

#[utoipa::path(
    post,
    path = "/api/workspaces/switch",
    request_body = WorkspacePathRequest,
    responses(
        (status = 200, description = "Active workspace switched", body = WorkspaceResponse),
        (status = 404, description = "Workspace not open", body = ErrorResponse)
    ),
    tag = "workspaces"
)]
pub async fn switch_workspace(
    State(state): State<AppState>,
    Json(payload): Json<WorkspacePathRequest>,
) -> Result<Json<WorkspaceResponse>, AppError> {
    let workspace = state.switch_workspace(&payload.path).await?;
    Ok(Json(WorkspaceResponse::from_workspace(&workspace, &state)))
}
