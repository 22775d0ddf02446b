use axum::extract::State;
use axum::Json;
use formic_core::Board;

use crate::error::AppError;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/api/board",
    responses(
        (status = 200, description = "Board of the active workspace", body = Board),
        (status = 409, description = "No workspace open", body = crate::error::ErrorResponse)
    ),
    tag = "board"
)]
pub async fn get_board(State(state): State<AppState>) -> Result<Json<Board>, AppError> {
    let workspace = state.active_workspace()?;
    Ok(Json(state.orchestrator.board(&workspace)?))
}
