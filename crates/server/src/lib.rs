pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Formic API",
        version = "0.1.0",
        description = "Task board and Brief -> Plan -> Execute workflow orchestration"
    ),
    paths(
        routes::health_check,
        routes::get_board,
        routes::create_task,
        routes::get_task,
        routes::update_task,
        routes::delete_task,
        routes::run_task,
        routes::stop_task,
        routes::get_workflow,
        routes::logs::stage_log_stream,
        routes::list_workspaces,
        routes::open_workspace,
        routes::switch_workspace,
        routes::sse::events_stream,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::WorkspaceResponse,
        routes::WorkspacePathRequest,
        error::ErrorResponse,
        formic_core::Board,
        formic_core::BoardMeta,
        formic_core::Task,
        formic_core::TaskStatus,
        formic_core::Priority,
        formic_core::Stage,
        formic_core::WorkflowStep,
        formic_core::CreateTaskRequest,
        formic_core::UpdateTaskRequest,
        orchestrator::WorkflowStatus,
        orchestrator::WorkspaceSummary,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "board", description = "Board snapshot of the active workspace"),
        (name = "tasks", description = "Task management endpoints"),
        (name = "workflow", description = "Workflow control and live stage logs"),
        (name = "workspaces", description = "Workspace registry endpoints"),
        (name = "events", description = "Real-time event streaming (SSE)"),
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn create_router(state: AppState) -> Router {
    let app_dir = state.app_dir.clone();

    let api_router = Router::new()
        .route("/health", get(routes::health_check))
        .route("/api/openapi.json", get(openapi_json))
        .route("/api/board", get(routes::get_board))
        .route("/api/tasks", post(routes::create_task))
        .route(
            "/api/tasks/{id}",
            get(routes::get_task)
                .put(routes::update_task)
                .delete(routes::delete_task),
        )
        .route("/api/tasks/{id}/run", post(routes::run_task))
        .route("/api/tasks/{id}/stop", post(routes::stop_task))
        .route("/api/tasks/{id}/workflow", get(routes::get_workflow))
        .route(
            "/api/tasks/{id}/logs/{stage}/stream",
            get(routes::logs::stage_log_stream),
        )
        .route(
            "/api/workspaces",
            get(routes::list_workspaces).post(routes::open_workspace),
        )
        .route("/api/workspaces/switch", post(routes::switch_workspace))
        .route("/api/events", get(routes::sse::events_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Some(app_dir) = app_dir {
        let index_file = app_dir.join("index.html");
        let serve_dir = ServeDir::new(&app_dir).not_found_service(ServeFile::new(&index_file));
        api_router.fallback_service(serve_dir)
    } else {
        api_router
    }
}
