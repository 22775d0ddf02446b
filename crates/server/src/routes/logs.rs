use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use formic_core::Stage;
use futures::stream::StreamExt;
use orchestrator::{LogLine, LogStream};
use uuid::Uuid;

use crate::error::AppError;
use crate::routes::sse::SSE_KEEP_ALIVE_INTERVAL;
use crate::state::AppState;

fn stream_name(stream: LogStream) -> &'static str {
    match stream {
        LogStream::Stdout => "stdout",
        LogStream::Stderr => "stderr",
        LogStream::System => "system",
    }
}

fn line_to_sse_event(line: &LogLine) -> Result<Event, Infallible> {
    let data = serde_json::to_string(line).unwrap_or_else(|_| "{}".to_string());

    Ok(Event::default()
        .id(line.seq.to_string())
        .event(stream_name(line.stream))
        .data(data))
}

/// History of a stage log followed by its live lines; ends with an `end`
/// event once the stage terminates.
#[utoipa::path(
    get,
    path = "/api/tasks/{id}/logs/{stage}/stream",
    params(
        ("id" = Uuid, Path, description = "Task ID"),
        ("stage" = String, Path, description = "brief, plan or execute"),
    ),
    responses(
        (status = 200, description = "SSE log stream"),
        (status = 400, description = "Unknown stage"),
        (status = 404, description = "Task not found or stage never ran"),
    ),
    tag = "workflow"
)]
pub async fn stage_log_stream(
    State(state): State<AppState>,
    Path((id, stage)): Path<(Uuid, String)>,
    headers: axum::http::HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let stage = Stage::parse(&stage)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown stage: {}", stage)))?;
    let workspace = state.active_workspace()?;
    let log = state
        .orchestrator
        .stage_log(&workspace, id, stage)?
        .ok_or_else(|| AppError::NotFound(format!("No {} log for task {}", stage, id)))?;

    let last_event_id: Option<u64> = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());

    let lines = log
        .history_plus_stream()
        .filter(move |line| {
            let fresh = last_event_id.map_or(true, |last| line.seq > last);
            futures::future::ready(fresh)
        })
        .map(|line| line_to_sse_event(&line));
    let end = futures::stream::once(async { Ok(Event::default().event("end").data("")) });

    Ok(Sse::new(lines.chain(end)).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names() {
        assert_eq!(stream_name(LogStream::Stdout), "stdout");
        assert_eq!(stream_name(LogStream::Stderr), "stderr");
        assert_eq!(stream_name(LogStream::System), "system");
    }

    #[test]
    fn test_line_to_sse_event_does_not_panic() {
        let line = LogLine {
            seq: 7,
            stream: LogStream::Stdout,
            line: "hello".to_string(),
            timestamp: chrono::Utc::now(),
        };
        let _event = line_to_sse_event(&line).unwrap();
    }
}
