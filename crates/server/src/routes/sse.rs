use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::state::AppState;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1000;
pub const SSE_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub task_ids: Option<String>,
    /// Only events stamped with this workspace root
    pub workspace: Option<String>,
}

/// Recent envelopes kept for `Last-Event-ID` replay.
pub struct EventBuffer {
    events: VecDeque<events::EventEnvelope>,
    max_size: usize,
}

impl EventBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, envelope: events::EventEnvelope) {
        if self.events.iter().any(|e| e.id == envelope.id) {
            return;
        }
        if self.events.len() >= self.max_size {
            self.events.pop_front();
        }
        self.events.push_back(envelope);
    }

    pub fn events_after(&self, event_id: Uuid) -> Vec<events::EventEnvelope> {
        self.events
            .iter()
            .skip_while(|envelope| envelope.id != event_id)
            .skip(1)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub type SharedEventBuffer = Arc<RwLock<EventBuffer>>;

struct EventFilter {
    task_ids: Option<Vec<Uuid>>,
    workspace: Option<String>,
}

impl EventFilter {
    fn matches(&self, envelope: &events::EventEnvelope) -> bool {
        if let Some(ids) = &self.task_ids {
            if let Some(task_id) = envelope.event.task_id() {
                if !ids.contains(&task_id) {
                    return false;
                }
            }
        }
        match (&self.workspace, &envelope.workspace) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

fn parse_task_ids(task_ids: Option<&str>) -> Option<Vec<Uuid>> {
    task_ids.map(|s| {
        s.split(',')
            .filter_map(|id| id.trim().parse().ok())
            .collect()
    })
}

fn event_name(event: &events::Event) -> &'static str {
    match event {
        events::Event::TaskCreated { .. } => "task.created",
        events::Event::TaskUpdated { .. } => "task.updated",
        events::Event::TaskDeleted { .. } => "task.deleted",
        events::Event::TaskStatusChanged { .. } => "task.status_changed",
        events::Event::StageStarted { .. } => "stage.started",
        events::Event::StageFinished { .. } => "stage.finished",
        events::Event::WorkspaceOpened { .. } => "workspace.opened",
        events::Event::Error { .. } => "error",
    }
}

fn envelope_to_sse_event(envelope: &events::EventEnvelope) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());

    Ok(Event::default()
        .id(envelope.id.to_string())
        .event(event_name(&envelope.event))
        .data(data))
}

#[utoipa::path(
    get,
    path = "/api/events",
    params(
        ("task_ids" = Option<String>, Query, description = "Comma-separated task IDs to filter events"),
        ("workspace" = Option<String>, Query, description = "Workspace root to filter events"),
    ),
    responses(
        (status = 200, description = "SSE event stream"),
    ),
    tag = "events"
)]
pub async fn events_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: axum::http::HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter = Arc::new(EventFilter {
        task_ids: parse_task_ids(query.task_ids.as_deref()),
        workspace: query.workspace,
    });
    let last_event_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<Uuid>().ok());

    let buffer = Arc::clone(&state.event_buffer);
    let rx = state.event_bus.subscribe();

    let missed_events = match last_event_id {
        Some(event_id) => buffer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .events_after(event_id),
        None => vec![],
    };

    let missed_filter = Arc::clone(&filter);
    let missed_stream = futures::stream::iter(
        missed_events
            .into_iter()
            .filter(move |e| missed_filter.matches(e))
            .map(|e| envelope_to_sse_event(&e)),
    );

    let live_stream = BroadcastStream::new(rx).filter_map(move |result| {
        let filter = Arc::clone(&filter);
        let buffer = Arc::clone(&buffer);

        async move {
            match result {
                Ok(envelope) => {
                    buffer
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(envelope.clone());

                    filter
                        .matches(&envelope)
                        .then(|| envelope_to_sse_event(&envelope))
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "SSE broadcast error");
                    None
                }
            }
        }
    });

    Sse::new(missed_stream.chain(live_stream)).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}
