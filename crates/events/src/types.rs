//! Event types for the Formic event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Workspace root the event originated from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            workspace: None,
            event,
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new task was created
    #[serde(rename = "task.created")]
    TaskCreated { task_id: Uuid, title: String },

    /// Task fields were updated (title, context, priority)
    #[serde(rename = "task.updated")]
    TaskUpdated { task_id: Uuid },

    /// Task was removed from the board
    #[serde(rename = "task.deleted")]
    TaskDeleted { task_id: Uuid },

    /// Task status changed
    #[serde(rename = "task.status_changed")]
    TaskStatusChanged {
        task_id: Uuid,
        from_status: String,
        to_status: String,
    },

    /// A pipeline stage launched its agent
    #[serde(rename = "stage.started")]
    StageStarted { task_id: Uuid, stage: String },

    /// A pipeline stage reached a terminal outcome
    #[serde(rename = "stage.finished")]
    StageFinished {
        task_id: Uuid,
        stage: String,
        outcome: String,
        success: bool,
    },

    /// A workspace was opened and registered
    #[serde(rename = "workspace.opened")]
    WorkspaceOpened { path: String },

    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the task ID associated with this event, if any
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskCreated { task_id, .. } => Some(*task_id),
            Event::TaskUpdated { task_id } => Some(*task_id),
            Event::TaskDeleted { task_id } => Some(*task_id),
            Event::TaskStatusChanged { task_id, .. } => Some(*task_id),
            Event::StageStarted { task_id, .. } => Some(*task_id),
            Event::StageFinished { task_id, .. } => Some(*task_id),
            Event::WorkspaceOpened { .. } => None,
            Event::Error { .. } => None,
        }
    }
}
