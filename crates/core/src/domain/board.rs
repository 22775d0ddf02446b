use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::task::{Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoardMeta {
    pub project_name: String,
    pub repo_path: String,
    pub created_at: DateTime<Utc>,
}

impl BoardMeta {
    pub fn new(project_name: impl Into<String>, repo_path: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            repo_path: repo_path.into(),
            created_at: Utc::now(),
        }
    }
}

/// Snapshot of every task in one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Board {
    pub meta: BoardMeta,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Board {
    pub fn new(meta: BoardMeta) -> Self {
        Self {
            meta,
            tasks: Vec::new(),
        }
    }

    pub fn find(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}
