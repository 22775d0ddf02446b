use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::workflow::{Stage, WorkflowStep};
use crate::error::CoreError;

/// Workspace-relative directory that holds per-task documentation folders.
pub const TASK_DOCS_ROOT: &str = ".formic/tasks";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    Briefing,
    Planning,
    Running,
    Review,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Briefing => "briefing",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Review => "review",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Self::Todo),
            "briefing" => Some(Self::Briefing),
            "planning" => Some(Self::Planning),
            "running" => Some(Self::Running),
            "review" => Some(Self::Review),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// True while a stage of the pipeline is executing.
    pub fn is_active(&self) -> bool {
        self.stage().is_some()
    }

    /// Stage executed while in this status.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Briefing => Some(Stage::Brief),
            Self::Planning => Some(Stage::Plan),
            Self::Running => Some(Stage::Execute),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub workflow_step: WorkflowStep,
    /// Documentation folder, relative to the workspace root.
    pub docs_path: String,
    /// Captured output of each stage's most recent run.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub logs: BTreeMap<Stage, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, context: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            title: title.into(),
            context: context.into(),
            priority,
            status: TaskStatus::default(),
            workflow_step: WorkflowStep::None,
            docs_path: Self::docs_path_for(id),
            logs: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self.docs_path = Self::docs_path_for(id);
        self
    }

    pub fn docs_path_for(id: Uuid) -> String {
        format!("{}/{}", TASK_DOCS_ROOT, id)
    }

    pub fn log(&self, stage: Stage) -> Option<&str> {
        self.logs.get(&stage).map(String::as_str)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub priority: Priority,
}

impl CreateTaskRequest {
    pub fn new(title: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            context: context.into(),
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.title.trim().is_empty() {
            return Err(CoreError::Validation("Title cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, ToSchema)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub context: Option<String>,
    pub priority: Option<Priority>,
    /// Replaces the status outright (e.g. resetting a failed task to todo).
    pub status: Option<TaskStatus>,
}

impl UpdateTaskRequest {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.context.is_none()
            && self.priority.is_none()
            && self.status.is_none()
    }
}
