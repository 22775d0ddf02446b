use chrono::{DateTime, Utc};
use formic_core::{Priority, Stage, Task, TaskStatus, WorkflowStep};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// A status change that was actually applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub task_id: Uuid,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Owns one task record and serializes every status change to it.
///
/// Reads return snapshots; no lock is ever held across an await point.
pub struct TaskStateMachine {
    id: Uuid,
    task: RwLock<Task>,
}

impl TaskStateMachine {
    pub fn new(task: Task) -> Self {
        Self {
            id: task.id,
            task: RwLock::new(task),
        }
    }

    pub fn validate_transition(from: &TaskStatus, to: &TaskStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: *from,
                to: *to,
            })
        }
    }

    fn allowed_transitions(from: &TaskStatus) -> &'static [TaskStatus] {
        match from {
            TaskStatus::Todo => &[
                TaskStatus::Briefing,
                TaskStatus::Cancelled,
                TaskStatus::Failed,
            ],
            TaskStatus::Briefing => &[
                TaskStatus::Planning,
                TaskStatus::Cancelled,
                TaskStatus::Failed,
            ],
            TaskStatus::Planning => &[
                TaskStatus::Running,
                TaskStatus::Cancelled,
                TaskStatus::Failed,
            ],
            TaskStatus::Running => &[
                TaskStatus::Review,
                TaskStatus::Cancelled,
                TaskStatus::Failed,
            ],
            TaskStatus::Review => &[TaskStatus::Done, TaskStatus::Cancelled, TaskStatus::Failed],
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled => &[],
        }
    }

    pub fn can_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// Status reached when the current pipeline step completes successfully.
    pub fn next_status(current: &TaskStatus) -> Option<TaskStatus> {
        match current {
            TaskStatus::Todo => Some(TaskStatus::Briefing),
            TaskStatus::Briefing => Some(TaskStatus::Planning),
            TaskStatus::Planning => Some(TaskStatus::Running),
            TaskStatus::Running => Some(TaskStatus::Review),
            TaskStatus::Review => Some(TaskStatus::Done),
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled => None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> Task {
        self.read().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.read().status
    }

    /// Move to `to` from whatever the current status is.
    ///
    /// Re-entering the terminal status the task already holds is a no-op
    /// and returns `Ok(None)`.
    pub fn transition(&self, to: TaskStatus) -> Result<Option<Transition>> {
        let mut task = self.write();
        if task.status == to && to.is_terminal() {
            return Ok(None);
        }
        Self::validate_transition(&task.status, &to)?;
        Ok(Some(Self::apply(&mut task, to)))
    }

    /// Move from `expected` to `to`, failing if another caller got there first.
    ///
    /// If the task already sits in `to` the call is an idempotent no-op.
    pub fn transition_from(&self, expected: TaskStatus, to: TaskStatus) -> Result<Option<Transition>> {
        let mut task = self.write();
        if task.status != expected {
            if task.status == to {
                return Ok(None);
            }
            return Err(OrchestratorError::ConcurrentModification {
                task_id: self.id,
                expected,
                actual: task.status,
            });
        }
        Self::validate_transition(&task.status, &to)?;
        Ok(Some(Self::apply(&mut task, to)))
    }

    /// Overwrite the status without consulting the transition table.
    ///
    /// Used by external collaborators (board drag, review approval, reset
    /// of a failed task). Callers guarantee no workflow is running.
    pub fn replace_status(&self, status: TaskStatus) -> Option<Transition> {
        let mut task = self.write();
        if task.status == status {
            return None;
        }
        let from = task.status;
        task.status = status;
        task.workflow_step = WorkflowStep::None;
        task.touch();
        Some(Transition {
            task_id: self.id,
            from,
            to: status,
            at: task.updated_at,
        })
    }

    /// Apply the non-status fields of a partial update.
    pub fn update_fields(
        &self,
        title: Option<String>,
        context: Option<String>,
        priority: Option<Priority>,
    ) -> Task {
        let mut task = self.write();
        if let Some(title) = title {
            task.title = title;
        }
        if let Some(context) = context {
            task.context = context;
        }
        if let Some(priority) = priority {
            task.priority = priority;
        }
        task.touch();
        task.clone()
    }

    /// Store the full captured output of a stage run.
    pub fn record_log(&self, stage: Stage, content: String) {
        let mut task = self.write();
        task.logs.insert(stage, content);
        task.touch();
    }

    /// Append one line to a stage log, creating the entry if needed.
    pub fn append_log_note(&self, stage: Stage, note: &str) {
        let mut task = self.write();
        let entry = task.logs.entry(stage).or_default();
        if !entry.is_empty() && !entry.ends_with('\n') {
            entry.push('\n');
        }
        entry.push_str(note);
        task.touch();
    }

    fn apply(task: &mut Task, to: TaskStatus) -> Transition {
        let from = task.status;
        task.status = to;
        match to {
            TaskStatus::Briefing | TaskStatus::Planning | TaskStatus::Running => {
                if let Some(stage) = to.stage() {
                    task.workflow_step = stage.into();
                }
            }
            TaskStatus::Review | TaskStatus::Done | TaskStatus::Todo => {
                task.workflow_step = WorkflowStep::None;
            }
            // keep the last stage reached for diagnosis
            TaskStatus::Failed | TaskStatus::Cancelled => {}
        }
        task.touch();
        Transition {
            task_id: task.id,
            from,
            to,
            at: task.updated_at,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Task> {
        self.task.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Task> {
        self.task.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TaskStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateMachine")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
