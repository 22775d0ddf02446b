//! One open workspace: its task registry, active runs and board persistence.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use events::{Event, EventBus, ScopedPublisher};
use formic_core::{Board, BoardMeta, Stage, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{OrchestratorConfig, WorkspaceConfig};
use crate::error::{OrchestratorError, Result};
use crate::skills::SKILLS_DIR;
use crate::state_machine::{TaskStateMachine, Transition};
use crate::store::{BoardStore, JsonBoardStore};

/// Workspace-relative directory holding orchestrator state.
pub const STATE_DIR: &str = ".formic";
pub const BOARD_FILE: &str = "board.json";

pub const INTERRUPTED_NOTE: &str = "[formic] workflow interrupted: orchestrator restarted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn board_file(&self) -> PathBuf {
        self.state_dir().join(BOARD_FILE)
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join(SKILLS_DIR)
    }

    /// Absolute documentation folder of a task.
    pub fn docs_dir(&self, task: &Task) -> PathBuf {
        self.root.join(&task.docs_path)
    }

    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }
}

/// Canonical root path of an open workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn from_path(path: &Path) -> Self {
        Self(path.display().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSummary {
    pub path: String,
    pub name: String,
    pub task_count: usize,
}

/// In-flight workflow of one task.
pub struct WorkflowRun {
    task_id: Uuid,
    started_at: DateTime<Utc>,
    stage: Mutex<Stage>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl WorkflowRun {
    pub fn new(task_id: Uuid, stage: Stage) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            task_id,
            started_at: Utc::now(),
            stage: Mutex::new(stage),
            cancel: CancellationToken::new(),
            finished,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_stage(&self, stage: Stage) {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner()) = stage;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    /// Resolves once the run has been removed from its workspace.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl fmt::Debug for WorkflowRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRun")
            .field("task_id", &self.task_id)
            .field("stage", &self.stage())
            .field("started_at", &self.started_at)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Lock order: `runs` before `tasks` before any task's own lock.
pub struct Workspace {
    id: WorkspaceId,
    layout: WorkspaceLayout,
    config: OrchestratorConfig,
    store: Arc<dyn BoardStore>,
    meta: RwLock<BoardMeta>,
    tasks: RwLock<HashMap<Uuid, Arc<TaskStateMachine>>>,
    runs: Mutex<HashMap<Uuid, Arc<WorkflowRun>>>,
    persist_lock: tokio::sync::Mutex<()>,
    events: Option<ScopedPublisher>,
}

impl Workspace {
    /// Open `root` with the JSON board store under `.formic/`.
    pub async fn open(
        root: &Path,
        defaults: &OrchestratorConfig,
        events: Option<&EventBus>,
    ) -> Result<Self> {
        let root = canonical_root(root).await?;
        let store = Arc::new(JsonBoardStore::new(WorkspaceLayout::new(&root).board_file()));
        Self::open_with_store(&root, defaults, store, events).await
    }

    pub async fn open_with_store(
        root: &Path,
        defaults: &OrchestratorConfig,
        store: Arc<dyn BoardStore>,
        events: Option<&EventBus>,
    ) -> Result<Self> {
        let layout = WorkspaceLayout::new(root);
        tokio::fs::create_dir_all(layout.state_dir()).await?;

        let ws_config = WorkspaceConfig::read(root).await;
        let config = defaults.for_workspace(&ws_config);

        let board = match store.load().await? {
            Some(board) => board,
            None => {
                let name = ws_config.project_name.clone().unwrap_or_else(|| layout.name());
                Board::new(BoardMeta::new(name, root.display().to_string()))
            }
        };

        let id = WorkspaceId::from_path(root);
        let tasks = board
            .tasks
            .into_iter()
            .map(|task| (task.id, Arc::new(TaskStateMachine::new(task))))
            .collect();

        let workspace = Self {
            events: events.map(|bus| bus.scoped(id.as_str())),
            id,
            layout,
            config,
            store,
            meta: RwLock::new(board.meta),
            tasks: RwLock::new(tasks),
            runs: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
        };

        let recovered = workspace.recover_interrupted();
        workspace.persist().await?;
        info!(workspace = %workspace.id, recovered, "Workspace opened");
        Ok(workspace)
    }

    /// Fail tasks left in an active status by a previous process.
    fn recover_interrupted(&self) -> usize {
        let mut recovered = 0;
        for machine in self.machines() {
            let task = machine.snapshot();
            let Some(stage) = task.status.stage() else {
                continue;
            };
            match machine.transition(TaskStatus::Failed) {
                Ok(Some(t)) => {
                    machine.append_log_note(stage, INTERRUPTED_NOTE);
                    warn!(task_id = %task.id, stage = %stage, "Interrupted workflow marked failed");
                    self.emit(Event::TaskStatusChanged {
                        task_id: t.task_id,
                        from_status: t.from.to_string(),
                        to_status: t.to.to_string(),
                    });
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to recover task"),
            }
        }
        recovered
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn summary(&self) -> WorkspaceSummary {
        WorkspaceSummary {
            path: self.id.to_string(),
            name: self.meta().project_name,
            task_count: self.read_tasks().len(),
        }
    }

    pub fn meta(&self) -> BoardMeta {
        self.meta.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Snapshot of every task, oldest first.
    pub fn board(&self) -> Board {
        let mut tasks: Vec<Task> = self.machines().iter().map(|m| m.snapshot()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Board {
            meta: self.meta(),
            tasks,
        }
    }

    pub fn machine(&self, task_id: Uuid) -> Result<Arc<TaskStateMachine>> {
        self.read_tasks()
            .get(&task_id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(task_id))
    }

    pub fn machines(&self) -> Vec<Arc<TaskStateMachine>> {
        self.read_tasks().values().cloned().collect()
    }

    pub(crate) fn insert_task(&self, task: Task) -> Arc<TaskStateMachine> {
        let machine = Arc::new(TaskStateMachine::new(task));
        self.tasks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(machine.id(), Arc::clone(&machine));
        machine
    }

    /// Remove a task unless a workflow is running for it.
    pub(crate) fn remove_task(&self, task_id: Uuid) -> Result<Option<Arc<TaskStateMachine>>> {
        let runs = self.lock_runs();
        if runs.contains_key(&task_id) {
            return Err(OrchestratorError::TaskRunning(task_id));
        }
        let removed = self
            .tasks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_id);
        Ok(removed)
    }

    pub fn run(&self, task_id: Uuid) -> Option<Arc<WorkflowRun>> {
        self.lock_runs().get(&task_id).cloned()
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.lock_runs().contains_key(&task_id)
    }

    pub fn active_runs(&self) -> usize {
        self.lock_runs().len()
    }

    /// Registry of in-flight runs; never held across an await.
    pub(crate) fn lock_runs(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<WorkflowRun>>> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move a run's task from `from` to `target`, or to `cancelled` if a stop
    /// was requested.
    ///
    /// Done under the runs lock so a concurrent stop either sees the run and
    /// wins, or finds it already gone. A task that is no longer in `from`
    /// surfaces as `ConcurrentModification` and is failed. Returns the
    /// resulting status; the run is unregistered once that status is no
    /// longer active.
    pub(crate) fn advance_run(
        &self,
        machine: &TaskStateMachine,
        run: &WorkflowRun,
        from: TaskStatus,
        target: TaskStatus,
    ) -> (TaskStatus, Option<Transition>) {
        let mut runs = self.lock_runs();
        let target = if run.is_cancelled() {
            TaskStatus::Cancelled
        } else {
            target
        };

        let transition = match machine.transition_from(from, target) {
            Ok(transition) => transition,
            Err(e) => {
                error!(task_id = %run.task_id(), status = %target, error = %e, "Workflow transition rejected, failing task");
                machine.transition(TaskStatus::Failed).ok().flatten()
            }
        };

        // status event lands before the run is released
        if let Some(t) = &transition {
            info!(task_id = %t.task_id, from = %t.from, to = %t.to, "Task transitioned");
            self.emit(Event::TaskStatusChanged {
                task_id: t.task_id,
                from_status: t.from.to_string(),
                to_status: t.to.to_string(),
            });
        }

        let status = machine.status();
        if !status.is_active() {
            runs.remove(&run.task_id());
        }
        drop(runs);
        (status, transition)
    }

    /// Save the current board; concurrent calls are serialized so the
    /// last write always carries the newest state.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let board = self.board();
        self.store.save(&board).await
    }

    /// Persist, logging instead of failing.
    pub async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            warn!(workspace = %self.id, error = %e, "Failed to persist board");
            self.emit(Event::Error {
                message: e.to_string(),
                context: Some("persist".to_string()),
            });
        }
    }

    pub fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn read_tasks(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<TaskStateMachine>>> {
        self.tasks.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("tasks", &self.read_tasks().len())
            .field("active_runs", &self.active_runs())
            .finish()
    }
}

pub(crate) async fn canonical_root(root: &Path) -> Result<PathBuf> {
    match tokio::fs::canonicalize(root).await {
        Ok(path) if path.is_dir() => Ok(path),
        Ok(path) => Err(OrchestratorError::Validation(format!(
            "Workspace path is not a directory: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OrchestratorError::Validation(
            format!("Workspace path does not exist: {}", root.display()),
        )),
        Err(e) => Err(e.into()),
    }
}
