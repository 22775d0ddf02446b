use crate::error::AppError;
use crate::routes::sse::{EventBuffer, SharedEventBuffer, DEFAULT_EVENT_BUFFER_SIZE};
use events::EventBus;
use orchestrator::{
    OrchestratorConfig, OrchestratorError, WorkflowOrchestrator, Workspace, WorkspaceId,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: WorkflowOrchestrator,
    pub event_bus: EventBus,
    pub event_buffer: SharedEventBuffer,
    pub app_dir: Option<PathBuf>,
    active: Arc<RwLock<Option<WorkspaceId>>>,
}

impl AppState {
    pub fn new(config: OrchestratorConfig) -> Self {
        let event_bus = EventBus::new();
        let event_buffer = Arc::new(RwLock::new(EventBuffer::new(DEFAULT_EVENT_BUFFER_SIZE)));
        let orchestrator = WorkflowOrchestrator::with_event_bus(config, event_bus.clone());

        Self {
            orchestrator,
            event_bus,
            event_buffer,
            app_dir: None,
            active: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_app_dir(mut self, app_dir: PathBuf) -> Self {
        self.app_dir = Some(app_dir);
        self
    }

    /// Workspace that task routes operate on.
    pub fn active_workspace(&self) -> Result<WorkspaceId, AppError> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(AppError::NoWorkspace)
    }

    pub fn is_active(&self, id: &WorkspaceId) -> bool {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            == Some(id)
    }

    /// Open (or reuse) the workspace at `path` and make it active.
    pub async fn open_workspace(&self, path: &Path) -> Result<Arc<Workspace>, OrchestratorError> {
        let workspace = self.orchestrator.open_workspace(path).await?;
        self.set_active(workspace.id().clone());

        tracing::info!(
            workspace = %workspace.id(),
            tasks = workspace.summary().task_count,
            "Opened workspace"
        );
        Ok(workspace)
    }

    /// Make an already open workspace active.
    pub async fn switch_workspace(&self, path: &Path) -> Result<Arc<Workspace>, AppError> {
        let root = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| AppError::BadRequest(format!("{}: {}", path.display(), e)))?;
        let workspace = self.orchestrator.workspace(&WorkspaceId::from_path(&root))?;
        self.set_active(workspace.id().clone());
        tracing::info!(workspace = %workspace.id(), "Switched active workspace");
        Ok(workspace)
    }

    fn set_active(&self, id: WorkspaceId) {
        *self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);
    }
}
