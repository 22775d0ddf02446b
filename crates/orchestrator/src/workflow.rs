use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use events::{Event, EventBus};
use formic_core::{
    Board, CreateTaskRequest, Stage, Task, TaskStatus, UpdateTaskRequest, WorkflowStep,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::log_stream::{LogStreamer, StageLog};
use crate::run_guard::RunGuard;
use crate::skills::SkillTemplateResolver;
use crate::stage_runner::{StageOutcome, StageRunner};
use crate::state_machine::TaskStateMachine;
use crate::workspace::{canonical_root, WorkflowRun, Workspace, WorkspaceId, WorkspaceSummary};

/// Point-in-time view of a task's workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub workflow_step: WorkflowStep,
    pub is_running: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub logs: BTreeMap<Stage, String>,
}

struct Inner {
    config: OrchestratorConfig,
    runner: StageRunner,
    events: Option<EventBus>,
    workspaces: RwLock<HashMap<WorkspaceId, Arc<Workspace>>>,
    opening: tokio::sync::Mutex<()>,
}

/// Drives tasks through Brief -> Plan -> Execute across open workspaces.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

impl WorkflowOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_event_bus(config: OrchestratorConfig, bus: EventBus) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: OrchestratorConfig, events: Option<EventBus>) -> Self {
        let resolver = Arc::new(SkillTemplateResolver::new(config.skills.clone()));
        Self {
            inner: Arc::new(Inner {
                runner: StageRunner::new(resolver, LogStreamer::new()),
                config,
                events,
                workspaces: RwLock::new(HashMap::new()),
                opening: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> Option<&EventBus> {
        self.inner.events.as_ref()
    }

    pub fn resolver(&self) -> &Arc<SkillTemplateResolver> {
        self.inner.runner.resolver()
    }

    /// Open and register a workspace; an already open one is returned as is.
    pub async fn open_workspace(&self, path: &Path) -> Result<Arc<Workspace>> {
        let _opening = self.inner.opening.lock().await;
        let root = canonical_root(path).await?;
        let id = WorkspaceId::from_path(&root);
        if let Some(existing) = self.read_workspaces().get(&id) {
            return Ok(Arc::clone(existing));
        }

        let workspace = Arc::new(
            Workspace::open(&root, &self.inner.config, self.inner.events.as_ref()).await?,
        );
        if let Err(e) = self.resolver().provision_all(workspace.root()).await {
            warn!(workspace = %id, error = %e, "Failed to provision skills");
        }

        self.inner
            .workspaces
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), Arc::clone(&workspace));
        workspace.emit(Event::WorkspaceOpened {
            path: id.to_string(),
        });
        Ok(workspace)
    }

    /// Unregister a workspace; refused while any of its workflows run.
    pub async fn close_workspace(&self, id: &WorkspaceId) -> Result<()> {
        let workspace = {
            let mut workspaces = self
                .inner
                .workspaces
                .write()
                .unwrap_or_else(|p| p.into_inner());
            let workspace = workspaces
                .get(id)
                .ok_or_else(|| OrchestratorError::WorkspaceNotOpen(id.as_path().to_path_buf()))?;
            if let Some(task_id) = workspace.lock_runs().keys().next().copied() {
                return Err(OrchestratorError::TaskRunning(task_id));
            }
            workspaces.remove(id)
        };

        if let Some(workspace) = workspace {
            workspace.persist().await?;
            for machine in workspace.machines() {
                self.inner.runner.logs().remove_task(machine.id());
            }
            info!(workspace = %id, "Workspace closed");
        }
        Ok(())
    }

    pub fn list_workspaces(&self) -> Vec<WorkspaceSummary> {
        let mut summaries: Vec<_> = self
            .read_workspaces()
            .values()
            .map(|ws| ws.summary())
            .collect();
        summaries.sort_by(|a, b| a.path.cmp(&b.path));
        summaries
    }

    pub fn workspace(&self, id: &WorkspaceId) -> Result<Arc<Workspace>> {
        self.read_workspaces()
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::WorkspaceNotOpen(id.as_path().to_path_buf()))
    }

    pub async fn provision_skills(&self, id: &WorkspaceId) -> Result<Vec<PathBuf>> {
        let workspace = self.workspace(id)?;
        self.resolver().provision_all(workspace.root()).await
    }

    /// Overwrite a workspace's copy of `skill` with the current source.
    pub async fn reprovision_skill(&self, id: &WorkspaceId, skill: &str) -> Result<PathBuf> {
        let workspace = self.workspace(id)?;
        self.resolver().reprovision(workspace.root(), skill).await
    }

    pub fn board(&self, id: &WorkspaceId) -> Result<Board> {
        Ok(self.workspace(id)?.board())
    }

    pub fn get_task(&self, id: &WorkspaceId, task_id: Uuid) -> Result<Task> {
        Ok(self.workspace(id)?.machine(task_id)?.snapshot())
    }

    pub async fn create_task(&self, id: &WorkspaceId, request: CreateTaskRequest) -> Result<Task> {
        request.validate()?;
        let workspace = self.workspace(id)?;

        let task = Task::new(request.title.trim(), request.context, request.priority);
        let machine = workspace.insert_task(task);
        let task = machine.snapshot();
        workspace.persist().await?;

        info!(task_id = %task.id, title = %task.title, "Task created");
        workspace.emit(Event::TaskCreated {
            task_id: task.id,
            title: task.title.clone(),
        });
        Ok(task)
    }

    /// Apply a partial update. A `status` field replaces the status outright
    /// and is refused while the task's workflow runs. Active statuses are
    /// only reachable through `start_workflow`.
    pub async fn update_task(
        &self,
        id: &WorkspaceId,
        task_id: Uuid,
        request: UpdateTaskRequest,
    ) -> Result<Task> {
        let workspace = self.workspace(id)?;
        let machine = workspace.machine(task_id)?;
        if request.is_empty() {
            return Ok(machine.snapshot());
        }
        if let Some(title) = &request.title {
            if title.trim().is_empty() {
                return Err(OrchestratorError::Validation("Title cannot be empty".to_string()));
            }
        }

        if let Some(status) = request.status.filter(|s| s.is_active()) {
            return Err(OrchestratorError::InvalidTransition {
                from: machine.status(),
                to: status,
            });
        }

        let replaced = match request.status {
            Some(status) => {
                let runs = workspace.lock_runs();
                if runs.contains_key(&task_id) {
                    return Err(OrchestratorError::TaskRunning(task_id));
                }
                machine.replace_status(status)
            }
            None => None,
        };

        let task = machine.update_fields(
            request.title.map(|t| t.trim().to_string()),
            request.context,
            request.priority,
        );
        workspace.persist().await?;

        workspace.emit(Event::TaskUpdated { task_id });
        if let Some(t) = replaced {
            info!(task_id = %task_id, from = %t.from, to = %t.to, "Task status replaced");
            workspace.emit(Event::TaskStatusChanged {
                task_id,
                from_status: t.from.to_string(),
                to_status: t.to.to_string(),
            });
        }
        Ok(task)
    }

    /// Remove a task record. Returns false if it was already gone.
    pub async fn delete_task(&self, id: &WorkspaceId, task_id: Uuid) -> Result<bool> {
        let workspace = self.workspace(id)?;
        let Some(_) = workspace.remove_task(task_id)? else {
            return Ok(false);
        };

        self.inner.runner.logs().remove_task(task_id);
        workspace.persist().await?;
        info!(task_id = %task_id, "Task deleted");
        workspace.emit(Event::TaskDeleted { task_id });
        Ok(true)
    }

    /// Begin the pipeline and return without waiting for it.
    pub async fn start_workflow(&self, id: &WorkspaceId, task_id: Uuid) -> Result<WorkflowStatus> {
        let workspace = self.workspace(id)?;
        let machine = workspace.machine(task_id)?;

        let (run, transition) = {
            let mut runs = workspace.lock_runs();
            if runs.contains_key(&task_id) {
                return Err(OrchestratorError::AlreadyRunning(task_id));
            }
            let transition = machine.transition(TaskStatus::Briefing)?;
            let run = Arc::new(WorkflowRun::new(task_id, Stage::Brief));
            runs.insert(task_id, Arc::clone(&run));
            (run, transition)
        };

        info!(task_id = %task_id, workspace = %id, "Workflow started");
        if let Some(t) = transition {
            workspace.emit(Event::TaskStatusChanged {
                task_id,
                from_status: t.from.to_string(),
                to_status: t.to.to_string(),
            });
        }

        let status = self.status_of(&workspace, &machine);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(drive(inner, workspace, machine, run));
        Ok(status)
    }

    /// Cancel the active run and wait until the task has left its active state.
    pub async fn stop_workflow(&self, id: &WorkspaceId, task_id: Uuid) -> Result<WorkflowStatus> {
        let workspace = self.workspace(id)?;
        let machine = workspace.machine(task_id)?;

        let run = {
            let runs = workspace.lock_runs();
            let run = runs
                .get(&task_id)
                .cloned()
                .ok_or(OrchestratorError::NotRunning(task_id))?;
            // under the runs lock so the pipeline cannot settle in between
            run.cancel_token().cancel();
            run
        };

        info!(task_id = %task_id, stage = %run.stage(), "Workflow stop requested");
        run.wait_finished().await;
        Ok(self.status_of(&workspace, &machine))
    }

    pub fn get_status(&self, id: &WorkspaceId, task_id: Uuid) -> Result<WorkflowStatus> {
        let workspace = self.workspace(id)?;
        let machine = workspace.machine(task_id)?;
        Ok(self.status_of(&workspace, &machine))
    }

    pub fn is_running(&self, id: &WorkspaceId, task_id: Uuid) -> Result<bool> {
        Ok(self.workspace(id)?.is_running(task_id))
    }

    /// Live log of one stage, or a closed log rebuilt from the task's
    /// recorded output once the stage has finished.
    pub fn stage_log(
        &self,
        id: &WorkspaceId,
        task_id: Uuid,
        stage: Stage,
    ) -> Result<Option<Arc<StageLog>>> {
        let machine = self.workspace(id)?.machine(task_id)?;
        if let Some(live) = self.inner.runner.logs().get(task_id, stage) {
            return Ok(Some(live));
        }
        let task = machine.snapshot();
        let recorded = task
            .log(stage)
            .map(|text| Arc::new(StageLog::from_text(task_id, stage, text)));
        Ok(recorded)
    }

    /// Cancel every active run in every workspace and wait for them to settle.
    pub async fn shutdown(&self) {
        let runs: Vec<Arc<WorkflowRun>> = self
            .read_workspaces()
            .values()
            .flat_map(|ws| {
                let runs = ws.lock_runs();
                runs.values().for_each(|run| run.cancel_token().cancel());
                runs.values().cloned().collect::<Vec<_>>()
            })
            .collect();

        if !runs.is_empty() {
            info!(count = runs.len(), "Stopping active workflows");
        }
        for run in runs {
            run.wait_finished().await;
        }
    }

    fn status_of(&self, workspace: &Workspace, machine: &TaskStateMachine) -> WorkflowStatus {
        // read under the runs lock so status and isRunning agree
        let (task, run) = {
            let runs = workspace.lock_runs();
            (machine.snapshot(), runs.get(&machine.id()).cloned())
        };

        let mut logs = task.logs;
        if let Some(run) = &run {
            let stage = run.stage();
            if let Some(live) = self.inner.runner.logs().get(task.id, stage) {
                if !live.is_closed() {
                    logs.insert(stage, live.contents());
                }
            }
        }

        WorkflowStatus {
            task_id: task.id,
            status: task.status,
            workflow_step: task.workflow_step,
            is_running: run.is_some(),
            logs,
        }
    }

    fn read_workspaces(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<WorkspaceId, Arc<Workspace>>> {
        self.inner.workspaces.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("workspaces", &self.read_workspaces().len())
            .finish()
    }
}

/// Run the stage sequence for one task until it settles.
async fn drive(
    inner: Arc<Inner>,
    workspace: Arc<Workspace>,
    machine: Arc<TaskStateMachine>,
    run: Arc<WorkflowRun>,
) {
    let mut guard = RunGuard::new(Arc::clone(&workspace), Arc::clone(&machine), Arc::clone(&run));
    let task_id = machine.id();
    workspace.persist_or_warn().await;

    let mut stage = Stage::Brief;
    let final_status = loop {
        workspace.emit(Event::StageStarted {
            task_id,
            stage: stage.to_string(),
        });

        let outcome = inner
            .runner
            .run(&workspace, &machine, stage, run.cancel_token())
            .await;

        workspace.emit(Event::StageFinished {
            task_id,
            stage: stage.to_string(),
            outcome: outcome.as_str().to_string(),
            success: outcome.is_success(),
        });

        let target = match (&outcome, stage.next()) {
            (StageOutcome::Success, Some(next)) => next.status(),
            (StageOutcome::Success, None) => TaskStatus::Review,
            (StageOutcome::Failure(reason), _) => {
                warn!(task_id = %task_id, stage = %stage, reason = %reason, "Stage failed");
                TaskStatus::Failed
            }
            (StageOutcome::Cancelled, _) => TaskStatus::Cancelled,
        };

        let (status, _) = workspace.advance_run(&machine, &run, stage.status(), target);
        match status.stage() {
            Some(next) if status != stage.status() => {
                run.set_stage(next);
                stage = next;
                workspace.persist_or_warn().await;
            }
            Some(_) => {
                // still active yet not advanced; never loop on the same stage
                error!(task_id = %task_id, status = %status, "Workflow stalled, failing task");
                let (status, _) = workspace.advance_run(&machine, &run, status, TaskStatus::Failed);
                break status;
            }
            None => break status,
        }
    };

    workspace.persist_or_warn().await;
    guard.mark_completed();
    run.mark_finished();
    info!(task_id = %task_id, status = %final_status, "Workflow finished");
}
