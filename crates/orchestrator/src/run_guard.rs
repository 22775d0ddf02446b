//! RAII guard for workflow run lifecycle.
//!
//! If the pipeline future is dropped or panics before settling, the guard
//! fails the task and unregisters the run so it can never stay "running".

use std::sync::Arc;

use formic_core::TaskStatus;
use tracing::{debug, warn};

use crate::state_machine::TaskStateMachine;
use crate::workspace::{WorkflowRun, Workspace};

pub(crate) struct RunGuard {
    workspace: Arc<Workspace>,
    machine: Arc<TaskStateMachine>,
    run: Arc<WorkflowRun>,
    completed: bool,
}

impl RunGuard {
    pub(crate) fn new(
        workspace: Arc<Workspace>,
        machine: Arc<TaskStateMachine>,
        run: Arc<WorkflowRun>,
    ) -> Self {
        debug!(task_id = %run.task_id(), "Run guard created");
        Self {
            workspace,
            machine,
            run,
            completed: false,
        }
    }

    /// The pipeline settled the run itself.
    pub(crate) fn mark_completed(&mut self) {
        self.completed = true;
    }

    #[cfg(test)]
    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        // a run already released settled its task; leave that status alone
        if self.workspace.is_running(self.run.task_id()) {
            let stage = self.run.stage();
            warn!(
                task_id = %self.run.task_id(),
                stage = %stage,
                "Run guard dropped without completion, failing task"
            );
            self.workspace
                .advance_run(&self.machine, &self.run, stage.status(), TaskStatus::Failed);
        }
        self.run.mark_finished();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let workspace = Arc::clone(&self.workspace);
            handle.spawn(async move { workspace.persist_or_warn().await });
        }
    }
}
