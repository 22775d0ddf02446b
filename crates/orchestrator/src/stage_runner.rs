use std::path::Path;
use std::sync::Arc;

use formic_core::Stage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentInput;
use crate::error::{OrchestratorError, Result};
use crate::log_stream::{LogStreamer, StageLog};
use crate::process::{run_supervised, AgentCommand, Limits, ProcessExit};
use crate::skills::{SkillTemplateResolver, SkillVariables};
use crate::state_machine::TaskStateMachine;
use crate::workspace::Workspace;

/// Terminal result of one stage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure(String),
    /// Stopped by an explicit request, never a failure
    Cancelled,
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(_) => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// File a stage must leave in the task's documentation folder.
pub fn expected_artifact(stage: Stage) -> Option<&'static str> {
    match stage {
        Stage::Brief => Some("README.md"),
        Stage::Plan => Some("PLAN.md"),
        // execute is judged on its captured output instead
        Stage::Execute => None,
    }
}

/// Runs one pipeline stage for one task.
#[derive(Clone)]
pub struct StageRunner {
    resolver: Arc<SkillTemplateResolver>,
    logs: LogStreamer,
}

impl StageRunner {
    pub fn new(resolver: Arc<SkillTemplateResolver>, logs: LogStreamer) -> Self {
        Self { resolver, logs }
    }

    pub fn resolver(&self) -> &Arc<SkillTemplateResolver> {
        &self.resolver
    }

    pub fn logs(&self) -> &LogStreamer {
        &self.logs
    }

    /// Run `stage` to a terminal outcome.
    ///
    /// Never returns an error: every fault becomes `Failure`. The captured
    /// output is stored on the task and persisted before returning.
    pub async fn run(
        &self,
        workspace: &Workspace,
        machine: &TaskStateMachine,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let task_id = machine.id();
        let log = self.logs.open(task_id, stage);

        let outcome = if cancel.is_cancelled() {
            StageOutcome::Cancelled
        } else {
            match self.execute(workspace, machine, stage, cancel, &log).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(task_id = %task_id, stage = %stage, error = %e, "Stage aborted");
                    StageOutcome::Failure(e.to_string())
                }
            }
        };

        match &outcome {
            StageOutcome::Success => log.push_system(format!("{} stage succeeded", stage)),
            StageOutcome::Failure(reason) => {
                log.push_system(OrchestratorError::stage_failed(stage, reason.as_str()).to_string())
            }
            StageOutcome::Cancelled => log.push_system(format!("{} stage cancelled", stage)),
        };
        log.close();

        machine.record_log(stage, log.contents());
        // the task now holds the text; the registry keeps only running stages
        self.logs.evict(&log);
        workspace.persist_or_warn().await;

        info!(task_id = %task_id, stage = %stage, outcome = outcome.as_str(), "Stage finished");
        outcome
    }

    async fn execute(
        &self,
        workspace: &Workspace,
        machine: &TaskStateMachine,
        stage: Stage,
        cancel: &CancellationToken,
        log: &Arc<StageLog>,
    ) -> Result<StageOutcome> {
        let task = machine.snapshot();
        let root = workspace.root();
        let skill = stage.skill_name();

        let skill_path = self.resolver.resolve(root, skill).await?;
        let vars = SkillVariables::for_task(&task, root);
        let instructions = self.resolver.hydrate(skill, &skill_path, &vars).await?;

        let docs_dir = workspace.layout().docs_dir(&task);
        tokio::fs::create_dir_all(&docs_dir).await?;

        let config = workspace.config();
        let cmd = build_command(workspace, &task.id.to_string(), stage, &skill_path, &docs_dir, instructions);
        log.push_system(format!("launching {} agent: {}", stage, cmd.program));
        debug!(task_id = %task.id, stage = %stage, cwd = %docs_dir.display(), "Launching agent");

        let limits = Limits {
            timeout: config.stage_timeout,
            kill_grace: config.kill_grace,
        };
        let exit = run_supervised(cmd, Arc::clone(log), cancel, limits).await?;

        Ok(match exit {
            ProcessExit::Cancelled => StageOutcome::Cancelled,
            ProcessExit::TimedOut => StageOutcome::Failure(format!(
                "timed out after {}s",
                limits.timeout.as_secs()
            )),
            ProcessExit::Exited(status) if !status.success() => {
                StageOutcome::Failure(format!("agent {}", status))
            }
            ProcessExit::Exited(_) => check_artifact(stage, &docs_dir, log).await?,
        })
    }
}

fn build_command(
    workspace: &Workspace,
    task_id: &str,
    stage: Stage,
    skill_path: &Path,
    docs_dir: &Path,
    instructions: String,
) -> AgentCommand {
    let agent = &workspace.config().agent;

    let mut env: Vec<(String, String)> = agent
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.extend([
        ("FORMIC_STAGE".to_string(), stage.to_string()),
        ("FORMIC_TASK_ID".to_string(), task_id.to_string()),
        ("FORMIC_DOCS_PATH".to_string(), docs_dir.display().to_string()),
        ("FORMIC_SKILL_PATH".to_string(), skill_path.display().to_string()),
        ("FORMIC_WORKSPACE".to_string(), workspace.root().display().to_string()),
    ]);

    let mut args = agent.args.clone();
    let stdin = match agent.input {
        AgentInput::Argument => {
            args.push(instructions);
            None
        }
        AgentInput::Stdin => Some(instructions),
    };

    AgentCommand {
        program: agent.program.clone(),
        args,
        env,
        cwd: docs_dir.to_path_buf(),
        stdin,
    }
}

async fn check_artifact(stage: Stage, docs_dir: &Path, log: &StageLog) -> Result<StageOutcome> {
    match expected_artifact(stage) {
        Some(file) => {
            if tokio::fs::try_exists(docs_dir.join(file)).await? {
                Ok(StageOutcome::Success)
            } else {
                Ok(StageOutcome::Failure(format!("expected artifact {} was not produced", file)))
            }
        }
        None if log.has_process_output() => Ok(StageOutcome::Success),
        None => Ok(StageOutcome::Failure("agent produced no output".to_string())),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, OrchestratorConfig};
    use crate::store::MemoryBoardStore;
    use formic_core::{Priority, Task, TaskStatus};
    use tempfile::TempDir;

    async fn workspace(dir: &TempDir, script: &str) -> Workspace {
        let config = OrchestratorConfig::default()
            .with_agent(AgentConfig::new("sh").with_args(["-c", script]))
            .with_kill_grace(std::time::Duration::from_millis(200));
        Workspace::open_with_store(dir.path(), &config, Arc::new(MemoryBoardStore::new()), None)
            .await
            .unwrap()
    }

    fn runner() -> StageRunner {
        StageRunner::new(Arc::new(SkillTemplateResolver::default()), LogStreamer::new())
    }

    fn briefing_task(ws: &Workspace, context: &str) -> Arc<TaskStateMachine> {
        let machine = ws.insert_task(Task::new("T1", context, Priority::Medium));
        machine.transition(TaskStatus::Briefing).unwrap();
        machine
    }

    #[tokio::test]
    async fn test_success_requires_artifact() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "echo working; echo brief > README.md").await;
        let machine = briefing_task(&ws, "C1");

        let outcome = runner()
            .run(&ws, &machine, Stage::Brief, &CancellationToken::new())
            .await;

        assert_eq!(outcome, StageOutcome::Success);
        let task = machine.snapshot();
        assert!(ws.layout().docs_dir(&task).join("README.md").exists());
        let log = task.log(Stage::Brief).unwrap();
        assert!(log.contains("working"));
        assert!(log.contains("brief stage succeeded"));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_failure() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "echo forgot the file").await;
        let machine = briefing_task(&ws, "C1");

        let outcome = runner()
            .run(&ws, &machine, Stage::Brief, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, StageOutcome::Failure(ref r) if r.contains("README.md")));
        let task = machine.snapshot();
        let log = task.log(Stage::Brief).unwrap();
        assert!(log.contains("forgot the file"));
        assert!(log.contains("Stage brief failed: expected artifact README.md"));
    }

    #[tokio::test]
    async fn test_finished_log_leaves_registry() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "echo done; touch README.md").await;
        let machine = briefing_task(&ws, "C1");
        let runner = runner();

        runner
            .run(&ws, &machine, Stage::Brief, &CancellationToken::new())
            .await;

        assert!(runner.logs().get(machine.id(), Stage::Brief).is_none());
        assert!(runner.logs().is_empty());
        assert!(machine.snapshot().log(Stage::Brief).unwrap().contains("done"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_with_logs() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "echo boom >&2; touch README.md; exit 2").await;
        let machine = briefing_task(&ws, "C1");

        let outcome = runner()
            .run(&ws, &machine, Stage::Brief, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, StageOutcome::Failure(_)));
        assert!(machine.snapshot().log(Stage::Brief).unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_variable_never_launches_agent() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "touch launched; touch README.md").await;
        let machine = briefing_task(&ws, "   ");

        let outcome = runner()
            .run(&ws, &machine, Stage::Brief, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, StageOutcome::Failure(ref r) if r.contains("$TASK_CONTEXT")));
        let task = machine.snapshot();
        assert!(!ws.layout().docs_dir(&task).join("launched").exists());
    }

    #[tokio::test]
    async fn test_execute_needs_output() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "true").await;
        let machine = briefing_task(&ws, "C1");

        let outcome = runner()
            .run(&ws, &machine, Stage::Execute, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, StageOutcome::Failure(ref r) if r.contains("no output")));
    }

    #[tokio::test]
    async fn test_agent_receives_instructions_and_env() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(
            &dir,
            r#"echo "stage=$FORMIC_STAGE"; case "$0" in *"Execute: T1"*) echo got-instructions;; esac"#,
        )
        .await;
        let machine = briefing_task(&ws, "C1");

        runner()
            .run(&ws, &machine, Stage::Execute, &CancellationToken::new())
            .await;

        let task = machine.snapshot();
        let log = task.log(Stage::Execute).unwrap();
        assert!(log.contains("stage=execute"));
        assert!(log.contains("got-instructions"));
    }

    #[tokio::test]
    async fn test_pre_cancelled_stage() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir, "touch README.md").await;
        let machine = briefing_task(&ws, "C1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = runner().run(&ws, &machine, Stage::Brief, &cancel).await;
        assert_eq!(outcome, StageOutcome::Cancelled);
        assert!(machine.snapshot().log(Stage::Brief).unwrap().contains("brief stage cancelled"));
    }

    #[test]
    fn test_expected_artifacts() {
        assert_eq!(expected_artifact(Stage::Brief), Some("README.md"));
        assert_eq!(expected_artifact(Stage::Plan), Some("PLAN.md"));
        assert_eq!(expected_artifact(Stage::Execute), None);
    }
}
