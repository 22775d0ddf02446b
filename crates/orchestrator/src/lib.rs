pub mod config;
pub mod error;
pub mod log_stream;
pub mod process;
mod run_guard;
pub mod skills;
pub mod stage_runner;
pub mod state_machine;
pub mod store;
pub mod workflow;
pub mod workspace;

pub use config::{AgentConfig, AgentInput, OrchestratorConfig, WorkspaceConfig};
pub use error::{OrchestratorError, Result};
pub use log_stream::{LogLine, LogStream, LogStreamer, StageLog};
pub use skills::{SkillSource, SkillTemplateResolver, SkillVariables};
pub use stage_runner::{StageOutcome, StageRunner};
pub use state_machine::{TaskStateMachine, Transition};
pub use store::{BoardStore, JsonBoardStore, MemoryBoardStore};
pub use workflow::{WorkflowOrchestrator, WorkflowStatus};
pub use workspace::{WorkflowRun, Workspace, WorkspaceId, WorkspaceLayout, WorkspaceSummary};
