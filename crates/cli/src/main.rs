use std::future::IntoFuture;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use formic_core::{Stage, TaskStatus};
use orchestrator::config::CONFIG_FILE;
use orchestrator::{
    AgentConfig, BoardStore, JsonBoardStore, OrchestratorConfig, SkillSource,
    WorkflowOrchestrator, WorkspaceConfig, WorkspaceLayout,
};
use server::{create_router, state::AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 8000;

#[derive(Parser)]
#[command(name = "formic")]
#[command(about = "Task board that drives agents through Brief, Plan and Execute", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Workspace root opened at startup
    #[arg(short, long, env = "WORKSPACE_PATH", global = true)]
    workspace: Option<PathBuf>,

    /// Agent program, replacing the default `claude`
    #[arg(long, env = "FORMIC_AGENT", global = true)]
    agent: Option<String>,

    /// Directory of `<skill>/SKILL.md` templates instead of the bundled set
    #[arg(long, env = "FORMIC_SKILLS_DIR", global = true)]
    skills_dir: Option<PathBuf>,

    /// Static UI files served for unmatched routes
    #[arg(long, global = true)]
    ui_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    stage_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Create .formic and provision skills in the workspace
    Init,
    /// Print the workspace board
    Status,
    /// Overwrite provisioned skills with the current templates
    Reprovision {
        /// Skills to refresh; all stage skills when omitted
        skills: Vec<String>,
    },
}

impl Cli {
    fn workspace_root(&self) -> Result<PathBuf> {
        match &self.workspace {
            Some(path) => Ok(path.clone()),
            None => std::env::current_dir().context("Failed to read current directory"),
        }
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        if let Some(program) = &self.agent {
            config = config.with_agent(AgentConfig {
                program: program.clone(),
                ..AgentConfig::default()
            });
        }
        if let Some(dir) = &self.skills_dir {
            config = config.with_skills(SkillSource::Directory(dir.clone()));
        }
        if let Some(secs) = self.stage_timeout_secs {
            config = config.with_stage_timeout(Duration::from_secs(secs));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Init) => init_workspace(&cli.workspace_root()?, cli.orchestrator_config()).await,
        Some(Commands::Status) => status(&cli.workspace_root()?).await,
        Some(Commands::Reprovision { skills }) => {
            reprovision(&cli.workspace_root()?, cli.orchestrator_config(), skills).await
        }
        Some(Commands::Serve) | None => serve(&cli).await,
    }
}

async fn init_workspace(root: &Path, config: OrchestratorConfig) -> Result<()> {
    let orchestrator = WorkflowOrchestrator::new(config);
    let workspace = orchestrator
        .open_workspace(root)
        .await
        .with_context(|| format!("Failed to open workspace {}", root.display()))?;
    let skills = orchestrator.provision_skills(workspace.id()).await?;

    let layout = workspace.layout();
    let config_path = layout.state_dir().join(CONFIG_FILE);
    if !config_path.exists() {
        WorkspaceConfig {
            project_name: Some(layout.name()),
            ..Default::default()
        }
        .write(layout.root())
        .await
        .context("Failed to write workspace config")?;
    }

    println!("Initialized Formic in {}", layout.root().display());
    println!();
    println!("  {}", layout.board_file().display());
    println!("  {}", config_path.display());
    for skill in skills {
        println!("  {}", skill.display());
    }
    println!();
    println!("Run 'formic serve' to start the server");

    Ok(())
}

async fn reprovision(root: &Path, config: OrchestratorConfig, skills: &[String]) -> Result<()> {
    let orchestrator = WorkflowOrchestrator::new(config);
    let workspace = orchestrator
        .open_workspace(root)
        .await
        .with_context(|| format!("Failed to open workspace {}", root.display()))?;

    let skills: Vec<&str> = if skills.is_empty() {
        Stage::ALL.iter().map(|stage| stage.skill_name()).collect()
    } else {
        skills.iter().map(String::as_str).collect()
    };
    for skill in skills {
        let path = orchestrator
            .reprovision_skill(workspace.id(), skill)
            .await
            .with_context(|| format!("Failed to reprovision skill '{}'", skill))?;
        println!("  {}", path.display());
    }
    Ok(())
}

/// Reads the persisted board without opening the workspace, so a running
/// server's tasks are left alone.
async fn status(root: &Path) -> Result<()> {
    let layout = WorkspaceLayout::new(root);
    let board = JsonBoardStore::new(layout.board_file())
        .load()
        .await
        .context("Failed to read board")?;

    let Some(board) = board else {
        println!("Not a Formic workspace: {}", root.display());
        println!("Run 'formic init' to initialize.");
        return Ok(());
    };

    println!();
    println!("Project: {}", board.meta.project_name);
    println!("Path:    {}", root.display());
    println!();

    if board.tasks.is_empty() {
        println!("No tasks yet.");
    } else {
        println!("Tasks ({}):", board.tasks.len());
        for task in &board.tasks {
            println!(
                "  {} [{}] {}",
                status_icon(task.status),
                task.status,
                task.title
            );
        }
    }
    println!();

    Ok(())
}

fn status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "○",
        TaskStatus::Briefing | TaskStatus::Planning => "◐",
        TaskStatus::Running => "◑",
        TaskStatus::Review => "◕",
        TaskStatus::Done => "●",
        TaskStatus::Failed => "✗",
        TaskStatus::Cancelled => "⊘",
    }
}

async fn serve(cli: &Cli) -> Result<()> {
    init_tracing();

    let root = cli.workspace_root()?;
    let mut state = AppState::new(cli.orchestrator_config());
    if let Some(ui_dir) = &cli.ui_dir {
        state = state.with_app_dir(ui_dir.clone());
    }

    let workspace = state
        .open_workspace(&root)
        .await
        .with_context(|| format!("Failed to open workspace {}", root.display()))?;
    let orchestrator = state.orchestrator.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("Failed to bind port {}", cli.port))?;

    tracing::info!(
        workspace = %workspace.id(),
        agent = %orchestrator.config().agent.program,
        "Formic listening on {}",
        listener.local_addr()?
    );
    println!();
    println!("Formic - {}", workspace.meta().project_name);
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://localhost:{}", cli.port);
    println!("  OpenAPI:     http://localhost:{}/api/openapi.json", cli.port);
    println!("  Workspace:   {}", workspace.root().display());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result.context("Server error")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "formic=info,orchestrator=info,server=info,tower_http=info".into()),
        )
        .init();
}
