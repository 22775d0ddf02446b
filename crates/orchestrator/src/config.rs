use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

use crate::skills::SkillSource;
use crate::workspace::STATE_DIR;

pub const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How the hydrated skill reaches the agent process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentInput {
    /// Appended as the final command-line argument
    #[default]
    Argument,
    /// Written to stdin, which is then closed
    Stdin,
}

/// External agent command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input: AgentInput,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            input: AgentInput::Argument,
            env: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: AgentInput::Argument,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: AgentInput) -> Self {
        self.input = input;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub agent: AgentConfig,
    pub stage_timeout: Duration,
    pub kill_grace: Duration,
    pub skills: SkillSource,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            skills: SkillSource::Bundled,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_skills(mut self, skills: SkillSource) -> Self {
        self.skills = skills;
        self
    }

    /// Apply per-workspace overrides on top of these defaults.
    pub fn for_workspace(&self, workspace: &WorkspaceConfig) -> Self {
        let mut merged = self.clone();
        if let Some(agent) = &workspace.agent {
            merged.agent = agent.clone();
        }
        if let Some(secs) = workspace.stage_timeout_secs {
            merged.stage_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = workspace.kill_grace_secs {
            merged.kill_grace = Duration::from_secs(secs);
        }
        merged
    }
}

/// Workspace-level configuration stored in .formic/config.json
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_grace_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

impl WorkspaceConfig {
    /// Read config from a workspace root, falling back to defaults
    pub async fn read(root: &Path) -> Self {
        let config_path = root.join(STATE_DIR).join(CONFIG_FILE);

        if !config_path.exists() {
            debug!(path = %config_path.display(), "Config file does not exist, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&config_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    debug!(path = %config_path.display(), "Config loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    pub async fn write(&self, root: &Path) -> std::io::Result<()> {
        let config_dir = root.join(STATE_DIR);
        fs::create_dir_all(&config_dir).await?;

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let config_path = config_dir.join(CONFIG_FILE);
        fs::write(&config_path, content).await?;
        debug!(path = %config_path.display(), "Config saved");

        Ok(())
    }
}
