//! Skill template resolution and hydration.
//!
//! Canonical templates are copied into `<workspace>/.claude/commands/<skill>/SKILL.md`
//! on first use and reused afterwards. Hydration substitutes `$NAME` tokens.

pub mod templates;

use formic_core::{Stage, Task};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::store::write_atomic;

/// Workspace-relative directory of the resolved skill cache.
pub const SKILLS_DIR: &str = ".claude/commands";
pub const SKILL_FILE: &str = "SKILL.md";

pub const TASK_TITLE: &str = "TASK_TITLE";
pub const TASK_CONTEXT: &str = "TASK_CONTEXT";
pub const TASK_DOCS_PATH: &str = "TASK_DOCS_PATH";
pub const TASK_ID: &str = "TASK_ID";
pub const TASK_PRIORITY: &str = "TASK_PRIORITY";
pub const WORKSPACE_PATH: &str = "WORKSPACE_PATH";

/// Where canonical templates are read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SkillSource {
    #[default]
    Bundled,
    /// A directory laid out as `<dir>/<skill>/SKILL.md`
    Directory(PathBuf),
}

/// Variables that must carry a non-blank value before a skill may run.
pub fn required_variables(skill: &str) -> &'static [&'static str] {
    match skill {
        "brief" | "plan" => &[TASK_TITLE, TASK_CONTEXT, TASK_DOCS_PATH],
        "execute" => &[TASK_TITLE, TASK_DOCS_PATH],
        _ => &[],
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillVariables {
    values: BTreeMap<String, String>,
}

impl SkillVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_task(task: &Task, workspace_root: &Path) -> Self {
        let docs = workspace_root.join(&task.docs_path);
        Self::new()
            .with(TASK_TITLE, &task.title)
            .with(TASK_CONTEXT, &task.context)
            .with(TASK_DOCS_PATH, docs.display().to_string())
            .with(TASK_ID, task.id.to_string())
            .with(TASK_PRIORITY, task.priority.as_str())
            .with(WORKSPACE_PATH, workspace_root.display().to_string())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Fail with the first required variable that is absent or blank.
    pub fn check_required(&self, skill: &str) -> Result<()> {
        for name in required_variables(skill) {
            match self.get(name) {
                Some(value) if !value.trim().is_empty() => {}
                _ => return Err(OrchestratorError::missing_variable(skill, *name)),
            }
        }
        Ok(())
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$([A-Z][A-Z0-9_]*)").expect("valid placeholder regex"))
}

/// Substitute every known `$NAME` token; unknown tokens are kept verbatim.
pub fn hydrate_str(template: &str, vars: &SkillVariables) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub struct SkillTemplateResolver {
    source: SkillSource,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    copies: AtomicUsize,
}

impl SkillTemplateResolver {
    pub fn new(source: SkillSource) -> Self {
        Self {
            source,
            locks: Mutex::new(HashMap::new()),
            copies: AtomicUsize::new(0),
        }
    }

    pub fn source(&self) -> &SkillSource {
        &self.source
    }

    pub fn skill_path(workspace_root: &Path, skill: &str) -> PathBuf {
        workspace_root.join(SKILLS_DIR).join(skill).join(SKILL_FILE)
    }

    /// Number of template copies performed since creation.
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Return the workspace-local copy of `skill`, materializing it on first use.
    ///
    /// An existing copy is never replaced, even if the canonical template changed.
    pub async fn resolve(&self, workspace_root: &Path, skill: &str) -> Result<PathBuf> {
        let target = Self::skill_path(workspace_root, skill);
        if fs::try_exists(&target).await? {
            debug!(skill, path = %target.display(), "Skill cache hit");
            return Ok(target);
        }

        let lock = self.lock_for(&target);
        let _guard = lock.lock().await;

        // another caller may have finished the copy while we waited
        if fs::try_exists(&target).await? {
            debug!(skill, path = %target.display(), "Skill resolved by concurrent caller");
            return Ok(target);
        }

        let content = self.canonical(skill).await?;
        self.write_copy(&target, &content).await?;
        info!(skill, path = %target.display(), "Skill provisioned");
        Ok(target)
    }

    /// Overwrite the cached copy with the current canonical template.
    pub async fn reprovision(&self, workspace_root: &Path, skill: &str) -> Result<PathBuf> {
        let target = Self::skill_path(workspace_root, skill);
        let lock = self.lock_for(&target);
        let _guard = lock.lock().await;

        let content = self.canonical(skill).await?;
        self.write_copy(&target, &content).await?;
        info!(skill, path = %target.display(), "Skill reprovisioned");
        Ok(target)
    }

    /// Resolve the skill for every pipeline stage.
    pub async fn provision_all(&self, workspace_root: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            paths.push(self.resolve(workspace_root, stage.skill_name()).await?);
        }
        Ok(paths)
    }

    /// Read a resolved skill and substitute its variables.
    ///
    /// Required variables are checked first so an incomplete skill never
    /// reaches an agent.
    pub async fn hydrate(&self, skill: &str, path: &Path, vars: &SkillVariables) -> Result<String> {
        vars.check_required(skill)?;
        let template = fs::read_to_string(path).await?;
        Ok(hydrate_str(&template, vars))
    }

    async fn canonical(&self, skill: &str) -> Result<String> {
        match &self.source {
            SkillSource::Bundled => templates::bundled(skill)
                .map(str::to_string)
                .ok_or_else(|| OrchestratorError::UnknownSkill(skill.to_string())),
            SkillSource::Directory(dir) => {
                let path = dir.join(skill).join(SKILL_FILE);
                match fs::read_to_string(&path).await {
                    Ok(content) => Ok(content),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(OrchestratorError::UnknownSkill(skill.to_string()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn write_copy(&self, target: &Path, content: &str) -> Result<()> {
        write_atomic(target, content.as_bytes()).await?;
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lock_for(&self, target: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(target.to_path_buf()).or_default())
    }
}

impl Default for SkillTemplateResolver {
    fn default() -> Self {
        Self::new(SkillSource::Bundled)
    }
}

impl std::fmt::Debug for SkillTemplateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillTemplateResolver")
            .field("source", &self.source)
            .field("copies", &self.copy_count())
            .finish()
    }
}
