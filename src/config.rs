use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Top-level herd config.
///
/// Lives as `.herd.toml` in a project root, with an optional global copy at
/// `~/.config/herd/config.toml` that also carries the `[[projects]]` registry
/// used to locate an epic when no `--project` flag is given.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub oob: OobConfig,
    /// Registered projects (global config only).
    #[serde(default)]
    pub projects: Vec<RegisteredProject>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            project: ProjectConfig::default(),
            tools: ToolsConfig::default(),
            agent: AgentConfig::default(),
            oob: OobConfig::default(),
            projects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,
}

/// Companion tool command names. Every external collaborator is configurable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolsConfig {
    #[serde(default = "default_beads")]
    pub beads: String,
    #[serde(default = "default_tmux")]
    pub tmux: String,
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_worktree")]
    pub worktree: String,
}

fn default_beads() -> String {
    "bd".to_string()
}
fn default_tmux() -> String {
    "tmux".to_string()
}
fn default_git() -> String {
    "git".to_string()
}
fn default_worktree() -> String {
    "wt".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            beads: default_beads(),
            tmux: default_tmux(),
            git: default_git(),
            worktree: default_worktree(),
        }
    }
}

/// Worker agent invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Command line used to start the agent inside the session shell.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Per-bead budget in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Optional prompt override. Placeholders: {BEAD_ID}, {TITLE},
    /// {DESCRIPTION}, {SESSION}, {PROJECT}, {WORKTREE}.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Idle-poll interval while a bead is running.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Bounded wait for the shell prompt after kill-agent.
    #[serde(default = "default_prompt_wait_secs")]
    pub prompt_wait_secs: u64,
}

fn default_agent_command() -> String {
    "claude --dangerously-skip-permissions".to_string()
}
fn default_timeout_minutes() -> u64 {
    30
}
fn default_poll_secs() -> u64 {
    10
}
fn default_prompt_wait_secs() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            timeout_minutes: default_timeout_minutes(),
            prompt_template: None,
            poll_secs: default_poll_secs(),
            prompt_wait_secs: default_prompt_wait_secs(),
        }
    }
}

/// Out-of-band message channel. Optional; the runner degrades gracefully
/// when the endpoint is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OobConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_oob_enabled")]
    pub enabled: bool,
}

fn default_oob_enabled() -> bool {
    true
}

impl Default for OobConfig {
    fn default() -> Self {
        Self {
            url: None,
            enabled: default_oob_enabled(),
        }
    }
}

/// A project the orchestrator may drive, for epic lookup without --project.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegisteredProject {
    pub name: String,
    pub dir: PathBuf,
}

impl Config {
    /// Load config from a TOML or JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;

        let config: Config = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)
                .map_err(|e| ExitError::Config(format!("{}: {e}", path.display())))?
        } else {
            toml::from_str(&content)
                .map_err(|e| ExitError::Config(format!("{}: {e}", path.display())))?
        };

        if config.agent.timeout_minutes < 1 {
            return Err(ExitError::Config(format!(
                "{}: agent.timeoutMinutes must be >= 1",
                path.display()
            ))
            .into());
        }

        Ok(config)
    }

    /// Load the global config if one exists.
    pub fn load_global() -> anyhow::Result<Option<Self>> {
        let Some(path) = global_config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::load(&path)?))
    }

    /// Resolve the config for a project directory: `.herd.toml` in the
    /// project root wins, then the global config, then built-in defaults.
    pub fn for_project(project_dir: &Path) -> anyhow::Result<Self> {
        let local = project_dir.join(".herd.toml");
        if local.exists() {
            return Self::load(&local);
        }
        if let Some(global) = Self::load_global()? {
            return Ok(global);
        }
        Ok(Self::default())
    }

    /// Effective project name: config override, else directory basename.
    pub fn project_name(&self, project_dir: &Path) -> String {
        if let Some(ref name) = self.project.name {
            return name.clone();
        }
        project_dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string())
    }

    /// All registered projects: the global registry, or the cwd as a
    /// single implicit entry when no registry exists.
    pub fn registry(&self) -> Vec<RegisteredProject> {
        if !self.projects.is_empty() {
            return self.projects.clone();
        }
        match std::env::current_dir() {
            Ok(cwd) => {
                let name = cwd
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "default".to_string());
                vec![RegisteredProject { name, dir: cwd }]
            }
            Err(_) => Vec::new(),
        }
    }

    /// Look up a registered project by name.
    pub fn find_project(&self, name: &str) -> Option<RegisteredProject> {
        self.registry().into_iter().find(|p| p.name == name)
    }
}

/// Path of the global config file (`~/.config/herd/config.toml`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("herd").join("config.toml"))
}
