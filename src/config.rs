use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// User-editable options, persisted as JSON at `~/.claude-squad/config.json`.
/// Missing fields take the documented defaults; unknown fields are ignored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    /// Program to run when a new instance doesn't specify one.
    #[serde(default = "default_program")]
    pub default_program: String,
    /// Default AutoYes value for new instances.
    #[serde(default)]
    pub auto_yes: bool,
    /// AutoYes daemon tick period, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub daemon_poll_interval: u64,
    /// Prefix for generated branch names. The literal `{username}` is
    /// substituted with the current OS user name at read time.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Repo-relative paths copied into every new worktree (typically
    /// gitignored secrets like `.env`).
    #[serde(default)]
    pub copy_on_create: Vec<String>,
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_branch_prefix() -> String {
    "{username}/".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_program: default_program(),
            auto_yes: false,
            daemon_poll_interval: default_poll_interval(),
            branch_prefix: default_branch_prefix(),
            copy_on_create: Vec::new(),
        }
    }
}

/// Application state directory: `~/.claude-squad/`
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-squad")
}

/// Config file path: `~/.claude-squad/config.json`
pub fn config_path() -> PathBuf {
    app_dir().join("config.json")
}

fn os_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string())
}

impl Config {
    /// Load from the default location. A missing file yields defaults
    /// (it is created on the first save, not here).
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save to the default location, creating `~/.claude-squad/` as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Atomic write: temp sibling then rename.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write config: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename config into place: {}", path.display()))?;
        Ok(())
    }

    /// Branch prefix with `{username}` resolved against the OS user name.
    pub fn resolved_branch_prefix(&self) -> String {
        self.branch_prefix.replace("{username}", &os_username())
    }
}
