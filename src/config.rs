//! Configuration loading and management
//!
//! Handles parsing of `.braid.toml` configuration files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the repo-level configuration
pub const CONFIG_FILE: &str = ".braid.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Task identity configuration
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Sync engine configuration
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Tasks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Repo-wide task ID prefix
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
}

fn default_id_prefix() -> String {
    "bd".to_string()
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            id_prefix: default_id_prefix(),
        }
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Path of the tracked JSONL export, relative to the repo root
    #[serde(default = "default_export_path")]
    pub export_path: String,

    /// Quiet period before a debounced export runs
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Timeout when acquiring file locks
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_export_path() -> String {
    ".braid/tasks.jsonl".to_string()
}

fn default_debounce_ms() -> u64 {
    5000
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            export_path: default_export_path(),
            debounce_ms: default_debounce_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a specific file
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a repository root, falling back to defaults
    /// when the file is missing or unreadable.
    pub fn load_from_repo(repo_root: &Path) -> Self {
        let path = repo_root.join(CONFIG_FILE);
        if !path.exists() {
            return Config::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "ignoring unreadable config");
                Config::default()
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.tasks.validate()?;
        self.sync.validate()?;
        Ok(())
    }
}

impl TasksConfig {
    fn validate(&self) -> Result<()> {
        let prefix = self.id_prefix.trim();
        if prefix.is_empty() {
            return Err(Error::InvalidConfig(
                "tasks.id_prefix cannot be empty".to_string(),
            ));
        }
        if !prefix.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(Error::InvalidConfig(
                "tasks.id_prefix must be alphanumeric".to_string(),
            ));
        }
        Ok(())
    }
}

impl SyncConfig {
    fn validate(&self) -> Result<()> {
        if self.export_path.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "sync.export_path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
