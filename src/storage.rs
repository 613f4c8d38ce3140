//! Paths for the git-tracked sync state.
//!
//! braid keeps its distributable state in one directory at the repo root
//! (default `.braid/`, overridable via `sync.export_path`):
//!
//! ```text
//! .braid/
//!   tasks.jsonl       # one self-contained task record per line (tracked)
//!   tasks_meta.json   # sidecar: last export time + content fingerprint
//! ```
//!
//! The sidecar is local bookkeeping; only `tasks.jsonl` needs to be
//! committed for other clones to pick up tasks.

use std::path::{Path, PathBuf};

use crate::config::SyncConfig;
use crate::error::Result;

/// File name of the sidecar metadata next to the export file
pub const META_FILE: &str = "tasks_meta.json";

/// Resolved file layout for one repository
#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
    export_file: PathBuf,
}

impl Workdir {
    pub fn new(root: impl Into<PathBuf>, config: &SyncConfig) -> Self {
        let root = root.into();
        let export_file = root.join(&config.export_path);
        Self { root, export_file }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the tracked JSONL export
    pub fn export_file(&self) -> &Path {
        &self.export_file
    }

    /// Path to the sidecar metadata, a sibling of the export file
    pub fn meta_file(&self) -> PathBuf {
        match self.export_file.parent() {
            Some(parent) => parent.join(META_FILE),
            None => PathBuf::from(META_FILE),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.export_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_default_layout() {
        let workdir = Workdir::new("/repo", &SyncConfig::default());
        assert_eq!(
            workdir.export_file(),
            Path::new("/repo/.braid/tasks.jsonl")
        );
        assert_eq!(
            workdir.meta_file(),
            Path::new("/repo/.braid/tasks_meta.json")
        );
    }

    #[test]
    fn honors_custom_export_path() {
        let config = SyncConfig {
            export_path: "state/work.jsonl".to_string(),
            ..SyncConfig::default()
        };
        let workdir = Workdir::new("/repo", &config);
        assert_eq!(workdir.export_file(), Path::new("/repo/state/work.jsonl"));
        assert_eq!(workdir.meta_file(), Path::new("/repo/state/tasks_meta.json"));
    }
}
