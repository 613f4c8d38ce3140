//! Process-wide engine: the operations surface consumed by the tool-call
//! layer.
//!
//! [`Engine::open`] loads configuration, replays the tracked export into the
//! store before anything else is allowed to run, then serves task and
//! dependency operations behind a single writer lock. Reads run concurrently
//! with each other; every mutation is one logical transaction (validation,
//! cycle check and persistence under one write lock) and signals the sync
//! engine, which debounces exports.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::graph::{BlockedTask, DepTreeNode, TreeDirection};
use crate::model::{
    DepKind, DependencyEdge, ReadyFilter, Task, TaskDraft, TaskFilter, TaskPatch,
};
use crate::storage::Workdir;
use crate::store::Store;
use crate::sync::{ExportReport, ImportReport, SyncEngine, SyncStatus};

/// What `sync_now` should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Import,
    Export,
    Both,
}

/// Combined result of an on-demand sync.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportReport>,
}

struct EngineInner {
    store: Arc<RwLock<Store>>,
    sync: SyncEngine,
    config: Config,
}

/// Shared handle to one repository's task graph. Clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the engine for a repository root.
    ///
    /// Runs the startup import synchronously before returning, so no caller
    /// ever operates on stale data. An unreadable tracked file is fatal
    /// here: a daemon must not serve task operations against a store it
    /// could not reconcile. Skipped (malformed) lines are reported and
    /// logged, not fatal.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let config = Config::load_from_repo(root);
        Self::with_config(root, config)
    }

    /// Open with an explicit configuration, bypassing `.braid.toml`.
    pub fn with_config(root: impl AsRef<Path>, config: Config) -> Result<Self> {
        let store = Arc::new(RwLock::new(Store::new(&config.tasks)));
        let workdir = Workdir::new(root.as_ref(), &config.sync);
        let sync = SyncEngine::start(Arc::clone(&store), workdir, &config.sync)?;

        let report = sync.import()?;
        if !report.skipped_lines.is_empty() {
            warn!(
                skipped = report.skipped_lines.len(),
                "startup import skipped malformed lines"
            );
        }

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                sync,
                config,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // =========================================================================
    // Task operations
    // =========================================================================

    pub fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        let task = self.inner.store.write().create(draft)?;
        self.inner.sync.signal();
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.inner.store.read().get(id).map(Task::clone)
    }

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let task = self.inner.store.write().update(id, patch)?;
        self.inner.sync.signal();
        Ok(task)
    }

    pub fn close_task(&self, id: &str, reason: &str) -> Result<Task> {
        let task = self.inner.store.write().close(id, reason)?;
        self.inner.sync.signal();
        Ok(task)
    }

    pub fn delete_task(&self, id: &str, cascade: bool) -> Result<usize> {
        let removed = self.inner.store.write().delete(id, cascade)?;
        self.inner.sync.signal();
        Ok(removed)
    }

    pub fn list_tasks(&self, filter: &TaskFilter, limit: usize) -> Vec<Task> {
        self.inner.store.read().list(filter, limit)
    }

    // =========================================================================
    // Dependency operations
    // =========================================================================

    pub fn add_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        kind: DepKind,
    ) -> Result<DependencyEdge> {
        let edge = self
            .inner
            .store
            .write()
            .add_dependency(task_id, depends_on, kind)?;
        self.inner.sync.signal();
        Ok(edge)
    }

    pub fn remove_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        kind: Option<DepKind>,
    ) -> usize {
        let removed = self
            .inner
            .store
            .write()
            .remove_dependency(task_id, depends_on, kind);
        if removed > 0 {
            self.inner.sync.signal();
        }
        removed
    }

    pub fn get_blockers(&self, task_id: &str) -> Result<Vec<Task>> {
        self.inner.store.read().get_blockers(task_id)
    }

    pub fn get_blocking(&self, task_id: &str) -> Result<Vec<Task>> {
        self.inner.store.read().get_blocking(task_id)
    }

    pub fn dependency_tree(&self, task_id: &str, direction: TreeDirection) -> Result<DepTreeNode> {
        self.inner.store.read().dependency_tree(task_id, direction)
    }

    pub fn check_cycles(&self) -> Vec<Vec<String>> {
        self.inner.store.read().check_cycles()
    }

    pub fn list_ready(&self, filter: &ReadyFilter, limit: usize) -> Vec<Task> {
        self.inner.store.read().list_ready(filter, limit)
    }

    pub fn list_blocked(&self, limit: usize) -> Vec<BlockedTask> {
        self.inner.store.read().list_blocked(limit)
    }

    // =========================================================================
    // Sync operations
    // =========================================================================

    /// Run import, export, or both immediately.
    pub fn sync_now(&self, mode: SyncMode) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        if matches!(mode, SyncMode::Import | SyncMode::Both) {
            let report = self.inner.sync.import()?;
            if report.changed() {
                // Merged-in changes belong in the next export.
                self.inner.sync.signal();
            }
            outcome.import = Some(report);
        }
        if matches!(mode, SyncMode::Export | SyncMode::Both) {
            outcome.export = Some(self.inner.sync.export()?);
        }
        Ok(outcome)
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.sync.status()
    }
}
