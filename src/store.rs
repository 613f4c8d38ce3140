//! The indexed in-memory task store.
//!
//! `Store` owns the task map and the dependency edge set as one unit so that
//! mutations, cycle checks and readiness queries always observe a consistent
//! snapshot. Callers serialize access through [`crate::engine::Engine`],
//! which holds the store behind a single writer lock.
//!
//! Task operations live here; dependency and traversal operations live in
//! [`crate::graph`] as a second `impl Store` block.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::config::TasksConfig;
use crate::error::{Error, Result};
use crate::model::{
    sort_for_listing, DepKind, DependencyEdge, Task, TaskDraft, TaskFilter, TaskPatch, TaskStatus,
    DEFAULT_PRIORITY, MAX_PRIORITY,
};
use crate::task_id;

pub(crate) type EdgeKey = (String, String, DepKind);

#[derive(Debug)]
pub struct Store {
    id_prefix: String,
    pub(crate) tasks: BTreeMap<String, Task>,
    /// parent id -> direct child ids
    pub(crate) children: HashMap<String, BTreeSet<String>>,
    pub(crate) edges: BTreeMap<EdgeKey, DependencyEdge>,
    /// blocks-kind adjacency: task -> the tasks it depends on
    pub(crate) blockers_of: HashMap<String, BTreeSet<String>>,
    /// blocks-kind adjacency: task -> the tasks that depend on it
    pub(crate) dependents_of: HashMap<String, BTreeSet<String>>,
}

impl Store {
    pub fn new(config: &TasksConfig) -> Self {
        Self {
            id_prefix: config.id_prefix.trim().to_string(),
            tasks: BTreeMap::new(),
            children: HashMap::new(),
            edges: BTreeMap::new(),
            blockers_of: HashMap::new(),
            dependents_of: HashMap::new(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Create a task. Tasks with a parent receive the next free child id
    /// under that parent; root tasks receive a fresh hash-derived id.
    pub fn create(&mut self, draft: TaskDraft) -> Result<Task> {
        let title = draft.title.trim().to_string();
        if title.is_empty() {
            return Err(Error::Validation("title cannot be empty".to_string()));
        }
        let project_id = draft.project_id.trim().to_string();
        if project_id.is_empty() {
            return Err(Error::Validation("project_id cannot be empty".to_string()));
        }
        let priority = draft.priority.unwrap_or(DEFAULT_PRIORITY);
        validate_priority(priority)?;

        if let Some(parent_id) = &draft.parent_task_id {
            let parent = self.tasks.get(parent_id).ok_or_else(|| {
                Error::Validation(format!("parent task not found: {parent_id}"))
            })?;
            if parent.project_id != project_id {
                return Err(Error::Validation(format!(
                    "parent task {parent_id} belongs to project {}, not {project_id}",
                    parent.project_id
                )));
            }
        }

        let id = match &draft.parent_task_id {
            Some(parent_id) => self.next_child_id(parent_id),
            None => self.fresh_root_id(&project_id)?,
        };

        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            project_id,
            title,
            status: TaskStatus::Open,
            priority,
            kind: draft.kind.unwrap_or_default(),
            description: draft.description,
            parent_task_id: draft.parent_task_id,
            assignee: draft.assignee,
            labels: draft.labels,
            closed_reason: None,
            discovered_in_session_id: draft.discovered_in_session_id,
            created_at: now,
            updated_at: now,
        };

        if let Some(parent_id) = task.parent_task_id.clone() {
            self.children.entry(parent_id).or_default().insert(id.clone());
        }
        self.tasks.insert(id.clone(), task.clone());
        debug!(task = %id, "created task");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Apply a partial update, re-validating the merged record against the
    /// same constraints as `create`.
    pub fn update(&mut self, id: &str, patch: TaskPatch) -> Result<Task> {
        let current = self.get(id)?.clone();
        let mut next = current.clone();

        if let Some(title) = patch.title {
            next.title = title.trim().to_string();
        }
        if let Some(description) = patch.description {
            next.description = Some(description);
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        if let Some(kind) = patch.kind {
            next.kind = kind;
        }
        if let Some(parent_id) = patch.parent_task_id {
            next.parent_task_id = Some(parent_id);
        }
        if let Some(assignee) = patch.assignee {
            next.assignee = Some(assignee);
        }
        if let Some(labels) = patch.labels {
            next.labels = labels;
        }
        if let Some(reason) = patch.closed_reason {
            next.closed_reason = Some(reason);
        }

        if next.title.is_empty() {
            return Err(Error::Validation("title cannot be empty".to_string()));
        }
        validate_priority(next.priority)?;
        if next.status.is_closed() && next.closed_reason.is_none() {
            return Err(Error::Validation(
                "closing a task requires a closed_reason".to_string(),
            ));
        }
        if let Some(parent_id) = &next.parent_task_id {
            if parent_id == id {
                return Err(Error::Validation(format!(
                    "task {id} cannot be its own parent"
                )));
            }
            let parent = self.tasks.get(parent_id).ok_or_else(|| {
                Error::Validation(format!("parent task not found: {parent_id}"))
            })?;
            if parent.project_id != next.project_id {
                return Err(Error::Validation(format!(
                    "parent task {parent_id} belongs to project {}, not {}",
                    parent.project_id, next.project_id
                )));
            }
            if self.is_ancestor(id, parent_id) {
                return Err(Error::Validation(format!(
                    "task {id} cannot be its own ancestor"
                )));
            }
        }

        bump_updated_at(&mut next);
        self.reindex_parent(&current, &next);
        self.tasks.insert(id.to_string(), next.clone());
        debug!(task = %id, "updated task");
        Ok(next)
    }

    /// Close a task, recording the reason. Idempotent: closing an
    /// already-closed task refreshes the reason and timestamp.
    pub fn close(&mut self, id: &str, reason: &str) -> Result<Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        task.status = TaskStatus::Closed;
        task.closed_reason = Some(reason.to_string());
        bump_updated_at(task);
        debug!(task = %id, "closed task");
        Ok(task.clone())
    }

    /// Delete a task. Without `cascade` the call fails when children or
    /// incident edges exist, naming them; with `cascade` the task, its
    /// descendants and every edge touching the removed set go in one step.
    /// Returns the number of tasks removed.
    pub fn delete(&mut self, id: &str, cascade: bool) -> Result<usize> {
        self.get(id)?;

        if !cascade {
            let children: Vec<String> = self
                .children
                .get(id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            let edges = self.incident_edge_count(id);
            if !children.is_empty() || edges > 0 {
                return Err(Error::Conflict(format!(
                    "cannot delete {id}: {} child task(s) [{}], {} incident dependency edge(s); \
                     delete with cascade to remove them",
                    children.len(),
                    children.join(", "),
                    edges
                )));
            }
        }

        // Collect the task and all descendants.
        let mut doomed: HashSet<String> = HashSet::new();
        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            if !doomed.insert(current.clone()) {
                continue;
            }
            if let Some(kids) = self.children.get(&current) {
                pending.extend(kids.iter().cloned());
            }
        }

        let stale_edges: Vec<EdgeKey> = self
            .edges
            .keys()
            .filter(|(from, to, _)| doomed.contains(from) || doomed.contains(to))
            .cloned()
            .collect();
        for key in &stale_edges {
            self.remove_edge_key(key);
        }

        for task_id in &doomed {
            if let Some(task) = self.tasks.remove(task_id) {
                if let Some(parent_id) = task.parent_task_id {
                    if let Some(set) = self.children.get_mut(&parent_id) {
                        set.remove(task_id);
                        if set.is_empty() {
                            self.children.remove(&parent_id);
                        }
                    }
                }
            }
            self.children.remove(task_id);
        }

        debug!(task = %id, removed = doomed.len(), edges = stale_edges.len(), "deleted task");
        Ok(doomed.len())
    }

    /// List tasks matching `filter`, ordered by priority then creation time.
    pub fn list(&self, filter: &TaskFilter, limit: usize) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        sort_for_listing(&mut out);
        out.truncate(limit);
        out
    }

    // =========================================================================
    // Import support (see crate::sync)
    // =========================================================================

    /// Insert a task exactly as recorded, preserving its timestamps.
    pub(crate) fn adopt_task(&mut self, mut task: Task) {
        if task.updated_at < task.created_at {
            task.updated_at = task.created_at;
        }
        if let Some(parent_id) = task.parent_task_id.clone() {
            self.children
                .entry(parent_id)
                .or_default()
                .insert(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    /// Last-write-wins overwrite of an existing record's mutable fields.
    /// Identifier, project and creation time are never altered by merge.
    pub(crate) fn overwrite_from(&mut self, incoming: Task) {
        let Some(existing) = self.tasks.get(&incoming.id) else {
            return;
        };
        let merged = Task {
            id: existing.id.clone(),
            project_id: existing.project_id.clone(),
            created_at: existing.created_at,
            updated_at: incoming.updated_at.max(existing.created_at),
            discovered_in_session_id: existing
                .discovered_in_session_id
                .clone()
                .or(incoming.discovered_in_session_id),
            title: incoming.title,
            status: incoming.status,
            priority: incoming.priority,
            kind: incoming.kind,
            description: incoming.description,
            parent_task_id: incoming.parent_task_id,
            assignee: incoming.assignee,
            labels: incoming.labels,
            closed_reason: incoming.closed_reason,
        };
        let old = self.tasks.get(&merged.id).cloned();
        if let Some(old) = old {
            self.reindex_parent(&old, &merged);
        }
        self.tasks.insert(merged.id.clone(), merged);
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn fresh_root_id(&self, project_id: &str) -> Result<String> {
        for _ in 0..task_id::MAX_ID_ATTEMPTS {
            let id = task_id::new_task_id(&self.id_prefix, project_id);
            if !self.tasks.contains_key(&id) {
                return Ok(id);
            }
        }
        // Repeated collisions mean the entropy source is broken, not that
        // the id space is contended.
        Err(Error::Integrity(format!(
            "task id generation exhausted after {} attempts",
            task_id::MAX_ID_ATTEMPTS
        )))
    }

    fn next_child_id(&self, parent_id: &str) -> String {
        let mut n = 1;
        loop {
            let candidate = task_id::child_id(parent_id, n);
            if !self.tasks.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// True when `id` appears in the parent chain above `start`.
    fn is_ancestor(&self, id: &str, start: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = Some(start);
        while let Some(node) = current {
            if node == id {
                return true;
            }
            if !seen.insert(node) {
                // Parent chain loops; refuse rather than spin.
                return true;
            }
            current = self
                .tasks
                .get(node)
                .and_then(|task| task.parent_task_id.as_deref());
        }
        false
    }

    fn reindex_parent(&mut self, old: &Task, new: &Task) {
        if old.parent_task_id == new.parent_task_id {
            return;
        }
        if let Some(parent_id) = &old.parent_task_id {
            if let Some(set) = self.children.get_mut(parent_id) {
                set.remove(&old.id);
                if set.is_empty() {
                    self.children.remove(parent_id);
                }
            }
        }
        if let Some(parent_id) = new.parent_task_id.clone() {
            self.children
                .entry(parent_id)
                .or_default()
                .insert(new.id.clone());
        }
    }

    pub(crate) fn incident_edge_count(&self, id: &str) -> usize {
        self.edges
            .keys()
            .filter(|(from, to, _)| from == id || to == id)
            .count()
    }
}

fn validate_priority(priority: u8) -> Result<()> {
    if priority > MAX_PRIORITY {
        return Err(Error::Validation(format!(
            "priority {priority} out of range (expected 0-{MAX_PRIORITY})"
        )));
    }
    Ok(())
}

/// Refresh `updated_at`, keeping it monotonically non-decreasing.
fn bump_updated_at(task: &mut Task) {
    let now = Utc::now();
    task.updated_at = now.max(task.updated_at).max(task.created_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskKind;

    fn store() -> Store {
        Store::new(&TasksConfig::default())
    }

    #[test]
    fn create_assigns_defaults() {
        let mut store = store();
        let task = store
            .create(TaskDraft::new("proj", "Write parser"))
            .expect("create");
        assert!(task.id.starts_with("bd-"));
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.kind, TaskKind::Task);
        assert!(task.updated_at >= task.created_at);
    }

    #[test]
    fn create_rejects_invalid_fields() {
        let mut store = store();
        let err = store.create(TaskDraft::new("proj", "  ")).expect_err("empty title");
        assert_eq!(err.kind(), "validation");

        let mut draft = TaskDraft::new("proj", "Task");
        draft.priority = Some(5);
        let err = store.create(draft).expect_err("priority range");
        assert_eq!(err.kind(), "validation");

        let mut draft = TaskDraft::new("proj", "Task");
        draft.parent_task_id = Some("bd-missing".to_string());
        let err = store.create(draft).expect_err("missing parent");
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn create_rejects_cross_project_parent() {
        let mut store = store();
        let parent = store.create(TaskDraft::new("proj-a", "Parent")).expect("parent");
        let mut draft = TaskDraft::new("proj-b", "Child");
        draft.parent_task_id = Some(parent.id);
        let err = store.create(draft).expect_err("cross project");
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn children_get_dotted_ids() {
        let mut store = store();
        let parent = store.create(TaskDraft::new("proj", "Parent")).expect("parent");

        let mut draft = TaskDraft::new("proj", "First child");
        draft.parent_task_id = Some(parent.id.clone());
        let first = store.create(draft).expect("child");
        assert_eq!(first.id, format!("{}.1", parent.id));

        let mut draft = TaskDraft::new("proj", "Second child");
        draft.parent_task_id = Some(parent.id.clone());
        let second = store.create(draft).expect("child");
        assert_eq!(second.id, format!("{}.2", parent.id));

        // Deleting the first child frees its ordinal.
        store.delete(&first.id, false).expect("delete");
        let mut draft = TaskDraft::new("proj", "Third child");
        draft.parent_task_id = Some(parent.id.clone());
        let third = store.create(draft).expect("child");
        assert_eq!(third.id, format!("{}.1", parent.id));
    }

    #[test]
    fn bulk_creation_never_exhausts_ids() {
        let mut store = store();
        for i in 0..10_000 {
            store
                .create(TaskDraft::new("proj", format!("Task {i}")))
                .expect("collisions regenerate silently");
        }
        assert_eq!(store.task_count(), 10_000);
    }

    #[test]
    fn update_applies_only_supplied_fields() {
        let mut store = store();
        let task = store.create(TaskDraft::new("proj", "Original")).expect("create");

        let patch = TaskPatch {
            priority: Some(0),
            assignee: Some("agent-7".to_string()),
            ..TaskPatch::default()
        };
        let updated = store.update(&task.id, patch).expect("update");
        assert_eq!(updated.title, "Original");
        assert_eq!(updated.priority, 0);
        assert_eq!(updated.assignee.as_deref(), Some("agent-7"));
        assert!(updated.updated_at >= task.updated_at);
    }

    #[test]
    fn update_rejects_parent_cycles() {
        let mut store = store();
        let a = store.create(TaskDraft::new("proj", "A")).expect("a");
        let mut draft = TaskDraft::new("proj", "B");
        draft.parent_task_id = Some(a.id.clone());
        let b = store.create(draft).expect("b");

        let patch = TaskPatch {
            parent_task_id: Some(b.id.clone()),
            ..TaskPatch::default()
        };
        let err = store.update(&a.id, patch).expect_err("ancestor cycle");
        assert_eq!(err.kind(), "validation");

        let patch = TaskPatch {
            parent_task_id: Some(a.id.clone()),
            ..TaskPatch::default()
        };
        let err = store.update(&a.id, patch).expect_err("self parent");
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn update_to_closed_requires_reason() {
        let mut store = store();
        let task = store.create(TaskDraft::new("proj", "Task")).expect("create");
        let patch = TaskPatch {
            status: Some(TaskStatus::Closed),
            ..TaskPatch::default()
        };
        let err = store.update(&task.id, patch).expect_err("no reason");
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn close_is_idempotent() {
        let mut store = store();
        let task = store.create(TaskDraft::new("proj", "Task")).expect("create");
        let closed = store.close(&task.id, "done").expect("close");
        assert!(closed.status.is_closed());
        assert_eq!(closed.closed_reason.as_deref(), Some("done"));

        let again = store.close(&task.id, "verified").expect("close again");
        assert!(again.status.is_closed());
        assert_eq!(again.closed_reason.as_deref(), Some("verified"));
    }

    #[test]
    fn closing_a_parent_leaves_children_open() {
        let mut store = store();
        let parent = store.create(TaskDraft::new("proj", "Parent")).expect("parent");
        let mut draft = TaskDraft::new("proj", "Child");
        draft.parent_task_id = Some(parent.id.clone());
        let child = store.create(draft).expect("child");

        store.close(&parent.id, "scoped out").expect("close");
        assert_eq!(store.get(&child.id).expect("child").status, TaskStatus::Open);
    }

    #[test]
    fn delete_without_cascade_names_blockers() {
        let mut store = store();
        let parent = store.create(TaskDraft::new("proj", "Parent")).expect("parent");
        let mut draft = TaskDraft::new("proj", "Child");
        draft.parent_task_id = Some(parent.id.clone());
        let child = store.create(draft).expect("child");

        let err = store.delete(&parent.id, false).expect_err("has child");
        assert_eq!(err.kind(), "conflict");
        assert!(err.to_string().contains(&child.id));
    }

    #[test]
    fn cascade_delete_removes_descendants_and_edges() {
        let mut store = store();
        let parent = store.create(TaskDraft::new("proj", "Parent")).expect("parent");
        let mut draft = TaskDraft::new("proj", "Child");
        draft.parent_task_id = Some(parent.id.clone());
        let child = store.create(draft).expect("child");
        let mut draft = TaskDraft::new("proj", "Grandchild");
        draft.parent_task_id = Some(child.id.clone());
        let grandchild = store.create(draft).expect("grandchild");
        let outside = store.create(TaskDraft::new("proj", "Outside")).expect("outside");

        store
            .add_dependency(&outside.id, &grandchild.id, DepKind::Blocks)
            .expect("edge");

        let removed = store.delete(&parent.id, true).expect("cascade");
        assert_eq!(removed, 3);
        assert_eq!(store.task_count(), 1);
        assert_eq!(store.edge_count(), 0);
        assert_eq!(store.incident_edge_count(&outside.id), 0);
    }

    #[test]
    fn list_filters_and_orders() {
        let mut store = store();
        let mut draft = TaskDraft::new("proj", "Low");
        draft.priority = Some(3);
        store.create(draft).expect("low");
        let mut draft = TaskDraft::new("proj", "High");
        draft.priority = Some(0);
        let high = store.create(draft).expect("high");
        let mut draft = TaskDraft::new("proj", "Bug");
        draft.kind = Some(TaskKind::Bug);
        store.create(draft).expect("bug");

        let all = store.list(&TaskFilter::default(), 100);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, high.id);

        let bugs = store.list(
            &TaskFilter {
                kind: Some(TaskKind::Bug),
                ..TaskFilter::default()
            },
            100,
        );
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].title, "Bug");

        let limited = store.list(&TaskFilter::default(), 2);
        assert_eq!(limited.len(), 2);
    }
}
