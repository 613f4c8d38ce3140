//! Task and dependency edge records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest-urgency priority. Priorities run 0 (most urgent) to 4.
pub const MAX_PRIORITY: u8 = 4;

/// Priority assigned when a draft does not specify one.
pub const DEFAULT_PRIORITY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
}

impl TaskStatus {
    pub fn is_closed(self) -> bool {
        self == TaskStatus::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
}

/// Relation kind of a dependency edge.
///
/// Only `blocks` edges participate in readiness and cycle prevention;
/// `related` and `discovered-from` are informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepKind {
    Blocks,
    Related,
    DiscoveredFrom,
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DepKind::Blocks => "blocks",
            DepKind::Related => "related",
            DepKind::DiscoveredFrom => "discovered-from",
        };
        f.write_str(label)
    }
}

/// A unit of work.
///
/// `id`, `project_id`, `created_at` and `discovered_in_session_id` are fixed
/// at creation; everything else mutates through the store, which keeps
/// `updated_at` monotonically non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: u8,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_in_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A directed dependency between two tasks: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub task_id: String,
    pub depends_on: String,
    #[serde(rename = "dep_type")]
    pub kind: DepKind,
    pub created_at: DateTime<Utc>,
}

/// Input for task creation. Unset fields take their defaults.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub kind: Option<TaskKind>,
    pub parent_task_id: Option<String>,
    pub assignee: Option<String>,
    pub labels: BTreeSet<String>,
    pub discovered_in_session_id: Option<String>,
}

impl TaskDraft {
    pub fn new(project_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Partial update for a task: only supplied fields are applied, and the
/// merged record is re-validated against creation constraints.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<u8>,
    pub kind: Option<TaskKind>,
    pub parent_task_id: Option<String>,
    pub assignee: Option<String>,
    pub labels: Option<BTreeSet<String>>,
    pub closed_reason: Option<String>,
}

/// Listing filters, AND-combined. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub project_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<u8>,
    pub kind: Option<TaskKind>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    pub parent_task_id: Option<String>,
}

impl TaskFilter {
    pub(crate) fn matches(&self, task: &Task) -> bool {
        if let Some(project_id) = &self.project_id {
            if &task.project_id != project_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if task.kind != kind {
                return false;
            }
        }
        if let Some(assignee) = &self.assignee {
            if task.assignee.as_ref() != Some(assignee) {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !task.labels.contains(label) {
                return false;
            }
        }
        if let Some(parent) = &self.parent_task_id {
            if task.parent_task_id.as_ref() != Some(parent) {
                return false;
            }
        }
        true
    }
}

/// Filters for the ready/blocked queries, AND-combined.
#[derive(Debug, Clone, Default)]
pub struct ReadyFilter {
    pub project_id: Option<String>,
    pub priority: Option<u8>,
    pub kind: Option<TaskKind>,
    pub assignee: Option<String>,
}

impl ReadyFilter {
    pub(crate) fn matches(&self, task: &Task) -> bool {
        if let Some(project_id) = &self.project_id {
            if &task.project_id != project_id {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if task.kind != kind {
                return false;
            }
        }
        if let Some(assignee) = &self.assignee {
            if task.assignee.as_ref() != Some(assignee) {
                return false;
            }
        }
        true
    }
}

/// Listing order: priority ascending, then creation time, then id.
pub(crate) fn sort_for_listing(tasks: &mut [Task]) {
    tasks.sort_by(|left, right| {
        left.priority
            .cmp(&right.priority)
            .then_with(|| left.created_at.cmp(&right.created_at))
            .then_with(|| left.id.cmp(&right.id))
    });
}
