//! Dependency edges, cycle prevention, and readiness queries.
//!
//! Edges are keyed by the `(task_id, depends_on, kind)` triple. Only
//! `blocks`-kind edges feed the adjacency indexes, so the incremental cycle
//! guard in [`Store::add_dependency`] touches just the edges reachable from
//! the candidate pair instead of scanning the whole graph.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{sort_for_listing, DepKind, DependencyEdge, ReadyFilter, Task, TaskStatus};
use crate::store::{EdgeKey, Store};

/// Direction of a dependency tree traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeDirection {
    /// Follow what the task depends on.
    Blockers,
    /// Follow what depends on the task.
    Blocking,
    Both,
}

/// One node of a dependency tree. `kind` is the edge linking the node to its
/// parent in the tree; `None` at the root.
#[derive(Debug, Clone, Serialize)]
pub struct DepTreeNode {
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<DepKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<DepTreeNode>,
}

/// An open task paired with its unresolved blockers, for diagnostic display.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedTask {
    pub task: Task,
    pub blockers: Vec<Task>,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl Store {
    /// Add a dependency edge: `task_id` depends on `depends_on`.
    ///
    /// Duplicate triples fail with a conflict (explicit policy, chosen over
    /// an idempotent no-op for determinism). A `blocks` edge is rejected
    /// before insertion when `task_id` is already reachable from
    /// `depends_on`, since the new edge would close a cycle.
    pub fn add_dependency(
        &mut self,
        task_id: &str,
        depends_on: &str,
        kind: DepKind,
    ) -> Result<DependencyEdge> {
        if task_id == depends_on {
            return Err(Error::Validation(format!(
                "task {task_id} cannot depend on itself"
            )));
        }
        self.get(task_id)?;
        self.get(depends_on)?;

        let key: EdgeKey = (task_id.to_string(), depends_on.to_string(), kind);
        if self.edges.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "dependency already exists: {task_id} -> {depends_on} ({kind})"
            )));
        }
        if kind == DepKind::Blocks && self.reaches(depends_on, task_id) {
            return Err(Error::CycleDetected {
                task_id: task_id.to_string(),
                depends_on: depends_on.to_string(),
            });
        }

        let edge = DependencyEdge {
            task_id: task_id.to_string(),
            depends_on: depends_on.to_string(),
            kind,
            created_at: Utc::now(),
        };
        self.insert_edge(edge.clone());
        debug!(from = %task_id, to = %depends_on, %kind, "added dependency");
        Ok(edge)
    }

    /// Remove matching edges; with `kind` unset, every kind between the pair.
    /// Returns the number removed; removing nothing is not an error.
    pub fn remove_dependency(
        &mut self,
        task_id: &str,
        depends_on: &str,
        kind: Option<DepKind>,
    ) -> usize {
        let keys: Vec<EdgeKey> = match kind {
            Some(kind) => vec![(task_id.to_string(), depends_on.to_string(), kind)],
            None => self
                .edges
                .keys()
                .filter(|(from, to, _)| from == task_id && to == depends_on)
                .cloned()
                .collect(),
        };
        keys.iter().filter(|key| self.remove_edge_key(key)).count()
    }

    /// Direct `blocks`-kind predecessors: the tasks this task depends on.
    pub fn get_blockers(&self, task_id: &str) -> Result<Vec<Task>> {
        self.get(task_id)?;
        Ok(self.resolve_ids(self.blockers_of.get(task_id)))
    }

    /// Direct `blocks`-kind successors: the tasks that depend on this task.
    pub fn get_blocking(&self, task_id: &str) -> Result<Vec<Task>> {
        self.get(task_id)?;
        Ok(self.resolve_ids(self.dependents_of.get(task_id)))
    }

    /// Recursive dependency closure in the requested direction, over edges of
    /// every kind. A visited set makes the walk terminate even if edges of
    /// non-`blocks` kinds (or corrupted data) form a loop.
    pub fn dependency_tree(&self, task_id: &str, direction: TreeDirection) -> Result<DepTreeNode> {
        let (root_key, root) = self
            .tasks
            .get_key_value(task_id)
            .ok_or_else(|| Error::NotFound(task_id.to_string()))?;

        let mut forward: HashMap<&str, Vec<(&str, DepKind)>> = HashMap::new();
        let mut reverse: HashMap<&str, Vec<(&str, DepKind)>> = HashMap::new();
        for (from, to, kind) in self.edges.keys().map(|(f, t, k)| (f.as_str(), t.as_str(), *k)) {
            forward.entry(from).or_default().push((to, kind));
            reverse.entry(to).or_default().push((from, kind));
        }

        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(root_key.as_str());
        let nodes = self.tree_nodes(root_key.as_str(), direction, &forward, &reverse, &mut visited);
        Ok(DepTreeNode {
            task: root.clone(),
            kind: None,
            nodes,
        })
    }

    /// Full-graph audit of `blocks` edges with a three-color depth-first
    /// search. Reports every distinct cycle as an ordered id sequence.
    /// Used as an integrity check independent of the incremental guard,
    /// e.g. after a bulk import inserted edges without going through
    /// [`Store::add_dependency`].
    pub fn check_cycles(&self) -> Vec<Vec<String>> {
        let mut color: HashMap<&str, Color> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();

        for id in self.tasks.keys() {
            if color.get(id.as_str()).copied().unwrap_or(Color::White) == Color::White {
                self.visit(id, &mut color, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    /// Open tasks whose every blocker is closed, AND-filtered and ordered by
    /// priority then creation time.
    pub fn list_ready(&self, filter: &ReadyFilter, limit: usize) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .values()
            .filter(|task| filter.matches(task) && self.is_ready(task))
            .cloned()
            .collect();
        sort_for_listing(&mut out);
        out.truncate(limit);
        out
    }

    /// The complement of [`Store::list_ready`] over open tasks: each blocked
    /// task paired with its unresolved blockers.
    pub fn list_blocked(&self, limit: usize) -> Vec<BlockedTask> {
        let mut open: Vec<Task> = self
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Open && !self.is_ready(task))
            .cloned()
            .collect();
        sort_for_listing(&mut open);
        open.truncate(limit);
        open.into_iter()
            .map(|task| {
                let blockers = self.unresolved_blockers(&task.id);
                BlockedTask { task, blockers }
            })
            .collect()
    }

    // =========================================================================
    // Import support (see crate::sync)
    // =========================================================================

    /// Replace a task's outbound edges with an imported set. Self-loops and
    /// edges to missing tasks are dropped and described in the returned list.
    /// No cycle guard here: bulk import audits with `check_cycles` instead.
    pub(crate) fn replace_outbound_edges(
        &mut self,
        task_id: &str,
        incoming: Vec<DependencyEdge>,
    ) -> (usize, Vec<String>) {
        let stale: Vec<EdgeKey> = self
            .edges
            .keys()
            .filter(|(from, _, _)| from == task_id)
            .cloned()
            .collect();
        for key in &stale {
            self.remove_edge_key(key);
        }

        let mut added = 0;
        let mut dropped = Vec::new();
        for edge in incoming {
            if edge.depends_on == task_id {
                dropped.push(format!("task {task_id} depends on itself"));
                continue;
            }
            if !self.tasks.contains_key(&edge.depends_on) {
                dropped.push(format!(
                    "task {task_id} depends on missing task {}",
                    edge.depends_on
                ));
                continue;
            }
            let key: EdgeKey = (edge.task_id.clone(), edge.depends_on.clone(), edge.kind);
            if self.edges.contains_key(&key) {
                continue;
            }
            self.insert_edge(edge);
            added += 1;
        }
        (added, dropped)
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    pub(crate) fn insert_edge(&mut self, edge: DependencyEdge) {
        if edge.kind == DepKind::Blocks {
            self.blockers_of
                .entry(edge.task_id.clone())
                .or_default()
                .insert(edge.depends_on.clone());
            self.dependents_of
                .entry(edge.depends_on.clone())
                .or_default()
                .insert(edge.task_id.clone());
        }
        self.edges
            .insert((edge.task_id.clone(), edge.depends_on.clone(), edge.kind), edge);
    }

    pub(crate) fn remove_edge_key(&mut self, key: &EdgeKey) -> bool {
        let removed = self.edges.remove(key).is_some();
        if removed && key.2 == DepKind::Blocks {
            if let Some(set) = self.blockers_of.get_mut(&key.0) {
                set.remove(&key.1);
                if set.is_empty() {
                    self.blockers_of.remove(&key.0);
                }
            }
            if let Some(set) = self.dependents_of.get_mut(&key.1) {
                set.remove(&key.0);
                if set.is_empty() {
                    self.dependents_of.remove(&key.1);
                }
            }
        }
        removed
    }

    /// Breadth-first reachability over `blocks` depends-on edges.
    fn reaches<'a>(&'a self, from: &'a str, to: &str) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = self.blockers_of.get(current) {
                for id in next {
                    if !visited.contains(id.as_str()) {
                        queue.push_back(id);
                    }
                }
            }
        }
        false
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        color.insert(node, Color::Gray);
        stack.push(node);
        if let Some(next) = self.blockers_of.get(node) {
            for id in next {
                match color.get(id.as_str()).copied().unwrap_or(Color::White) {
                    Color::White => self.visit(id, color, stack, cycles),
                    Color::Gray => {
                        if let Some(pos) = stack.iter().position(|entry| *entry == id.as_str()) {
                            cycles.push(stack[pos..].iter().map(|s| (*s).to_string()).collect());
                        }
                    }
                    Color::Black => {}
                }
            }
        }
        stack.pop();
        color.insert(node, Color::Black);
    }

    fn tree_nodes<'a>(
        &'a self,
        id: &str,
        direction: TreeDirection,
        forward: &HashMap<&'a str, Vec<(&'a str, DepKind)>>,
        reverse: &HashMap<&'a str, Vec<(&'a str, DepKind)>>,
        visited: &mut HashSet<&'a str>,
    ) -> Vec<DepTreeNode> {
        let mut neighbors: Vec<(&str, DepKind)> = Vec::new();
        if matches!(direction, TreeDirection::Blockers | TreeDirection::Both) {
            if let Some(list) = forward.get(id) {
                neighbors.extend(list.iter().copied());
            }
        }
        if matches!(direction, TreeDirection::Blocking | TreeDirection::Both) {
            if let Some(list) = reverse.get(id) {
                neighbors.extend(list.iter().copied());
            }
        }

        let mut out = Vec::new();
        for (next, kind) in neighbors {
            if !visited.insert(next) {
                continue;
            }
            let Some(task) = self.tasks.get(next) else {
                continue;
            };
            let nodes = self.tree_nodes(next, direction, forward, reverse, visited);
            out.push(DepTreeNode {
                task: task.clone(),
                kind: Some(kind),
                nodes,
            });
        }
        out
    }

    fn is_ready(&self, task: &Task) -> bool {
        if task.status != TaskStatus::Open {
            return false;
        }
        match self.blockers_of.get(&task.id) {
            None => true,
            Some(blockers) => blockers.iter().all(|id| {
                self.tasks
                    .get(id)
                    .map(|blocker| blocker.status.is_closed())
                    .unwrap_or(false)
            }),
        }
    }

    fn unresolved_blockers(&self, task_id: &str) -> Vec<Task> {
        self.blockers_of
            .get(task_id)
            .map(|blockers| {
                blockers
                    .iter()
                    .filter_map(|id| self.tasks.get(id))
                    .filter(|blocker| !blocker.status.is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn resolve_ids(&self, ids: Option<&std::collections::BTreeSet<String>>) -> Vec<Task> {
        ids.map(|set| {
            set.iter()
                .filter_map(|id| self.tasks.get(id))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }
}
