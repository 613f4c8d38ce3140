//! Git-distributed task sync.
//!
//! Serializes the whole store to a line-oriented JSONL file tracked in git
//! and merges externally-pulled changes back in. Each line is one
//! self-contained task record with its outbound dependency edges inlined,
//! and lines are ordered by id ascending, so line-level diffs stay
//! meaningful across clones.
//!
//! Conflict resolution is last-write-wins on `updated_at`, whole record at a
//! time: two concurrent edits to different fields of the same task are not
//! merged field-by-field. Tasks present in the store but absent from the
//! file are preserved, never deleted; partial clones and filtered exports
//! are expected, so file absence is not a deletion signal.
//!
//! Malformed lines are skipped and reported rather than rejecting the whole
//! file; one bad line must not block every agent.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::lock;
use crate::model::{DepKind, DependencyEdge, Task};
use crate::storage::Workdir;
use crate::store::Store;

/// One exported line: a task with its outbound edges inlined.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskLine {
    #[serde(flatten)]
    task: Task,
    #[serde(default)]
    dependencies: Vec<DepEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DepEntry {
    depends_on: String,
    dep_type: DepKind,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

/// Sidecar metadata written next to the export file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMeta {
    pub last_export_at: DateTime<Utc>,
    pub content_hash: String,
}

/// Read-only introspection of the sync engine.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_export_at: Option<DateTime<Utc>>,
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Outcome of one import pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub edges_added: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_lines: Vec<SkippedLine>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dangling_refs: Vec<String>,
    /// Blocking cycles found by the post-import audit.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cycles: Vec<Vec<String>>,
}

impl ImportReport {
    /// Whether the pass changed the store.
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0 || self.edges_added > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedLine {
    pub line: usize,
    pub reason: String,
}

/// Outcome of one export pass.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub tasks: usize,
    pub edges: usize,
    pub fingerprint: String,
    /// True when the content was unchanged and no write happened.
    pub skipped: bool,
}

/// Reconciliation state, exclusively owned by the sync engine.
#[derive(Debug, Default)]
struct SyncRecord {
    last_export_at: Option<DateTime<Utc>>,
    fingerprint: Option<String>,
    pending: bool,
}

struct SyncShared {
    store: Arc<RwLock<Store>>,
    workdir: Workdir,
    lock_timeout_ms: u64,
    record: Mutex<SyncRecord>,
}

/// Debounced exporter and importer for the tracked JSONL file.
///
/// Mutation signals coalesce: the worker waits out a quiet period
/// (`sync.debounce_ms`) that restarts on every further signal, then runs one
/// export for the whole burst. A failed export leaves the pending flag set
/// and is retried on the next cycle; export is idempotent. Pending changes
/// are flushed when the engine shuts down.
pub struct SyncEngine {
    shared: Arc<SyncShared>,
    tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SyncEngine {
    pub fn start(
        store: Arc<RwLock<Store>>,
        workdir: Workdir,
        config: &SyncConfig,
    ) -> Result<Self> {
        let shared = Arc::new(SyncShared {
            store,
            workdir,
            lock_timeout_ms: config.lock_timeout_ms,
            record: Mutex::new(SyncRecord::default()),
        });
        seed_record(&shared);

        let (tx, rx) = unbounded();
        let quiet = Duration::from_millis(config.debounce_ms);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("braid-sync".to_string())
            .spawn(move || debounce_loop(worker_shared, rx, quiet))?;

        Ok(Self {
            shared,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Note that store state changed and an export is due.
    pub fn signal(&self) {
        self.shared.record.lock().pending = true;
        if let Some(tx) = &self.tx {
            let _ = tx.send(());
        }
    }

    pub fn status(&self) -> SyncStatus {
        let record = self.shared.record.lock();
        SyncStatus {
            last_export_at: record.last_export_at,
            pending: record.pending,
            fingerprint: record.fingerprint.clone(),
        }
    }

    /// Export now, bypassing the debounce timer.
    pub fn export(&self) -> Result<ExportReport> {
        run_export(&self.shared)
    }

    /// Merge the tracked file into the store now.
    pub fn import(&self) -> Result<ImportReport> {
        run_import(&self.shared)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        // Disconnect the channel so the worker flushes and exits, then join.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn debounce_loop(shared: Arc<SyncShared>, rx: Receiver<()>, quiet: Duration) {
    let mut connected = true;
    while connected {
        if rx.recv().is_err() {
            break;
        }
        // Coalesce the burst: every further signal restarts the quiet period.
        loop {
            match rx.recv_timeout(quiet) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    connected = false;
                    break;
                }
            }
        }
        if let Err(err) = run_export(&shared) {
            warn!(%err, "debounced export failed; retrying on next change");
        }
    }
}

/// Seed the in-memory record from the sidecar, and flag external edits of
/// the tracked file made between runs.
fn seed_record(shared: &SyncShared) {
    let meta_path = shared.workdir.meta_file();
    let export_path = shared.workdir.export_file();
    if !meta_path.exists() || !export_path.exists() {
        return;
    }
    let Ok(raw) = std::fs::read_to_string(&meta_path) else {
        return;
    };
    let Ok(meta) = serde_json::from_str::<SyncMeta>(&raw) else {
        return;
    };
    let Ok(bytes) = std::fs::read(export_path) else {
        return;
    };
    let hash = fingerprint_hex(&bytes);
    if hash == meta.content_hash {
        let mut record = shared.record.lock();
        record.last_export_at = Some(meta.last_export_at);
        record.fingerprint = Some(hash);
    } else {
        info!("tracked export changed since last run; import will reconcile");
    }
}

fn run_export(shared: &SyncShared) -> Result<ExportReport> {
    let (content, tasks, edges) = {
        let store = shared.store.read();
        render(&store)?
    };
    let fingerprint = fingerprint_hex(content.as_bytes());

    let unchanged = {
        let record = shared.record.lock();
        record.fingerprint.as_deref() == Some(fingerprint.as_str())
    };
    if unchanged && shared.workdir.export_file().exists() {
        shared.record.lock().pending = false;
        debug!("export skipped; content unchanged");
        return Ok(ExportReport {
            tasks,
            edges,
            fingerprint,
            skipped: true,
        });
    }

    shared.workdir.ensure_dirs()?;
    lock::write_atomic_locked(
        shared.workdir.export_file(),
        content.as_bytes(),
        shared.lock_timeout_ms,
    )?;
    let meta = SyncMeta {
        last_export_at: Utc::now(),
        content_hash: fingerprint.clone(),
    };
    lock::write_atomic_locked(
        shared.workdir.meta_file(),
        serde_json::to_string_pretty(&meta)?.as_bytes(),
        shared.lock_timeout_ms,
    )?;

    let mut record = shared.record.lock();
    record.last_export_at = Some(meta.last_export_at);
    record.fingerprint = Some(fingerprint.clone());
    record.pending = false;
    drop(record);

    info!(tasks, edges, "exported tasks to {}", shared.workdir.export_file().display());
    Ok(ExportReport {
        tasks,
        edges,
        fingerprint,
        skipped: false,
    })
}

fn run_import(shared: &SyncShared) -> Result<ImportReport> {
    let path = shared.workdir.export_file();
    if !path.exists() {
        return Ok(ImportReport::default());
    }
    let content = lock::read_locked_string(path, shared.lock_timeout_ms)?;

    let mut report = ImportReport::default();
    let incoming = parse_lines(&content, &mut report);

    let mut store = shared.store.write();
    merge_into(&mut store, incoming, &mut report);
    report.cycles = store.check_cycles();
    drop(store);

    if !report.cycles.is_empty() {
        warn!(
            cycles = report.cycles.len(),
            "import left blocking cycles; resolve before relying on readiness"
        );
    }
    info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        skipped = report.skipped_lines.len(),
        "imported tasks from {}",
        path.display()
    );
    Ok(report)
}

fn parse_lines(content: &str, report: &mut ImportReport) -> Vec<TaskLine> {
    let mut out = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TaskLine>(line) {
            Ok(record) => {
                if record.task.id.trim().is_empty() {
                    report.skipped_lines.push(SkippedLine {
                        line: idx + 1,
                        reason: "empty task id".to_string(),
                    });
                    continue;
                }
                if record.task.title.trim().is_empty() {
                    report.skipped_lines.push(SkippedLine {
                        line: idx + 1,
                        reason: format!("task {} has an empty title", record.task.id),
                    });
                    continue;
                }
                out.push(record);
            }
            Err(err) => {
                warn!(line = idx + 1, %err, "skipping malformed task line");
                report.skipped_lines.push(SkippedLine {
                    line: idx + 1,
                    reason: err.to_string(),
                });
            }
        }
    }
    out
}

fn merge_into(store: &mut Store, incoming: Vec<TaskLine>, report: &mut ImportReport) {
    // Pass 1: upsert task records; remember which ids the file won so their
    // edges can be adopted once every referenced task is present.
    let mut adopted: Vec<(String, Vec<DepEntry>)> = Vec::new();
    for TaskLine { task, dependencies } in incoming {
        match store.tasks.get(&task.id) {
            None => {
                adopted.push((task.id.clone(), dependencies));
                store.adopt_task(task);
                report.inserted += 1;
            }
            Some(existing) => {
                if task.updated_at > existing.updated_at {
                    adopted.push((task.id.clone(), dependencies));
                    store.overwrite_from(task);
                    report.updated += 1;
                } else {
                    report.unchanged += 1;
                }
            }
        }
    }

    // Pass 2: the winning side's outbound edges replace the loser's.
    for (task_id, deps) in adopted {
        let edges: Vec<DependencyEdge> = deps
            .into_iter()
            .map(|dep| DependencyEdge {
                task_id: task_id.clone(),
                depends_on: dep.depends_on,
                kind: dep.dep_type,
                created_at: dep.created_at,
            })
            .collect();
        let (added, dropped) = store.replace_outbound_edges(&task_id, edges);
        report.edges_added += added;
        report.dangling_refs.extend(dropped);

        let parent = store
            .tasks
            .get(&task_id)
            .and_then(|task| task.parent_task_id.clone());
        if let Some(parent) = parent {
            if !store.tasks.contains_key(&parent) {
                // Kept as-is: the parent may arrive with a later pull.
                report
                    .dangling_refs
                    .push(format!("task {task_id} references missing parent {parent}"));
            }
        }
    }
}

fn render(store: &Store) -> Result<(String, usize, usize)> {
    let mut by_task: HashMap<&str, Vec<DepEntry>> = HashMap::new();
    for edge in store.edges.values() {
        by_task
            .entry(edge.task_id.as_str())
            .or_default()
            .push(DepEntry {
                depends_on: edge.depends_on.clone(),
                dep_type: edge.kind,
                created_at: edge.created_at,
            });
    }

    let mut out = String::new();
    let mut edge_count = 0;
    for (id, task) in &store.tasks {
        let dependencies = by_task.remove(id.as_str()).unwrap_or_default();
        edge_count += dependencies.len();
        let line = TaskLine {
            task: task.clone(),
            dependencies,
        };
        out.push_str(&serde_json::to_string(&line)?);
        out.push('\n');
    }
    Ok((out, store.tasks.len(), edge_count))
}

fn fingerprint_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TasksConfig;
    use crate::model::{TaskDraft, TaskStatus};

    fn seeded_store() -> (Store, Vec<String>) {
        let mut store = Store::new(&TasksConfig::default());
        let a = store.create(TaskDraft::new("proj", "A")).expect("a").id;
        let b = store.create(TaskDraft::new("proj", "B")).expect("b").id;
        store
            .add_dependency(&a, &b, DepKind::Blocks)
            .expect("a depends on b");
        (store, vec![a, b])
    }

    #[test]
    fn render_is_ordered_and_self_contained() {
        let (store, ids) = seeded_store();
        let (content, tasks, edges) = render(&store).expect("render");
        assert_eq!(tasks, 2);
        assert_eq!(edges, 1);

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Vec<serde_json::Value> = lines
            .iter()
            .map(|line| serde_json::from_str(line).expect("line json"))
            .collect();
        // Lines sorted by id ascending.
        assert!(parsed[0]["id"].as_str().unwrap() < parsed[1]["id"].as_str().unwrap());
        // Every line carries its dependencies array, empty included.
        for value in &parsed {
            assert!(value["dependencies"].is_array());
        }
        let a_line = parsed
            .iter()
            .find(|v| v["id"] == serde_json::Value::String(ids[0].clone()))
            .expect("a line");
        assert_eq!(a_line["dependencies"][0]["depends_on"], ids[1].as_str());
        assert_eq!(a_line["dependencies"][0]["dep_type"], "blocks");
    }

    #[test]
    fn round_trip_reproduces_the_store() {
        let (store, _) = seeded_store();
        let (content, _, _) = render(&store).expect("render");

        let mut report = ImportReport::default();
        let incoming = parse_lines(&content, &mut report);
        let mut restored = Store::new(&TasksConfig::default());
        merge_into(&mut restored, incoming, &mut report);

        assert!(report.skipped_lines.is_empty());
        assert_eq!(restored.task_count(), store.task_count());
        assert_eq!(restored.edge_count(), store.edge_count());
        for (id, task) in &store.tasks {
            assert_eq!(restored.tasks.get(id), Some(task));
        }
        let (restored_content, _, _) = render(&restored).expect("render restored");
        assert_eq!(restored_content, content);
    }

    #[test]
    fn later_timestamp_wins_whole_record() {
        let (mut store, ids) = seeded_store();
        let original = store.get(&ids[0]).expect("task").clone();

        let mut incoming = original.clone();
        incoming.title = "Rewritten".to_string();
        incoming.assignee = Some("agent-2".to_string());
        incoming.updated_at = original.updated_at + chrono::Duration::seconds(5);
        // The merge never rewrites identity fields even if the line tries.
        incoming.project_id = "other".to_string();
        incoming.created_at = original.created_at + chrono::Duration::seconds(5);

        let mut report = ImportReport::default();
        merge_into(
            &mut store,
            vec![TaskLine {
                task: incoming,
                dependencies: Vec::new(),
            }],
            &mut report,
        );
        assert_eq!(report.updated, 1);

        let merged = store.get(&ids[0]).expect("task");
        assert_eq!(merged.title, "Rewritten");
        assert_eq!(merged.assignee.as_deref(), Some("agent-2"));
        assert_eq!(merged.project_id, "proj");
        assert_eq!(merged.created_at, original.created_at);
        // The winning record's (empty) edge set replaced the store's.
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn older_record_changes_nothing() {
        let (mut store, ids) = seeded_store();
        let original = store.get(&ids[0]).expect("task").clone();

        let mut incoming = original.clone();
        incoming.title = "Stale".to_string();
        incoming.updated_at = original.updated_at - chrono::Duration::seconds(5);

        let mut report = ImportReport::default();
        merge_into(
            &mut store,
            vec![TaskLine {
                task: incoming,
                dependencies: Vec::new(),
            }],
            &mut report,
        );
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.get(&ids[0]).expect("task").title, "A");
        assert_eq!(store.edge_count(), 1);
    }

    #[test]
    fn malformed_lines_are_skipped_and_reported() {
        let (store, _) = seeded_store();
        let (content, _, _) = render(&store).expect("render");
        let mangled = format!("{content}not json at all\n{{\"id\": \"bd-trunc\"\n");

        let mut report = ImportReport::default();
        let incoming = parse_lines(&mangled, &mut report);
        assert_eq!(incoming.len(), 2);
        assert_eq!(report.skipped_lines.len(), 2);
        assert_eq!(report.skipped_lines[0].line, 3);
    }

    #[test]
    fn dangling_dependency_is_dropped_and_reported() {
        let mut store = Store::new(&TasksConfig::default());
        let line = TaskLine {
            task: Task {
                id: "bd-aaaaaa".to_string(),
                project_id: "proj".to_string(),
                title: "Imported".to_string(),
                status: TaskStatus::Open,
                priority: 2,
                kind: Default::default(),
                description: None,
                parent_task_id: Some("bd-gone".to_string()),
                assignee: None,
                labels: Default::default(),
                closed_reason: None,
                discovered_in_session_id: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            dependencies: vec![DepEntry {
                depends_on: "bd-missing".to_string(),
                dep_type: DepKind::Blocks,
                created_at: Utc::now(),
            }],
        };

        let mut report = ImportReport::default();
        merge_into(&mut store, vec![line], &mut report);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.edges_added, 0);
        assert_eq!(report.dangling_refs.len(), 2);
        assert_eq!(store.edge_count(), 0);
        // The parent reference itself is preserved for a later pull.
        assert_eq!(
            store.get("bd-aaaaaa").expect("task").parent_task_id.as_deref(),
            Some("bd-gone")
        );
    }

    #[test]
    fn import_audits_cycles_from_bulk_edges() {
        let (mut store, ids) = seeded_store();
        // A file authored elsewhere closes a loop the incremental guard
        // would have rejected.
        let b = store.get(&ids[1]).expect("b").clone();
        let mut newer_b = b.clone();
        newer_b.updated_at = b.updated_at + chrono::Duration::seconds(1);

        let mut report = ImportReport::default();
        merge_into(
            &mut store,
            vec![TaskLine {
                task: newer_b,
                dependencies: vec![DepEntry {
                    depends_on: ids[0].clone(),
                    dep_type: DepKind::Blocks,
                    created_at: Utc::now(),
                }],
            }],
            &mut report,
        );
        report.cycles = store.check_cycles();
        assert_eq!(report.cycles.len(), 1);
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let first = fingerprint_hex(b"content");
        let second = fingerprint_hex(b"content");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(first, fingerprint_hex(b"other"));
    }
}
