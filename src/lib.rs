//! braid - Task Graph Coordination Library
//!
//! This library gives fleets of parallel agents a persistent,
//! collision-resistant, dependency-aware unit of work, shareable across
//! machines through a plain-text export tracked in git.
//!
//! # Core Concepts
//!
//! - **Tasks**: units of work with hash-derived ids, so uncoordinated
//!   writers never fight over a counter
//! - **Dependency edges**: `blocks`, `related` and `discovered-from`
//!   relations; blocking edges are kept acyclic
//! - **Ready frontier**: open tasks with no unresolved blocking edge
//! - **Sync engine**: debounced JSONL export plus last-write-wins import,
//!   reconciling the store with the git-tracked file
//!
//! # Module Organization
//!
//! - `config`: Configuration loading from `.braid.toml`
//! - `engine`: Process-wide facade and consistency boundary
//! - `error`: Error types and result aliases
//! - `graph`: Dependency edges, cycle detection, readiness queries
//! - `lock`: File locking and atomic writes for concurrency safety
//! - `model`: Task and edge records
//! - `storage`: Tracked file layout
//! - `store`: Indexed in-memory task store
//! - `sync`: JSONL export/import and debounce worker
//! - `task_id`: Identifier generation

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lock;
pub mod model;
pub mod storage;
pub mod store;
pub mod sync;
pub mod task_id;

pub use engine::{Engine, SyncMode};
pub use error::{Error, Result};
pub use graph::TreeDirection;
pub use model::{
    DepKind, ReadyFilter, Task, TaskDraft, TaskFilter, TaskKind, TaskPatch, TaskStatus,
};
