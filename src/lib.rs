//! # simsweep
//!
//! Orchestration layer for parameter sweeps over external simulation-model
//! workers: it launches, supervises, and terminates worker processes,
//! multiplexes their monitor streams, applies early-termination stop
//! conditions, and partitions sweeps across cluster nodes.
//!
//! ## Architecture
//!
//! ```text
//!        ┌───────────────────────────────────┐
//!        │         BatchTaskManager          │
//!        │  (entries in order, fail-fast)    │
//!        └────────────────┬──────────────────┘
//!                         │ one per entry
//!                         ▼
//!        ┌───────────────────────────────────┐
//!        │          WorkerManager            │
//!        │  single polling loop, N slots     │
//!        └───────┬──────────────────┬────────┘
//!                │ owns             │ consults
//!                ▼                  ▼
//!        ┌──────────────┐   ┌───────────────┐
//!        │     Task     │◄──│ StopCondition │
//!        │ (one worker  │   │  (read-only)  │
//!        │   process)   │   └───────────────┘
//!        └──────────────┘
//! ```
//!
//! Concurrency comes entirely from the worker processes: each manager is a
//! single controlling loop that never blocks on a task, so scheduling
//! decisions stay deterministic and lock-free.
//!
//! ## Modules
//! - `batch`: entry sequencing and the expected-failure harness
//! - `manager`: the bounded-concurrency scheduling loop
//! - `task`: one supervised worker process
//! - `stop`: named stop-condition predicates and the check registry
//! - `monitor`: monitor-line parsing and comparisons
//! - `cluster`: condensed node-list resolution and sweep partitioning
//! - `config`: the YAML batch document
//! - `resources`: per-process CPU/memory sampling for the post-poll hook

pub mod batch;
pub mod cluster;
pub mod config;
pub mod manager;
pub mod monitor;
pub mod resources;
pub mod stop;
pub mod task;

pub use batch::{BatchError, BatchTaskManager, EntryDisposition, EntryOutcome};
pub use cluster::{ClusterContext, NodeListError};
pub use config::{BatchSpec, ConfigError, RunSettings, TaskConfig};
pub use manager::{CompletionCause, ManagerError, TaskOutcome, WorkerManager};
pub use stop::StopCondition;
pub use task::{Task, TaskError, TaskId, TaskStatus};
