//! tursi-supervisor — worker lifecycle management for Tursi.
//!
//! Owns the in-memory table of live worker processes and keeps it
//! reconciled with the deployments recorded in the state store.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (one tokio task, sole owner of the worker table)
//!   ├── reconcile tick  → start pending/recovered rows, stop `stopping` rows
//!   ├── stop completed  → in-flight stop finished; `stopping` → `stopped`
//!   ├── health tick     → liveness probe; dead → `failed`, alive → metric sample
//!   ├── retention tick  → prune old metric samples
//!   ├── Reload command  → immediate reconcile
//!   └── shutdown watch  → stop every tracked worker, return
//!
//! Worker (trait)          ← ProcessWorker: one OS child process
//! ResourceProbe (trait)   ← SysinfoProbe: cpu% / RSS sampling
//! ```
//!
//! The control API never touches the worker table; it only writes
//! deployment rows, which the next reconcile pass observes.

pub mod error;
pub mod probe;
pub mod supervisor;
pub mod worker;

pub use error::{SupervisorError, SupervisorResult};
pub use probe::{ResourceProbe, ResourceUsage, SysinfoProbe};
pub use supervisor::{Supervisor, SupervisorCommand, SupervisorConfig, SupervisorHandle};
pub use worker::{ProcessWorker, ProcessWorkerFactory, Worker, WorkerCommand, WorkerFactory, WorkerSpec};
