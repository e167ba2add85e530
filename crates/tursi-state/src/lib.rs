//! tursi-state — embedded state store for the Tursi supervisor.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for deployments, their log entries, and their resource-metric
//! samples, plus a forward-only schema migration engine.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Logs and
//! metrics use `(deployment_id, seq)` tuple keys so that a reverse range scan
//! yields the newest entries of one deployment first.
//!
//! The schema version history lives in its own table. Version 1 is the
//! bootstrap schema created on first open; every later version is a
//! [`Migration`] applied atomically together with its history row.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. redb serializes writers, so every
//! mutation below is a single write transaction.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod migrate;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use migrate::{Migration, Migrations};
pub use store::StateStore;
pub use types::*;
