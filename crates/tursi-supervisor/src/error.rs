//! Supervisor error types.
//!
//! Store failures inside the loop are logged and retried on the next pass,
//! so the only error a caller sees is a worker that could not be spawned.

use thiserror::Error;

/// Errors that can occur while managing workers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
