//! Error types for the Tursi state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("migration to schema v{version} failed: {reason}")]
    Migration { version: u32, reason: String },
}

impl StateError {
    /// Short machine-readable classification, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            StateError::NotFound(_) => "not_found",
            StateError::Constraint(_) => "constraint",
            StateError::Migration { .. } => "migration",
            _ => "store_io",
        }
    }

    /// Whether this is an I/O-level failure that a later pass may not hit.
    pub fn is_transient(&self) -> bool {
        self.kind() == "store_io"
    }
}
