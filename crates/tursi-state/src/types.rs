//! Domain types for the Tursi state store.
//!
//! These types represent the persisted state of deployments, log entries,
//! metric samples, and the schema version history. All record types are
//! serializable to/from JSON for storage in redb tables and for the
//! control API wire format.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Store-assigned deployment identity. Positive, increasing, never reused.
pub type DeploymentId = u64;

/// Default number of log entries returned by `list_logs`.
pub const DEFAULT_LOG_LIMIT: usize = 100;

/// Default number of metric samples returned by `list_metrics`.
pub const DEFAULT_METRIC_LIMIT: usize = 60;

/// Conventional log levels. The store accepts any string.
pub mod level {
    pub const INFO: &str = "INFO";
    pub const WARNING: &str = "WARNING";
    pub const ERROR: &str = "ERROR";
}

// ── Deployment ─────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    /// Terminal states are never left automatically.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Stopped | DeploymentStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted or active model server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub model_name: String,
    pub host: String,
    pub port: u16,
    /// Free-form worker configuration (quantization, bits, rate limit, ...),
    /// stored and returned verbatim.
    pub config: serde_json::Value,
    pub status: DeploymentStatus,
    /// OS process id of the worker, once started.
    #[serde(default)]
    pub process_id: Option<u32>,
    /// Unix timestamp (seconds) when this row was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last change to this row.
    pub updated_at: u64,
}

impl Deployment {
    /// Key of this deployment's bind address in the endpoint index.
    pub fn endpoint_key(&self) -> String {
        endpoint_key(&self.host, self.port)
    }
}

pub(crate) fn endpoint_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Input for `StateStore::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeployment {
    pub model_name: String,
    pub host: String,
    pub port: u16,
    pub config: serde_json::Value,
    pub status: DeploymentStatus,
    pub process_id: Option<u32>,
}

impl NewDeployment {
    /// A `pending` deployment with no worker yet.
    pub fn new(
        model_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        config: serde_json::Value,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            host: host.into(),
            port,
            config,
            status: DeploymentStatus::Pending,
            process_id: None,
        }
    }

    pub fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }
}

// ── Logs & metrics ─────────────────────────────────────────────────

/// Append-only log record for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: u64,
    pub deployment_id: DeploymentId,
    pub level: String,
    pub message: String,
    pub created_at: u64,
}

/// Append-only resource usage sample for a deployment's worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub id: u64,
    pub deployment_id: DeploymentId,
    /// CPU utilization percentage.
    pub cpu_percent: f64,
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    pub created_at: u64,
}

// ── Schema ─────────────────────────────────────────────────────────

/// One applied schema version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaRecord {
    pub version: u32,
    pub applied_at: u64,
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
