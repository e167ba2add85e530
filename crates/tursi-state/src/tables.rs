//! redb table definitions for the Tursi state store.
//!
//! Tables created by the bootstrap schema (version 1) come first; tables
//! introduced by later migrations are grouped below them with the version
//! that creates them.

use redb::TableDefinition;

/// Applied schema versions: version → unix seconds when applied.
pub const SCHEMA_VERSION: TableDefinition<u32, u64> = TableDefinition::new("schema_version");

/// Deployment records keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("deployments");

/// Log entries keyed by `(deployment_id, seq)`.
pub const LOGS: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("deployment_logs");

/// Resource metric samples keyed by `(deployment_id, seq)`.
pub const METRICS: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("resource_metrics");

/// Monotonic counters for ids and sequences.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const NEXT_DEPLOYMENT_ID: &str = "next_deployment_id";
pub const NEXT_LOG_SEQ: &str = "next_log_seq";
pub const NEXT_METRIC_SEQ: &str = "next_metric_seq";

// ── v2 ─────────────────────────────────────────────────────────────

/// `host:port` → id of the non-terminal deployment bound to it.
pub const ACTIVE_ENDPOINTS: TableDefinition<&str, u64> = TableDefinition::new("active_endpoints");

// ── v3 ─────────────────────────────────────────────────────────────

/// `(created_at, deployment_id, seq)` index over metric samples, for retention.
pub const METRIC_TIMES: TableDefinition<(u64, u64, u64), ()> =
    TableDefinition::new("metric_times");
