//! StateStore — redb-backed state persistence for Tursi.
//!
//! Provides typed operations over deployments, log entries, and metric
//! samples. All records are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).
//!
//! Store operations assume the schema has been migrated to the version the
//! running binary expects; [`StateStore::open`] and
//! [`StateStore::open_in_memory`] guarantee that. The `bootstrap*`
//! constructors stop at version 1 and exist to drive migrations explicitly.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path and
    /// migrate it to the built-in target schema version.
    pub fn open(path: &Path) -> StateResult<Self> {
        let store = Self::bootstrap(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Create an ephemeral in-memory state store at the target schema version.
    pub fn open_in_memory() -> StateResult<Self> {
        let store = Self::bootstrap_in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    /// Open (or create) a store at `path` without applying migrations.
    pub fn bootstrap(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_bootstrap_schema()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// In-memory store at schema version 1.
    pub fn bootstrap_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_bootstrap_schema()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create the version-1 tables and history row if this is a fresh file.
    fn ensure_bootstrap_schema(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let mut versions = txn.open_table(SCHEMA_VERSION).map_err(map_err!(Table))?;
            created = versions.first().map_err(map_err!(Read))?.is_none();
            if created {
                versions
                    .insert(1u32, epoch_secs())
                    .map_err(map_err!(Write))?;
            }
        }
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(LOGS).map_err(map_err!(Table))?;
        txn.open_table(METRICS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        if created {
            info!("bootstrap schema v1 created");
        }
        Ok(())
    }

    // ── Schema ─────────────────────────────────────────────────────

    /// Highest applied schema version.
    pub fn current_schema_version(&self) -> StateResult<u32> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEMA_VERSION).map_err(map_err!(Table))?;
        let last = table.last().map_err(map_err!(Read))?;
        Ok(last.map(|(version, _)| version.value()).unwrap_or(0))
    }

    /// Every applied schema version, oldest first.
    pub fn schema_history(&self) -> StateResult<Vec<SchemaRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEMA_VERSION).map_err(map_err!(Table))?;
        let mut history = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (version, applied_at) = entry.map_err(map_err!(Read))?;
            history.push(SchemaRecord {
                version: version.value(),
                applied_at: applied_at.value(),
            });
        }
        Ok(history)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a new deployment and return its id.
    ///
    /// Fails with `Constraint` if a non-terminal deployment already binds
    /// the same `(host, port)`.
    pub fn create(&self, new: &NewDeployment) -> StateResult<DeploymentId> {
        let endpoint = endpoint_key(&new.host, new.port);
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = next_counter(&txn, NEXT_DEPLOYMENT_ID)?;
        let deployment = Deployment {
            id,
            model_name: new.model_name.clone(),
            host: new.host.clone(),
            port: new.port,
            config: new.config.clone(),
            status: new.status,
            process_id: new.process_id,
            created_at: now,
            updated_at: now,
        };
        if deployment.status.is_active() {
            claim_endpoint(&txn, &endpoint, id)?;
        }
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let value = encode(&deployment)?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = id, %endpoint, status = %deployment.status, "deployment created");
        Ok(id)
    }

    /// Get a deployment by id.
    pub fn get(&self, id: DeploymentId) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All deployments whose status is not terminal, in id order.
    pub fn list_active(&self) -> StateResult<Vec<Deployment>> {
        let mut all = self.list_deployments()?;
        all.retain(|d| d.status.is_active());
        Ok(all)
    }

    /// Every deployment, including terminal ones retained for audit.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Update a deployment's status and last-update timestamp.
    ///
    /// Entering a terminal state releases the `(host, port)` binding;
    /// leaving one claims it again and may fail with `Constraint`.
    pub fn set_status(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
    ) -> StateResult<Deployment> {
        self.update(id, |d| {
            d.status = status;
            Ok(())
        })
    }

    /// Record (or clear) the worker process id of a deployment.
    pub fn set_process_id(&self, id: DeploymentId, pid: Option<u32>) -> StateResult<Deployment> {
        self.update(id, |d| {
            d.process_id = pid;
            Ok(())
        })
    }

    /// Atomically move a non-terminal deployment to `stopping`.
    ///
    /// A deployment that is already `stopping` is returned unchanged; a
    /// terminal one fails with `Constraint`.
    pub fn request_stop(&self, id: DeploymentId) -> StateResult<Deployment> {
        self.update(id, |d| {
            if d.status.is_terminal() {
                return Err(StateError::Constraint(format!(
                    "deployment {} is already {}",
                    d.id, d.status
                )));
            }
            d.status = DeploymentStatus::Stopping;
            Ok(())
        })
    }

    /// Record a freshly started worker: store its pid and promote the row to
    /// `running`. A row that was moved to `stopping` in the meantime keeps
    /// that status so the stop request is not lost.
    pub fn record_start(&self, id: DeploymentId, pid: u32) -> StateResult<Deployment> {
        self.update(id, |d| {
            d.process_id = Some(pid);
            if matches!(d.status, DeploymentStatus::Pending | DeploymentStatus::Running) {
                d.status = DeploymentStatus::Running;
            }
            Ok(())
        })
    }

    /// Move to `to` only when the current status is one of `from`.
    /// Returns the resulting row and whether it changed.
    pub fn transition(
        &self,
        id: DeploymentId,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
    ) -> StateResult<(Deployment, bool)> {
        let mut changed = false;
        let row = self.update(id, |d| {
            if from.contains(&d.status) {
                d.status = to;
                changed = true;
            }
            Ok(())
        })?;
        Ok((row, changed))
    }

    /// Read-modify-write of one deployment row inside a single transaction.
    fn update<F>(&self, id: DeploymentId, mutate: F) -> StateResult<Deployment>
    where
        F: FnOnce(&mut Deployment) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("deployment {id}"))),
            };
            let was_active = deployment.status.is_active();
            mutate(&mut deployment)?;
            deployment.updated_at = epoch_secs();

            let endpoint = deployment.endpoint_key();
            match (was_active, deployment.status.is_active()) {
                (true, false) => release_endpoint(&txn, &endpoint, id)?,
                (false, true) => claim_endpoint(&txn, &endpoint, id)?,
                _ => {}
            }

            let value = encode(&deployment)?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            deployment
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = id, status = %updated.status, "deployment updated");
        Ok(updated)
    }

    // ── Logs ───────────────────────────────────────────────────────

    /// Append a log entry for a deployment.
    pub fn append_log(&self, id: DeploymentId, level: &str, message: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        ensure_deployment(&txn, id)?;
        let seq = next_counter(&txn, NEXT_LOG_SEQ)?;
        let entry = LogEntry {
            id: seq,
            deployment_id: id,
            level: level.to_string(),
            message: message.to_string(),
            created_at: epoch_secs(),
        };
        {
            let mut table = txn.open_table(LOGS).map_err(map_err!(Table))?;
            let value = encode(&entry)?;
            table
                .insert((id, seq), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// Most recent log entries of a deployment, newest first.
    pub fn list_logs(&self, id: DeploymentId, limit: usize) -> StateResult<Vec<LogEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        let range = table
            .range((id, 0u64)..=(id, u64::MAX))
            .map_err(map_err!(Read))?;
        for entry in range.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Append a resource sample for a deployment, stamped now.
    pub fn append_metric(&self, id: DeploymentId, cpu_percent: f64, memory_mb: f64) -> StateResult<u64> {
        self.append_metric_at(id, cpu_percent, memory_mb, epoch_secs())
    }

    /// Append a resource sample with an explicit unix timestamp.
    pub fn append_metric_at(
        &self,
        id: DeploymentId,
        cpu_percent: f64,
        memory_mb: f64,
        created_at: u64,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        ensure_deployment(&txn, id)?;
        let seq = next_counter(&txn, NEXT_METRIC_SEQ)?;
        let sample = MetricSample {
            id: seq,
            deployment_id: id,
            cpu_percent,
            memory_mb,
            created_at,
        };
        {
            let mut table = txn.open_table(METRICS).map_err(map_err!(Table))?;
            let value = encode(&sample)?;
            table
                .insert((id, seq), value.as_slice())
                .map_err(map_err!(Write))?;
            let mut times = txn.open_table(METRIC_TIMES).map_err(map_err!(Table))?;
            times
                .insert((created_at, id, seq), ())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// Most recent metric samples of a deployment, newest first.
    pub fn list_metrics(&self, id: DeploymentId, limit: usize) -> StateResult<Vec<MetricSample>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(METRICS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        let range = table
            .range((id, 0u64)..=(id, u64::MAX))
            .map_err(map_err!(Read))?;
        for entry in range.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Delete metric samples at least `max_age_hours` old. Returns the
    /// number of samples removed.
    pub fn prune_metrics(&self, max_age_hours: u64) -> StateResult<u64> {
        let cutoff = epoch_secs().saturating_sub(max_age_hours.saturating_mul(3600));
        self.prune_metrics_older_than(cutoff)
    }

    /// Delete every metric sample with `created_at <= cutoff`.
    pub fn prune_metrics_older_than(&self, cutoff: u64) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut times = txn.open_table(METRIC_TIMES).map_err(map_err!(Table))?;
            let mut metrics = txn.open_table(METRICS).map_err(map_err!(Table))?;
            let expired: Vec<(u64, u64, u64)> = {
                let range = times
                    .range(..=(cutoff, u64::MAX, u64::MAX))
                    .map_err(map_err!(Read))?;
                let mut keys = Vec::new();
                for entry in range {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    keys.push(key.value());
                }
                keys
            };
            for &(created_at, id, seq) in &expired {
                times
                    .remove((created_at, id, seq))
                    .map_err(map_err!(Write))?;
                metrics.remove((id, seq)).map_err(map_err!(Write))?;
            }
            removed = expired.len() as u64;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(removed, cutoff, "metrics pruned");
        Ok(removed)
    }
}

// ── Transaction helpers ────────────────────────────────────────────

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Increment and return a counter from the meta table. The first value is 1.
fn next_counter(txn: &WriteTransaction, key: &str) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(key, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn ensure_deployment(txn: &WriteTransaction, id: DeploymentId) -> StateResult<()> {
    let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    if table.get(id).map_err(map_err!(Read))?.is_none() {
        return Err(StateError::NotFound(format!("deployment {id}")));
    }
    Ok(())
}

pub(crate) fn claim_endpoint(txn: &WriteTransaction, endpoint: &str, id: DeploymentId) -> StateResult<()> {
    let mut index = txn.open_table(ACTIVE_ENDPOINTS).map_err(map_err!(Table))?;
    let holder = index
        .get(endpoint)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value());
    match holder {
        Some(other) if other != id => Err(StateError::Constraint(format!(
            "{endpoint} is already bound by active deployment {other}"
        ))),
        _ => {
            index.insert(endpoint, id).map_err(map_err!(Write))?;
            Ok(())
        }
    }
}

fn release_endpoint(txn: &WriteTransaction, endpoint: &str, id: DeploymentId) -> StateResult<()> {
    let mut index = txn.open_table(ACTIVE_ENDPOINTS).map_err(map_err!(Table))?;
    let holder = index
        .get(endpoint)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value());
    if holder == Some(id) {
        index.remove(endpoint).map_err(map_err!(Write))?;
    }
    Ok(())
}
