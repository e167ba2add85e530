//! Forward-only schema migrations.
//!
//! Version 1 is the bootstrap schema created when a store is first opened.
//! Every later version is a [`Migration`]: a change function run inside a
//! redb write transaction. The change and its `schema_version` history row
//! commit together or not at all, so a failed migration leaves the store at
//! its last committed version and a retry picks up exactly where it stopped.

use redb::{ReadableTable, WriteTransaction};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, claim_endpoint, decode};
use crate::tables::*;
use crate::types::*;

/// A change applied inside the migration's write transaction.
pub type ChangeFn = fn(&WriteTransaction) -> StateResult<()>;

/// One numbered schema change.
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub apply: ChangeFn,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// An ordered set of migrations starting at version 2.
#[derive(Debug, Clone, Default)]
pub struct Migrations {
    steps: Vec<Migration>,
}

impl Migrations {
    /// An empty set: target version 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// The migrations shipped with this binary.
    pub fn builtin() -> Self {
        Self::new()
            .with(Migration {
                version: 2,
                description: "active endpoint index",
                apply: create_active_endpoint_index,
            })
            .with(Migration {
                version: 3,
                description: "metric time index",
                apply: create_metric_time_index,
            })
    }

    /// Add a migration, keeping the set ordered by version.
    pub fn with(mut self, migration: Migration) -> Self {
        self.steps.push(migration);
        self.steps.sort_by_key(|m| m.version);
        self
    }

    /// Highest version this set migrates to.
    pub fn target_version(&self) -> u32 {
        self.steps.last().map(|m| m.version).unwrap_or(1)
    }

    /// Versions must be consecutive, start at 2, and appear once.
    pub fn validate(&self) -> StateResult<()> {
        for (index, step) in self.steps.iter().enumerate() {
            let expected = index as u32 + 2;
            if step.version != expected {
                return Err(StateError::Migration {
                    version: step.version,
                    reason: format!("expected v{expected}, migrations must be consecutive from v2"),
                });
            }
        }
        Ok(())
    }

    fn pending(&self, current: u32) -> impl Iterator<Item = &Migration> {
        self.steps.iter().filter(move |m| m.version > current)
    }
}

impl StateStore {
    /// Migrate to the built-in target version. Returns the resulting version.
    pub fn migrate(&self) -> StateResult<u32> {
        self.migrate_with(&Migrations::builtin())
    }

    /// Apply every migration in `migrations` newer than the current version,
    /// in increasing order, one transaction each. Stops at the first failure.
    pub fn migrate_with(&self, migrations: &Migrations) -> StateResult<u32> {
        migrations.validate()?;
        let current = self.current_schema_version()?;
        let target = migrations.target_version();

        if current > target {
            return Err(StateError::Migration {
                version: current,
                reason: format!("store schema v{current} is newer than supported v{target}"),
            });
        }
        if current == target {
            debug!(version = current, "schema up to date");
            return Ok(current);
        }

        info!(from = current, to = target, "migrating schema");
        for migration in migrations.pending(current) {
            self.apply_migration(migration)?;
        }
        self.current_schema_version()
    }

    fn apply_migration(&self, migration: &Migration) -> StateResult<()> {
        let version = migration.version;
        let fail = |reason: String| StateError::Migration { version, reason };

        let txn = self.db.begin_write().map_err(|e| fail(e.to_string()))?;
        // Another opener may have committed this version since we looked.
        let already_applied = {
            let versions = txn
                .open_table(SCHEMA_VERSION)
                .map_err(|e| fail(e.to_string()))?;
            versions
                .get(version)
                .map_err(|e| fail(e.to_string()))?
                .is_some()
        };
        if already_applied {
            txn.abort().map_err(|e| fail(e.to_string()))?;
            debug!(version, "migration already applied");
            return Ok(());
        }

        if let Err(e) = (migration.apply)(&txn) {
            warn!(version, error = %e, "migration failed, rolling back");
            if let Err(abort_err) = txn.abort() {
                warn!(version, error = %abort_err, "rollback reported an error");
            }
            return Err(fail(e.to_string()));
        }

        {
            let mut versions = txn
                .open_table(SCHEMA_VERSION)
                .map_err(|e| fail(e.to_string()))?;
            versions
                .insert(version, epoch_secs())
                .map_err(|e| fail(e.to_string()))?;
        }
        txn.commit().map_err(|e| fail(e.to_string()))?;
        info!(version, description = migration.description, "migration applied");
        Ok(())
    }
}

// ── Built-in change functions ──────────────────────────────────────

/// v2: index non-terminal deployments by `host:port`.
fn create_active_endpoint_index(txn: &WriteTransaction) -> StateResult<()> {
    let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    txn.open_table(ACTIVE_ENDPOINTS).map_err(map_err!(Table))?;
    for entry in deployments.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let deployment: Deployment = decode(value.value())?;
        if deployment.status.is_active() {
            claim_endpoint(txn, &deployment.endpoint_key(), deployment.id)?;
        }
    }
    Ok(())
}

/// v3: index metric samples by creation time.
fn create_metric_time_index(txn: &WriteTransaction) -> StateResult<()> {
    let metrics = txn.open_table(METRICS).map_err(map_err!(Table))?;
    let mut times = txn.open_table(METRIC_TIMES).map_err(map_err!(Table))?;
    for entry in metrics.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let sample: MetricSample = decode(value.value())?;
        times
            .insert((sample.created_at, sample.deployment_id, sample.id), ())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}
