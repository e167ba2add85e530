//! The supervisor control loop.
//!
//! A single task owns the worker table and drives three timers
//! (reconcile, health, retention) plus a command channel and a shutdown
//! watch. Every decision is re-derived from the store on each pass, so a
//! failed status write is simply retried on the next tick.
//!
//! Worker stops run in a [`JoinSet`] owned by the loop and are settled as
//! they finish, so a slow stop never holds up the timers or the shutdown
//! watch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tursi_state::{level, Deployment, DeploymentId, DeploymentStatus, StateError, StateStore};

use crate::probe::{ResourceProbe, SysinfoProbe};
use crate::worker::{Worker, WorkerFactory};

/// Timer and grace settings for the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub reconcile_interval: Duration,
    pub health_interval: Duration,
    pub retention_interval: Duration,
    pub metrics_max_age_hours: u64,
    /// How long a worker gets between SIGTERM and a forced kill.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(5),
            retention_interval: Duration::from_secs(3600),
            metrics_max_age_hours: 24,
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Messages delivered into the loop's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Re-read the store and reconcile immediately.
    Reload,
}

/// Why a worker is being stopped; decides how its completion is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    /// The row is `stopping` and moves to `stopped` once the worker is gone.
    Requested,
    /// The row already left the active set.
    Orphaned,
    /// Daemon shutdown; the row keeps its status.
    Shutdown,
}

/// Cloneable control surface for a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    shutdown: Arc<watch::Sender<bool>>,
    commands: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Queue a reload. Returns `false` if the loop is gone or a reload
    /// is already queued.
    pub fn reload(&self) -> bool {
        self.commands.try_send(SupervisorCommand::Reload).is_ok()
    }

    /// Ask the loop to stop every worker and return.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        while !flag_set(&mut rx) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn flag_set(rx: &mut watch::Receiver<bool>) -> bool {
    *rx.borrow_and_update()
}

/// Reconciles deployment rows with live workers.
pub struct Supervisor<F: WorkerFactory> {
    store: StateStore,
    factory: F,
    probe: Box<dyn ResourceProbe>,
    config: SupervisorConfig,
    /// Live workers by deployment id. Never shared outside this struct.
    workers: HashMap<DeploymentId, F::Worker>,
    /// Stops in flight; `stopping` holds their deployment ids.
    stops: JoinSet<(DeploymentId, StopCause)>,
    stopping: HashSet<DeploymentId>,
    shutdown: watch::Receiver<bool>,
    commands: mpsc::Receiver<SupervisorCommand>,
}

impl<F: WorkerFactory> Supervisor<F> {
    pub fn new(store: StateStore, factory: F, config: SupervisorConfig) -> (Self, SupervisorHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let supervisor = Self {
            store,
            factory,
            probe: Box::new(SysinfoProbe::new()),
            config,
            workers: HashMap::new(),
            stops: JoinSet::new(),
            stopping: HashSet::new(),
            shutdown: shutdown_rx,
            commands: commands_rx,
        };
        let handle = SupervisorHandle {
            shutdown: Arc::new(shutdown_tx),
            commands: commands_tx,
        };
        (supervisor, handle)
    }

    /// Replace the resource probe used by the health poll.
    pub fn with_probe(mut self, probe: impl ResourceProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Deployment ids that currently have a worker, ascending.
    pub fn tracked(&self) -> Vec<DeploymentId> {
        let mut ids: Vec<_> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Deployment ids whose worker is still being stopped, ascending.
    pub fn stops_in_flight(&self) -> Vec<DeploymentId> {
        let mut ids: Vec<_> = self.stopping.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run until the shutdown signal, then stop every worker.
    pub async fn run(mut self) {
        info!(
            reconcile_ms = self.config.reconcile_interval.as_millis() as u64,
            health_ms = self.config.health_interval.as_millis() as u64,
            retention_secs = self.config.retention_interval.as_secs(),
            "supervisor started"
        );

        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        let mut health = tokio::time::interval(self.config.health_interval);
        let mut retention = tokio::time::interval(self.config.retention_interval);
        for timer in [&mut reconcile, &mut health, &mut retention] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        while !self.cancelled() {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(command) = self.commands.recv() => match command {
                    SupervisorCommand::Reload => {
                        info!("reload requested");
                        self.reconcile();
                    }
                },
                Some(joined) = self.stops.join_next(), if !self.stops.is_empty() => {
                    self.settle_stop(joined);
                }
                _ = reconcile.tick() => self.reconcile(),
                _ = health.tick() => self.poll_health(),
                _ = retention.tick() => self.sweep_retention(),
            }
        }

        info!("supervisor shutting down");
        self.shutdown_workers().await;
        info!("supervisor stopped");
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Compare active rows against the worker table and correct any
    /// divergence. Stops are started here and settled as they complete.
    pub fn reconcile(&mut self) {
        let rows = match self.store.list_active() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "reconcile: failed to list active deployments");
                return;
            }
        };

        // Handles whose row left the active set behind our back.
        let active: HashSet<_> = rows.iter().map(|d| d.id).collect();
        let orphans: Vec<_> = self
            .workers
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();
        for id in orphans {
            if let Some(worker) = self.workers.remove(&id) {
                debug!(deployment_id = id, "tearing down worker of inactive deployment");
                self.spawn_stop(id, worker, StopCause::Orphaned);
            }
        }

        for deployment in &rows {
            if self.cancelled() {
                debug!("reconcile interrupted by shutdown");
                break;
            }
            if self.stopping.contains(&deployment.id) {
                continue;
            }
            match deployment.status {
                DeploymentStatus::Pending | DeploymentStatus::Running => {
                    self.ensure_started(deployment);
                }
                DeploymentStatus::Stopping => match self.workers.remove(&deployment.id) {
                    Some(worker) => self.spawn_stop(deployment.id, worker, StopCause::Requested),
                    None => self.finish_stop(deployment.id),
                },
                DeploymentStatus::Stopped | DeploymentStatus::Failed => {}
            }
        }
    }

    fn ensure_started(&mut self, deployment: &Deployment) {
        let id = deployment.id;

        if let Some(worker) = self.workers.get(&id) {
            // Started earlier but the `running` write did not persist.
            if deployment.status == DeploymentStatus::Pending {
                if let Some(pid) = worker.pid() {
                    self.record_start(id, pid);
                }
            }
            return;
        }

        let mut worker = self.factory.create(deployment);
        match worker.start() {
            Ok(pid) => {
                if deployment.status == DeploymentStatus::Running {
                    info!(deployment_id = id, pid, "recovered deployment");
                } else {
                    info!(deployment_id = id, model = %deployment.model_name, pid, "deployment started");
                }
                self.workers.insert(id, worker);
                self.record_start(id, pid);
                self.log(id, level::INFO, &format!("Started model process with PID {pid}"));
            }
            Err(e) => {
                error!(deployment_id = id, error = %e, "failed to start worker");
                self.log(id, level::ERROR, &format!("Failed to start model process: {e}"));
                if let Err(e) = self.store.transition(
                    id,
                    &[DeploymentStatus::Pending, DeploymentStatus::Running],
                    DeploymentStatus::Failed,
                ) {
                    warn!(deployment_id = id, error = %e, "failed to mark deployment failed");
                }
            }
        }
    }

    fn record_start(&self, id: DeploymentId, pid: u32) {
        if let Err(e) = self.store.record_start(id, pid) {
            warn!(deployment_id = id, error = %e, "failed to record worker start, will retry");
        }
    }

    fn spawn_stop(&mut self, id: DeploymentId, mut worker: F::Worker, cause: StopCause) {
        let grace = self.config.stop_grace;
        self.stopping.insert(id);
        self.stops.spawn(async move {
            worker.stop(grace).await;
            (id, cause)
        });
    }

    fn settle_stop(&mut self, joined: Result<(DeploymentId, StopCause), JoinError>) {
        match joined {
            Ok((id, cause)) => {
                self.stopping.remove(&id);
                match cause {
                    StopCause::Requested => self.finish_stop(id),
                    StopCause::Orphaned => debug!(deployment_id = id, "orphaned worker stopped"),
                    StopCause::Shutdown => {
                        debug!(deployment_id = id, "worker stopped for shutdown");
                        self.log(id, level::INFO, "Stopped model process");
                    }
                }
            }
            Err(e) => error!(error = %e, "worker stop task panicked"),
        }
        // A panicked task drops its worker; once nothing is in flight the
        // next pass settles any `stopping` row left behind.
        if self.stops.is_empty() {
            self.stopping.clear();
        }
    }

    /// Wait for every in-flight stop and record its outcome.
    pub async fn wait_for_stops(&mut self) {
        while let Some(joined) = self.stops.join_next().await {
            self.settle_stop(joined);
        }
    }

    fn finish_stop(&self, id: DeploymentId) {
        match self
            .store
            .transition(id, &[DeploymentStatus::Stopping], DeploymentStatus::Stopped)
        {
            Ok((_, true)) => {
                info!(deployment_id = id, "deployment stopped");
                self.log(id, level::INFO, "Stopped model process");
            }
            Ok((row, false)) => {
                debug!(deployment_id = id, status = %row.status, "stop already settled");
            }
            Err(e) => warn!(deployment_id = id, error = %e, "failed to mark deployment stopped"),
        }
    }

    // ── Health & metrics ───────────────────────────────────────────

    /// Probe every tracked worker: dead ones fail their deployment, live
    /// ones contribute a metric sample.
    pub fn poll_health(&mut self) {
        let ids = self.tracked();
        for id in ids {
            if self.cancelled() {
                break;
            }
            let Some(worker) = self.workers.get_mut(&id) else {
                continue;
            };
            let alive = worker.is_alive();
            let pid = worker.pid();
            let exit = worker.exit_description();

            if alive {
                if let Some(usage) = pid.and_then(|pid| self.probe.sample(pid)) {
                    if let Err(e) = self.store.append_metric(id, usage.cpu_percent, usage.memory_mb) {
                        warn!(deployment_id = id, error = %e, "failed to record metric sample");
                    }
                }
                continue;
            }

            match self.store.transition(
                id,
                &[DeploymentStatus::Pending, DeploymentStatus::Running],
                DeploymentStatus::Failed,
            ) {
                Ok((_, true)) => {
                    error!(deployment_id = id, pid = ?pid, exit = ?exit, "worker exited unexpectedly");
                    let message = match exit {
                        Some(exit) => format!("Model process exited unexpectedly ({exit})"),
                        None => "Model process exited unexpectedly".to_string(),
                    };
                    self.log(id, level::ERROR, &message);
                    self.workers.remove(&id);
                }
                // `stopping` rows are settled by the next reconcile pass.
                Ok((row, false)) => {
                    if row.status.is_terminal() {
                        self.workers.remove(&id);
                    }
                }
                Err(StateError::NotFound(_)) => {
                    self.workers.remove(&id);
                }
                Err(e) => {
                    warn!(deployment_id = id, error = %e, "failed to mark deployment failed, will retry");
                }
            }
        }
    }

    // ── Retention ──────────────────────────────────────────────────

    pub fn sweep_retention(&self) {
        match self.store.prune_metrics(self.config.metrics_max_age_hours) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned old metric samples"),
            Err(e) => warn!(error = %e, "metric retention sweep failed"),
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Stop every tracked worker concurrently and wait for stops already in
    /// flight. Deployment statuses are left as they are so the next start
    /// recovers them.
    pub async fn shutdown_workers(&mut self) {
        let workers: Vec<_> = self.workers.drain().collect();
        for (id, worker) in workers {
            self.spawn_stop(id, worker, StopCause::Shutdown);
        }
        self.wait_for_stops().await;
    }

    fn log(&self, id: DeploymentId, level: &str, message: &str) {
        if let Err(e) = self.store.append_log(id, level, message) {
            warn!(deployment_id = id, error = %e, "failed to append deployment log");
        }
    }
}
