//! Worker handles: one OS child process per deployment.
//!
//! The supervisor only sees the [`Worker`] trait, so the control loop can be
//! exercised with in-process fakes. [`ProcessWorker`] is the real thing.

use std::collections::HashMap;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use tursi_state::Deployment;

use crate::error::{SupervisorError, SupervisorResult};

/// Environment variable carrying the deployment id into the worker.
pub const DEPLOYMENT_ID_ENV: &str = "TURSI_DEPLOYMENT_ID";

/// A single supervised worker.
pub trait Worker: Send {
    /// Launch the worker. Does not wait for it to become ready.
    fn start(&mut self) -> SupervisorResult<u32>;

    /// Non-blocking liveness probe. `false` before `start` and after exit.
    fn is_alive(&mut self) -> bool;

    /// Terminate gracefully, escalating to a forced kill once `grace`
    /// elapses. A no-op on an unstarted or already-exited worker.
    fn stop(&mut self, grace: Duration) -> impl Future<Output = ()> + Send;

    fn pid(&self) -> Option<u32>;

    /// How the worker ended, if known.
    fn exit_description(&self) -> Option<String> {
        None
    }
}

/// Builds unstarted workers for deployments.
pub trait WorkerFactory: Send {
    type Worker: Worker + 'static;

    fn create(&self, deployment: &Deployment) -> Self::Worker;
}

// ── Invocation ─────────────────────────────────────────────────────

/// What a worker serves.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub deployment_id: u64,
    pub model_name: String,
    pub host: String,
    pub port: u16,
    pub config: serde_json::Value,
}

impl From<&Deployment> for WorkerSpec {
    fn from(d: &Deployment) -> Self {
        Self {
            deployment_id: d.id,
            model_name: d.model_name.clone(),
            host: d.host.clone(),
            port: d.port,
            config: d.config.clone(),
        }
    }
}

/// The external program that hosts a model server.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "tursi-engine".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl WorkerCommand {
    /// Full argument list for one worker: the configured prefix followed by
    /// `--model`, `--host`, `--port` and `--config`.
    pub fn argv(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.extend([
            "--model".to_string(),
            spec.model_name.clone(),
            "--host".to_string(),
            spec.host.clone(),
            "--port".to_string(),
            spec.port.to_string(),
            "--config".to_string(),
            spec.config.to_string(),
        ]);
        argv
    }
}

// ── Process worker ─────────────────────────────────────────────────

/// A worker backed by a `tokio::process::Child`.
pub struct ProcessWorker {
    command: WorkerCommand,
    spec: WorkerSpec,
    child: Option<Child>,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
}

impl ProcessWorker {
    pub fn new(command: WorkerCommand, spec: WorkerSpec) -> Self {
        Self {
            command,
            spec,
            child: None,
            pid: None,
            exit: None,
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    fn signal_terminate(pid: u32) {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: kill(2) with a pid we spawned and still hold a handle to.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
        }
    }
}

impl Worker for ProcessWorker {
    fn start(&mut self) -> SupervisorResult<u32> {
        if let Some(pid) = self.pid.filter(|_| self.exit.is_none()) {
            return Ok(pid);
        }

        let child = Command::new(&self.command.program)
            .args(self.command.argv(&self.spec))
            .envs(&self.command.env)
            .env(DEPLOYMENT_ID_ENV, self.spec.deployment_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {e}", self.command.program)))?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("process exited before reporting a pid".into()))?;

        info!(
            deployment_id = self.spec.deployment_id,
            model = %self.spec.model_name,
            pid,
            "worker spawned"
        );
        self.child = Some(child);
        self.pid = Some(pid);
        self.exit = None;
        Ok(pid)
    }

    fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        if self.exit.is_some() {
            return false;
        }
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "liveness probe failed");
                false
            }
        }
    }

    async fn stop(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };

        if let Some(pid) = self.pid {
            Self::signal_terminate(pid);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.pid, %status, "worker exited");
                self.exit = Some(status);
            }
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "error waiting for worker");
            }
            Err(_) => {
                warn!(pid = ?self.pid, "worker did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    warn!(pid = ?self.pid, error = %e, "failed to kill worker");
                }
                if let Ok(Some(status)) = child.try_wait() {
                    self.exit = Some(status);
                }
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_description(&self) -> Option<String> {
        self.exit.map(|status| status.to_string())
    }
}

/// Produces [`ProcessWorker`]s that all run the same program.
#[derive(Debug, Clone, Default)]
pub struct ProcessWorkerFactory {
    command: WorkerCommand,
}

impl ProcessWorkerFactory {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    type Worker = ProcessWorker;

    fn create(&self, deployment: &Deployment) -> ProcessWorker {
        ProcessWorker::new(self.command.clone(), WorkerSpec::from(deployment))
    }
}
