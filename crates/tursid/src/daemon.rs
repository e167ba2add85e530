//! Daemon assembly: pid file, store, supervisor task, API server, signals.

use std::path::Path;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{debug, error, info};

use tursi_state::StateStore;
use tursi_supervisor::{ProcessWorkerFactory, Supervisor, SupervisorConfig, SupervisorHandle, WorkerCommand};

use crate::config::DaemonConfig;
use crate::pidfile::PidFile;

/// Open the store and bring it to the current schema. Any migration error
/// is fatal to the caller.
pub fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    let store = StateStore::bootstrap(path)
        .with_context(|| format!("opening state store {}", path.display()))?;
    let before = store.current_schema_version()?;
    let after = store.migrate().context("schema migration failed")?;
    info!(path = %path.display(), from = before, to = after, "state store ready");
    Ok(store)
}

/// Run the daemon until SIGTERM or SIGINT.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("Tursi daemon starting");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let pidfile = PidFile::acquire(&config.pid_path())?;
    info!(pid = pidfile.pid(), path = %pidfile.path().display(), "pid file written");

    // Migrations finish before the supervisor sees a single row.
    let store = open_store(&config.db_path())?;

    // Handlers are installed before anything can be interrupted.
    let signals = Signals::install()?;

    // ── Supervisor ─────────────────────────────────────────────

    let factory = ProcessWorkerFactory::new(WorkerCommand::from(&config.worker));
    let (supervisor, handle) =
        Supervisor::new(store.clone(), factory, SupervisorConfig::from(&config.supervisor));
    let supervisor_task = tokio::spawn(supervisor.run());
    let signal_task = tokio::spawn(signals.forward(handle.clone()));

    // ── API server ─────────────────────────────────────────────

    let served = serve_api(&config, store, handle.clone()).await;
    if let Err(e) = &served {
        error!(error = %e, "API server failed");
    }

    handle.shutdown();
    signal_task.abort();
    if let Err(e) = supervisor_task.await {
        error!(error = %e, "supervisor task panicked");
    }

    drop(pidfile);
    info!("Tursi daemon stopped");
    served
}

async fn serve_api(
    config: &DaemonConfig,
    store: StateStore,
    handle: SupervisorHandle,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding API listener on {addr}"))?;
    info!(addr = %listener.local_addr()?, "API server listening");

    let router = tursi_api::build_router(store);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { handle.shutdown_requested().await })
        .await?;
    Ok(())
}

/// OS signal streams, turned into supervisor commands.
struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
}

impl Signals {
    fn install() -> anyhow::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("installing SIGTERM handler")?,
            interrupt: signal(SignalKind::interrupt()).context("installing SIGINT handler")?,
            hangup: signal(SignalKind::hangup()).context("installing SIGHUP handler")?,
        })
    }

    async fn forward(mut self, handle: SupervisorHandle) {
        loop {
            tokio::select! {
                _ = self.terminate.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = self.interrupt.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
                _ = self.hangup.recv() => {
                    info!("SIGHUP received, reloading");
                    if !handle.reload() {
                        debug!("reload already pending");
                    }
                }
            }
        }
        handle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_store_migrates_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("tursi.redb")).unwrap();
        assert_eq!(
            store.current_schema_version().unwrap(),
            tursi_state::Migrations::builtin().target_version()
        );
    }

    #[tokio::test]
    async fn refuses_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            data_dir: dir.path().to_path_buf(),
            ..DaemonConfig::default()
        };
        let mut holder = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(config.pid_path(), format!("{}\n", holder.id())).unwrap();

        let err = run(config).await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        holder.kill().unwrap();
        holder.wait().unwrap();
    }
}
