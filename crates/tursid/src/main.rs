//! tursid — the Tursi daemon.
//!
//! Single binary that assembles every Tursi subsystem:
//! - State store (redb) with schema migrations
//! - Supervisor loop owning the model worker processes
//! - REST control API
//!
//! # Usage
//!
//! ```text
//! tursid run --config /etc/tursi/tursid.toml --api-port 5050
//! tursid migrate --data-dir /var/lib/tursi
//! ```

mod config;
mod daemon;
mod pidfile;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "tursid", version, about = "Tursi model deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor and control API until SIGTERM/SIGINT.
    Run {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the state store and pid file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Address the control API binds to.
        #[arg(long)]
        api_host: Option<String>,

        /// Port the control API listens on.
        #[arg(long)]
        api_port: Option<u16>,
    },
    /// Apply pending schema migrations and print the schema history.
    Migrate {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory holding the state store.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tursid=debug,tursi=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            api_host,
            api_port,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(host) = api_host {
                config.api.host = host;
            }
            if let Some(port) = api_port {
                config.api.port = port;
            }
            daemon::run(config).await
        }
        Command::Migrate { config, data_dir } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            migrate(&config)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<DaemonConfig> {
    match path {
        Some(path) => DaemonConfig::from_file(path),
        None => Ok(DaemonConfig::default()),
    }
}

fn migrate(config: &DaemonConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store = daemon::open_store(&config.db_path())?;
    for record in store.schema_history()? {
        println!("{:>4}  applied_at={}", record.version, record.applied_at);
    }
    Ok(())
}
