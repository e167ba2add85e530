//! tursid.toml configuration.
//!
//! Every section is optional; missing keys fall back to the defaults below
//! and CLI flags override whatever the file says.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use tursi_supervisor::{SupervisorConfig, WorkerCommand};

pub const DEFAULT_DATA_DIR: &str = "/var/lib/tursi";
pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 5050;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub api: ApiConfig,
    pub supervisor: SupervisorSection,
    pub worker: WorkerSection,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            api: ApiConfig::default(),
            supervisor: SupervisorSection::default(),
            worker: WorkerSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_API_HOST.to_string(),
            port: DEFAULT_API_PORT,
        }
    }
}

/// `[supervisor]`: durations are strings such as `"500ms"`, `"5s"`, `"2m"`, `"1h"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(deserialize_with = "duration_str")]
    pub reconcile_interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub health_interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub retention_interval: Duration,
    pub metrics_max_age_hours: u64,
    #[serde(deserialize_with = "duration_str")]
    pub stop_grace: Duration,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            reconcile_interval: defaults.reconcile_interval,
            health_interval: defaults.health_interval,
            retention_interval: defaults.retention_interval,
            metrics_max_age_hours: defaults.metrics_max_age_hours,
            stop_grace: defaults.stop_grace,
        }
    }
}

impl From<&SupervisorSection> for SupervisorConfig {
    fn from(s: &SupervisorSection) -> Self {
        SupervisorConfig {
            reconcile_interval: s.reconcile_interval,
            health_interval: s.health_interval,
            retention_interval: s.retention_interval,
            metrics_max_age_hours: s.metrics_max_age_hours,
            stop_grace: s.stop_grace,
        }
    }
}

/// `[worker]`: the program launched for every deployment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let defaults = WorkerCommand::default();
        Self {
            program: defaults.program,
            args: defaults.args,
            env: defaults.env,
        }
    }
}

impl From<&WorkerSection> for WorkerCommand {
    fn from(w: &WorkerSection) -> Self {
        WorkerCommand {
            program: w.program.clone(),
            args: w.args.clone(),
            env: w.env.clone(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let s = &self.supervisor;
        for (name, value) in [
            ("reconcile_interval", s.reconcile_interval),
            ("health_interval", s.health_interval),
            ("retention_interval", s.retention_interval),
        ] {
            anyhow::ensure!(!value.is_zero(), "supervisor.{name} must be greater than zero");
        }
        anyhow::ensure!(!self.worker.program.trim().is_empty(), "worker.program must not be empty");
        Ok(())
    }

    /// Path of the redb state file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tursi.redb")
    }

    /// Path of the single-instance PID file.
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("tursid.pid")
    }
}

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, millis_per_unit) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()?
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {raw:?}")))
}
