//! Single-instance enforcement via a PID file in the data directory.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, warn};

const MAX_ATTEMPTS: usize = 3;
/// How long an empty pid file is taken to belong to a daemon still starting.
const STARTING_WINDOW: Duration = Duration::from_secs(5);

/// Holds the PID file for the lifetime of the daemon; removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Claim `path` for the current process.
    ///
    /// The file is created exclusively, so of two daemons starting at once
    /// only one wins. An existing file naming another live process fails the
    /// call. A file left behind by a dead process, or one with unparseable
    /// content, is removed and the exclusive create is retried.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        let own = std::process::id();
        for _ in 0..MAX_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{own}")
                        .with_context(|| format!("writing pid file {}", path.display()))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid: own,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    Self::clear_stale(path, own)?;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("creating pid file {}", path.display()));
                }
            }
        }
        bail!("could not claim pid file {} (contended)", path.display());
    }

    /// Remove an existing pid file unless it belongs to a live process.
    fn clear_stale(path: &Path, own: u32) -> anyhow::Result<()> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            // Removed between our create and read; just retry.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading pid file {}", path.display()));
            }
        };
        let content = content.trim();
        if content.is_empty() && recently_modified(path) {
            // Created by a daemon that has not written its pid yet.
            bail!("another tursid is starting ({})", path.display());
        }
        match content.parse::<u32>() {
            Ok(pid) if pid != own && process_alive(pid) => {
                bail!("tursid already running with pid {pid} ({})", path.display());
            }
            Ok(pid) => debug!(pid, path = %path.display(), "replacing stale pid file"),
            Err(_) => warn!(path = %path.display(), "replacing unreadable pid file"),
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing stale pid file {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if it still names us.
        let ours = fs::read_to_string(&self.path)
            .map(|c| c.trim().parse::<u32>().ok() == Some(self.pid))
            .unwrap_or(false);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
            }
        }
    }
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age < STARTING_WINDOW)
}

/// Whether `pid` names a running process (signal 0 probe).
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tursid.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(pidfile.pid(), std::process::id());
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn live_process_blocks_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tursid.pid");

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, format!("{}\n", child.id())).unwrap();

        let err = PidFile::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn stale_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tursid.pid");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{dead}\n")).unwrap();

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(pidfile.path(), path.as_path());
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), std::process::id().to_string());
    }

    #[test]
    fn garbage_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tursid.pid");
        fs::write(&path, "not a pid").unwrap();

        assert!(PidFile::acquire(&path).is_ok());
    }

    #[test]
    fn drop_leaves_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tursid.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        fs::write(&path, "1\n").unwrap();
        drop(pidfile);
        assert!(path.exists());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }

    #[test]
    fn losing_acquire_leaves_winner_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tursid.pid");

        let mut winner = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path).unwrap();
        writeln!(file, "{}", winner.id()).unwrap();

        assert!(PidFile::acquire(&path).is_err());
        assert!(PidFile::acquire(&path).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), winner.id().to_string());

        winner.kill().unwrap();
        winner.wait().unwrap();
    }

    #[test]
    fn file_still_being_written_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tursid.pid");
        fs::write(&path, "").unwrap();

        let err = PidFile::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("starting"));
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }
}
