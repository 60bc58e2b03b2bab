//! Mutual watchdog between the primary (`sentineld`) and the supervisor
//! (`sentinel-watch`).
//!
//! Deliberately not a parent/child tree: either process can be killed on
//! its own and the survivor resurrects it. Liveness is a process-table
//! check by name before launching; the narrow window between check and
//! spawn is accepted, but a live primary is never intentionally doubled.
//! A missing credential vault after the primary exits means the operator
//! cancelled first-run setup, which is a stop, not a crash.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;

/// Binary names as they appear in the process table. Both stay within
/// the 15-byte Linux comm limit: a longer name gets truncated there and
/// name-based liveness checks stop seeing the process.
pub const PRIMARY_PROCESS: &str = "sentineld";
pub const SUPERVISOR_PROCESS: &str = "sentinel-watch";

/// Exit code the primary uses when the operator cancels first-run setup.
pub const EXIT_SETUP_CANCELLED: i32 = 100;

/// How often the primary confirms the supervisor is alive.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const ATTACH_POLL: Duration = Duration::from_secs(3);
const RELAUNCH_BACKOFF: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
}

/// The encrypted password vault written by first-run setup. Only its
/// existence matters here.
pub struct CredentialVault {
    path: PathBuf,
}

impl CredentialVault {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// True when a process with this name is in the process table. A failed
/// or empty query resolves to "absent": for a watchdog the safe wrong
/// answer is the one that relaunches.
pub fn process_running(name: &str) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let mut matches = sys.processes_by_name(OsStr::new(name));
    matches.next().is_some()
}

/// Path to a binary installed alongside the current executable.
pub fn sibling_binary(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// What to do after the primary goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVerdict {
    /// Exit code 0: intentional shutdown, the watchdog stops too.
    CleanStop,
    /// Setup was cancelled (dedicated exit code, or vault missing).
    SetupCancelled,
    /// Crash or kill: relaunch after a short backoff.
    Relaunch,
}

/// Classify a primary exit. The vault check dominates: no vault means
/// setup never completed, regardless of what code the exit carried.
/// `None` is a signal kill, which is never clean.
pub fn classify_exit(code: Option<i32>, vault_exists: bool) -> ExitVerdict {
    if !vault_exists {
        return ExitVerdict::SetupCancelled;
    }
    match code {
        Some(0) => ExitVerdict::CleanStop,
        Some(EXIT_SETUP_CANCELLED) => ExitVerdict::SetupCancelled,
        _ => ExitVerdict::Relaunch,
    }
}

/// The supervisor side: keep the primary alive until it stops cleanly.
pub struct Supervisor {
    primary_path: PathBuf,
    vault: CredentialVault,
}

impl Supervisor {
    pub fn new(primary_path: PathBuf, vault: CredentialVault) -> Self {
        Self {
            primary_path,
            vault,
        }
    }

    /// Supervise until the primary stops intentionally.
    pub async fn run(&self) {
        loop {
            // Attach mode: the primary may already be running (we were the
            // one that got killed and relaunched). Poll until it exits; no
            // exit code is observable this way, so the vault decides.
            if process_running(PRIMARY_PROCESS) {
                tracing::info!("watchdog: primary already running, attaching");
                while process_running(PRIMARY_PROCESS) {
                    tokio::time::sleep(ATTACH_POLL).await;
                }
                tracing::warn!("watchdog: primary disappeared");
                if !self.vault.exists() {
                    tracing::info!("watchdog: no vault, treating as cancelled setup, stopping");
                    return;
                }
                tokio::time::sleep(RELAUNCH_BACKOFF).await;
            }

            match self.spawn_and_wait().await {
                Ok(ExitVerdict::CleanStop) => {
                    tracing::info!("watchdog: primary exited cleanly, stopping");
                    return;
                }
                Ok(ExitVerdict::SetupCancelled) => {
                    tracing::info!("watchdog: setup cancelled, stopping");
                    return;
                }
                Ok(ExitVerdict::Relaunch) => {
                    tracing::warn!(
                        "watchdog: abnormal primary exit, relaunching in {:?}",
                        RELAUNCH_BACKOFF
                    );
                    tokio::time::sleep(RELAUNCH_BACKOFF).await;
                }
                Err(e) => {
                    tracing::error!("watchdog: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn spawn_and_wait(&self) -> Result<ExitVerdict, WatchdogError> {
        tracing::info!("watchdog: launching {}", self.primary_path.display());
        let status = Command::new(&self.primary_path)
            .status()
            .await
            .map_err(|e| WatchdogError::Spawn(self.primary_path.display().to_string(), e))?;

        Ok(classify_exit(status.code(), self.vault.exists()))
    }
}

/// The primary side: a background task that relaunches the supervisor
/// whenever it vanishes from the process table. Spawn failure is logged
/// and retried on the next heartbeat.
pub fn spawn_supervisor_heartbeat() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let supervisor_path = sibling_binary(SUPERVISOR_PROCESS);
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if process_running(SUPERVISOR_PROCESS) {
                continue;
            }

            tracing::warn!("heartbeat: supervisor absent, relaunching");
            match Command::new(&supervisor_path).spawn() {
                Ok(_child) => tracing::info!("heartbeat: supervisor relaunched"),
                Err(e) => tracing::error!("heartbeat: failed to spawn supervisor: {}", e),
            }
        }
    })
}
