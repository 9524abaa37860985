//! Per-project advisory lock and cooperative stop.
//!
//! The lock file holds the owning PID and start time; a lock whose PID is no
//! longer alive is stale and may be replaced. The stop file is written by
//! `herd stop` (or a signal) and consumed by the runner between beads.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::state::StateStore;

/// Contents of `<project>.lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: i32,
    pub start_time: DateTime<Utc>,
    pub project: String,
    pub epic: String,
}

/// True when `pid` refers to a live process.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Read the lock record if one exists. Unparseable lock files are treated as
/// stale (returns None).
pub fn read(store: &StateStore, project: &str) -> Option<LockRecord> {
    let content = std::fs::read_to_string(store.lock_path(project)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Acquire the per-project lock.
///
/// A live holder fails with `Contended` unless `force` is set; a stale lock
/// is silently replaced.
pub fn acquire(
    store: &StateStore,
    project: &str,
    epic: &str,
    force: bool,
) -> anyhow::Result<LockRecord> {
    if let Some(existing) = read(store, project) {
        if pid_alive(existing.pid) && !force {
            return Err(ExitError::Contended {
                project: project.to_string(),
                pid: existing.pid,
            }
            .into());
        }
        if pid_alive(existing.pid) {
            tracing::warn!(pid = existing.pid, "forcing lock away from a live process");
        }
    }

    let record = LockRecord {
        pid: std::process::id() as i32,
        start_time: Utc::now(),
        project: project.to_string(),
        epic: epic.to_string(),
    };

    let path = store.lock_path(project);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&record).context("serializing lock record")?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(record)
}

/// Best-effort lock release.
pub fn release(store: &StateStore, project: &str) {
    let _ = std::fs::remove_file(store.lock_path(project));
}

/// True when the lock exists and its holder is alive.
pub fn holder_alive(store: &StateStore, project: &str) -> bool {
    read(store, project).is_some_and(|r| pid_alive(r.pid))
}

/// Write the stop file consulted between beads.
pub fn request_stop(store: &StateStore, project: &str) -> anyhow::Result<()> {
    let path = store.stop_path(project);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&path, Utc::now().to_rfc3339())
        .with_context(|| format!("writing {}", path.display()))
}

/// Check for a pending stop request without consuming it.
pub fn stop_requested(store: &StateStore, project: &str) -> bool {
    store.stop_path(project).exists()
}

/// Remove the stop file once observed.
pub fn clear_stop(store: &StateStore, project: &str) {
    let _ = std::fs::remove_file(store.stop_path(project));
}

/// Route SIGINT/SIGTERM into the cooperative stop channel.
///
/// The handler only raises the flag and drops the stop file; the in-flight
/// bead runs to its outcome and the runner pauses at the next boundary.
pub fn install_signal_stop(store: &StateStore, project: &str) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    let handler_store = store.clone();
    let handler_project = project.to_string();

    let result = ctrlc::set_handler(move || {
        eprintln!("stop requested; finishing the current bead first");
        handler_flag.store(true, Ordering::SeqCst);
        let _ = request_stop(&handler_store, &handler_project);
    });
    if let Err(e) = result {
        tracing::warn!("could not install signal handler: {e}");
    }

    flag
}

/// Combined stop check: signal flag or stop file.
pub fn should_stop(store: &StateStore, project: &str, flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst) || stop_requested(store, project)
}

/// Stale-lock note for check output.
pub fn describe(record: &LockRecord) -> String {
    let liveness = if pid_alive(record.pid) {
        "alive"
    } else {
        "stale"
    };
    format!(
        "pid {} ({liveness}), epic {}, started {}",
        record.pid,
        record.epic,
        record.start_time.to_rfc3339()
    )
}
