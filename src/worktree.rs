//! Worktree Provisioner: one checkout + session pair per epic.
//!
//! Creation shells out to the worktree tool with `--shell` so the session
//! comes up running an interactive shell, not an agent; the runner invokes
//! the agent itself. A `.wt-batch-mode` marker inside the checkout tells
//! manual cleanup tooling the pair is orchestrator-owned.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::subprocess::Tool;

/// Marker file consulted by cleanup tooling. Content is the owning epic ID.
pub const BATCH_MARKER: &str = ".wt-batch-mode";

/// Drop file written by `herd signal bead-done` while the runner is alive.
/// The runner consumes it at the next idle-poll tick.
pub const DONE_FILE: &str = ".herd-bead-done";

/// Contents of the done drop file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneSignal {
    pub bead_id: String,
    pub summary: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Stage a completion signal for the runner to consume.
pub fn write_done_signal(worktree: &Path, bead_id: &str, summary: &str) -> anyhow::Result<()> {
    let signal = DoneSignal {
        bead_id: bead_id.to_string(),
        summary: summary.to_string(),
        at: chrono::Utc::now(),
    };
    let json = serde_json::to_string_pretty(&signal).context("serializing done signal")?;
    std::fs::write(worktree.join(DONE_FILE), json)
        .with_context(|| format!("writing {DONE_FILE} in {}", worktree.display()))
}

/// Read a pending completion signal, if any.
pub fn read_done_signal(worktree: &Path) -> Option<DoneSignal> {
    let content = std::fs::read_to_string(worktree.join(DONE_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Remove a consumed (or stale) completion signal.
pub fn clear_done_signal(worktree: &Path) {
    let _ = std::fs::remove_file(worktree.join(DONE_FILE));
}

/// Walk up from `start` to the checkout root holding the batch marker.
pub fn find_marked_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        if current.join(BATCH_MARKER).exists() {
            return Some(current.to_path_buf());
        }
        dir = current.parent();
    }
    None
}

static WORKTREE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Worktree:\s+(.+)$").expect("static regex"));
static SESSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Session '([^']+)' ready").expect("static regex"));

#[derive(Debug, Clone)]
pub struct WorktreeProvisioner {
    worktree_bin: String,
    git_bin: String,
    project_dir: PathBuf,
}

impl WorktreeProvisioner {
    pub fn new(worktree_bin: &str, git_bin: &str, project_dir: &Path) -> Self {
        Self {
            worktree_bin: worktree_bin.to_string(),
            git_bin: git_bin.to_string(),
            project_dir: project_dir.to_path_buf(),
        }
    }

    /// Create a worktree and its shell session for `epic_id`.
    ///
    /// Returns the checkout path and the session name the tool actually
    /// allocated (which may differ from the requested one).
    pub fn create(&self, epic_id: &str, session_name: &str) -> anyhow::Result<(PathBuf, String)> {
        let output = Tool::new(&self.worktree_bin)
            .args(&["worktree-create", epic_id, "--shell", "--session", session_name])
            .current_dir(&self.project_dir)
            .run_ok()
            .map_err(|e| ExitError::VcsIo(format!("worktree create: {e:#}")))?;

        parse_create_output(&output.stdout)
    }

    /// Write the batch-mode marker into the checkout.
    pub fn write_marker(&self, worktree: &Path, epic_id: &str) -> anyhow::Result<()> {
        std::fs::write(worktree.join(BATCH_MARKER), epic_id)
            .with_context(|| format!("writing {BATCH_MARKER} in {}", worktree.display()))
    }

    /// Epic ID from the marker, if present.
    pub fn read_marker(worktree: &Path) -> Option<String> {
        std::fs::read_to_string(worktree.join(BATCH_MARKER))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Remove the marker. Missing is fine.
    pub fn remove_marker(&self, worktree: &Path) {
        let _ = std::fs::remove_file(worktree.join(BATCH_MARKER));
    }

    /// Short hash and subject of the checkout's current HEAD.
    pub fn latest_commit(&self, worktree: &Path) -> anyhow::Result<(String, String)> {
        let hash = Tool::new(&self.git_bin)
            .args(&["rev-parse", "--short", "HEAD"])
            .current_dir(worktree)
            .run_ok()
            .map_err(|e| ExitError::VcsIo(format!("rev-parse: {e:#}")))?;
        let subject = Tool::new(&self.git_bin)
            .args(&["log", "-1", "--format=%s"])
            .current_dir(worktree)
            .run_ok()
            .map_err(|e| ExitError::VcsIo(format!("log: {e:#}")))?;
        Ok((
            hash.stdout.trim().to_string(),
            subject.stdout.trim().to_string(),
        ))
    }

    /// Force-remove the checkout (abort path).
    pub fn remove(&self, worktree: &Path) -> anyhow::Result<()> {
        Tool::new(&self.git_bin)
            .args(&["worktree", "remove", "--force"])
            .arg(&worktree.to_string_lossy())
            .current_dir(&self.project_dir)
            .run_ok()
            .map_err(|e| ExitError::VcsIo(format!("worktree remove: {e:#}")))?;
        Ok(())
    }
}

/// Parse the worktree tool's create output into (path, session).
fn parse_create_output(stdout: &str) -> anyhow::Result<(PathBuf, String)> {
    let path = WORKTREE_RE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| PathBuf::from(m.as_str().trim()))
        .ok_or_else(|| ExitError::VcsIo("create output missing 'Worktree:' line".to_string()))?;
    let session = SESSION_RE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ExitError::VcsIo("create output missing session line".to_string()))?;
    Ok((path, session))
}
