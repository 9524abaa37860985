//! Durable epic-run state.
//!
//! One JSON document per project, replaced whole on every save via
//! write-then-rename so readers never observe a partial record. The file is
//! removed only when a run reaches `completed`; `failed` and `partial`
//! records stay behind for resume/abort.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Run status. `failed` pauses on the failing bead; `partial` means the run
/// finished with failures recorded; `completed` runs are deleted on sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicStatus {
    Running,
    Paused,
    Failed,
    Partial,
    Completed,
}

impl std::fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EpicStatus::Running => "running",
            EpicStatus::Paused => "paused",
            EpicStatus::Failed => "failed",
            EpicStatus::Partial => "partial",
            EpicStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Commit captured after a bead completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeadCommit {
    pub bead_id: String,
    pub commit_hash: String,
    pub summary: String,
    pub title: String,
}

/// The central durable record, one per active epic per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicState {
    pub epic_id: String,
    pub epic_title: String,
    pub worktree: PathBuf,
    pub session_name: String,
    /// Processing order; stable for the life of the run.
    pub beads: Vec<String>,
    pub bead_titles: BTreeMap<String, String>,
    /// Prefix-preserving subsequence of `beads`, no duplicates.
    pub completed_beads: Vec<String>,
    pub bead_commits: Vec<BeadCommit>,
    /// Bead ID to outcome tag; disjoint from `completed_beads`.
    pub failed_beads: BTreeMap<String, String>,
    /// Bead currently executing; empty when idle or finalized.
    #[serde(default)]
    pub current_bead: String,
    pub status: EpicStatus,
    pub start_time: DateTime<Utc>,
    pub project_dir: PathBuf,
    #[serde(default)]
    pub merge_mode: String,
}

impl EpicState {
    /// Beads not yet completed, in processing order.
    pub fn pending_beads(&self) -> Vec<String> {
        self.beads
            .iter()
            .filter(|b| !self.completed_beads.contains(b))
            .cloned()
            .collect()
    }

    /// Append a completion, keeping the list duplicate-free.
    pub fn record_completion(&mut self, bead_id: &str) {
        if !self.completed_beads.iter().any(|b| b == bead_id) {
            self.completed_beads.push(bead_id.to_string());
        }
        self.failed_beads.remove(bead_id);
    }

    pub fn record_commit(&mut self, bead_id: &str, hash: &str, summary: &str) {
        let title = self.bead_titles.get(bead_id).cloned().unwrap_or_default();
        self.bead_commits.push(BeadCommit {
            bead_id: bead_id.to_string(),
            commit_hash: hash.to_string(),
            summary: summary.to_string(),
            title,
        });
    }

    pub fn record_failure(&mut self, bead_id: &str, outcome: &str) {
        self.failed_beads
            .insert(bead_id.to_string(), outcome.to_string());
    }

    pub fn all_done(&self) -> bool {
        self.completed_beads.len() == self.beads.len() && self.failed_beads.is_empty()
    }

    /// Check the structural invariants enforced on every save.
    pub fn validate(&self) -> Result<(), String> {
        // completed_beads must be a subsequence of beads, without duplicates.
        let mut cursor = self.beads.iter();
        for completed in &self.completed_beads {
            if !cursor.any(|b| b == completed) {
                return Err(format!(
                    "completed bead {completed} is not in order within the bead list"
                ));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for completed in &self.completed_beads {
            if !seen.insert(completed) {
                return Err(format!("duplicate completed bead {completed}"));
            }
        }

        for failed in self.failed_beads.keys() {
            if !self.beads.contains(failed) {
                return Err(format!("failed bead {failed} is not in the bead list"));
            }
            if self.completed_beads.contains(failed) {
                return Err(format!("bead {failed} is both completed and failed"));
            }
        }

        for commit in &self.bead_commits {
            if !self.completed_beads.contains(&commit.bead_id) {
                return Err(format!(
                    "commit recorded for {} which is not completed",
                    commit.bead_id
                ));
            }
        }

        if self.status == EpicStatus::Completed && !self.all_done() {
            return Err("status is completed but beads remain".to_string());
        }

        Ok(())
    }
}

/// Per-project store under the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open the default store (`$HERD_STATE_DIR`, else
    /// `$XDG_STATE_HOME/herd`, else `~/.local/state/herd`).
    pub fn open() -> Self {
        Self { dir: state_dir() }
    }

    /// Open a store rooted at an explicit directory (tests).
    pub fn at(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn state_path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{project}.state.json"))
    }

    pub fn lock_path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{project}.lock"))
    }

    pub fn stop_path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{project}.stop"))
    }

    /// Load the state for a project. `Ok(None)` when no file exists.
    ///
    /// The legacy keyless filename is accepted for read-back only; saves
    /// always write the per-project form.
    pub fn load(&self, project: &str) -> anyhow::Result<Option<EpicState>> {
        let path = self.state_path(project);
        if path.exists() {
            return self.read(&path, project).map(Some);
        }
        let legacy = self.dir.join("state.json");
        if legacy.exists() {
            return self.read(&legacy, project).map(Some);
        }
        Ok(None)
    }

    /// Persist the state, enforcing invariants, atomically.
    pub fn save(&self, project: &str, state: &EpicState) -> anyhow::Result<()> {
        state
            .validate()
            .map_err(|detail| ExitError::StateCorrupt {
                project: project.to_string(),
                detail,
            })?;

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = self.state_path(project);
        let tmp = self.dir.join(format!("{project}.state.json.tmp"));
        let json = serde_json::to_string_pretty(state).context("serializing epic state")?;
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }

    /// Delete the state file. Missing is fine.
    pub fn remove(&self, project: &str) {
        let _ = std::fs::remove_file(self.state_path(project));
    }

    /// Find the project whose saved state owns `worktree` (signal handler
    /// entry path).
    pub fn find_by_worktree(&self, worktree: &Path) -> anyhow::Result<Option<(String, EpicState)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(project) = name.strip_suffix(".state.json") else {
                continue;
            };
            if let Ok(Some(state)) = self.load(project) {
                if state.worktree == worktree {
                    return Ok(Some((project.to_string(), state)));
                }
            }
        }
        Ok(None)
    }

    fn read(&self, path: &Path, project: &str) -> anyhow::Result<EpicState> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).map_err(|e| {
            ExitError::StateCorrupt {
                project: project.to_string(),
                detail: e.to_string(),
            }
            .into()
        })
    }
}

/// Resolve the state directory.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HERD_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("herd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local/state/herd")
}
