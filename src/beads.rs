//! Issue Gateway: thin adapter over the beads CLI.
//!
//! Tolerant parsing for `show`, `dep list`, and `ready` output. Fields the
//! tracker adds later are ignored; fields it omits default. The runner treats
//! a bead as immutable within one iteration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ExitError;
use crate::subprocess::Tool;

/// A bead as reported by `show --json` / `ready --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default)]
    pub dependents: Vec<BeadRef>,
}

impl Bead {
    pub fn is_epic(&self) -> bool {
        self.issue_type == "epic"
    }

    pub fn is_closed(&self) -> bool {
        self.status == "closed"
    }
}

/// A bare bead reference (`dep list` rows, `dependents` entries).
#[derive(Debug, Clone, Deserialize)]
pub struct BeadRef {
    pub id: String,
}

/// Parse `show --json` output.
pub fn parse_show(json: &str) -> anyhow::Result<Bead> {
    serde_json::from_str(json)
        .map_err(|e| ExitError::IssueIo(format!("parsing show output: {e}")).into())
}

/// Parse `dep list --json` output into blocker IDs.
pub fn parse_dep_list(json: &str) -> anyhow::Result<Vec<String>> {
    let refs: Vec<BeadRef> = serde_json::from_str(json)
        .map_err(|e| ExitError::IssueIo(format!("parsing dep list output: {e}")))?;
    Ok(refs.into_iter().map(|r| r.id).collect())
}

/// Parse `ready --json` output.
pub fn parse_ready(json: &str) -> anyhow::Result<Vec<Bead>> {
    serde_json::from_str(json)
        .map_err(|e| ExitError::IssueIo(format!("parsing ready output: {e}")).into())
}

/// Adapter over the issue-tracker CLI, bound to one project directory.
#[derive(Debug, Clone)]
pub struct IssueGateway {
    bin: String,
    project_dir: PathBuf,
}

impl IssueGateway {
    pub fn new(bin: &str, project_dir: &Path) -> Self {
        Self {
            bin: bin.to_string(),
            project_dir: project_dir.to_path_buf(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// `show <id> --json`
    pub fn show(&self, id: &str) -> anyhow::Result<Bead> {
        let output = self.tool().args(&["show", id, "--json"]).run_ok()?;
        parse_show(&output.stdout)
    }

    /// `dep list <id> --json --direction blocked-by` — IDs blocking `id`.
    pub fn blockers(&self, id: &str) -> anyhow::Result<Vec<String>> {
        let output = self
            .tool()
            .args(&["dep", "list", id, "--json", "--direction", "blocked-by"])
            .run_ok()?;
        parse_dep_list(&output.stdout)
    }

    /// `ready --json` — beads with no open blockers, in tracker order.
    pub fn ready(&self) -> anyhow::Result<Vec<Bead>> {
        let output = self.tool().args(&["ready", "--json"]).run_ok()?;
        parse_ready(&output.stdout)
    }

    /// `update <id> --status <status>`
    pub fn set_status(&self, id: &str, status: &str) -> anyhow::Result<()> {
        self.tool()
            .args(&["update", id, "--status", status])
            .run_ok()?;
        Ok(())
    }

    /// `close <id>`
    pub fn close(&self, id: &str) -> anyhow::Result<()> {
        self.tool().args(&["close", id]).run_ok()?;
        Ok(())
    }

    fn tool(&self) -> Tool {
        Tool::new(&self.bin).current_dir(&self.project_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_JSON: &str = r#"{
        "id": "ep-auth",
        "title": "Auth overhaul",
        "description": "Replace session cookies with tokens",
        "status": "open",
        "priority": 1,
        "issue_type": "epic",
        "dependents": [{"id": "bd-101"}, {"id": "bd-102"}]
    }"#;

    #[test]
    fn parse_show_epic() {
        let bead = parse_show(SHOW_JSON).unwrap();
        assert_eq!(bead.id, "ep-auth");
        assert!(bead.is_epic());
        assert!(!bead.is_closed());
        assert_eq!(bead.dependents.len(), 2);
        assert_eq!(bead.dependents[0].id, "bd-101");
    }

    #[test]
    fn parse_show_tolerates_missing_fields() {
        let bead = parse_show(r#"{"id": "bd-7"}"#).unwrap();
        assert_eq!(bead.id, "bd-7");
        assert!(bead.title.is_empty());
        assert!(bead.dependents.is_empty());
        assert!(!bead.is_epic());
    }

    #[test]
    fn parse_show_rejects_garbage() {
        assert!(parse_show("not json").is_err());
    }

    #[test]
    fn parse_dep_list_ids() {
        let blockers = parse_dep_list(r#"[{"id": "bd-1"}, {"id": "ep-auth"}]"#).unwrap();
        assert_eq!(blockers, vec!["bd-1", "ep-auth"]);
    }

    #[test]
    fn parse_ready_order_is_preserved() {
        let json = r#"[
            {"id": "bd-2", "title": "two", "priority": 2},
            {"id": "bd-1", "title": "one", "priority": 1},
            {"id": "bd-3", "title": "three", "priority": 2}
        ]"#;
        let beads = parse_ready(json).unwrap();
        let ids: Vec<_> = beads.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-2", "bd-1", "bd-3"]);
    }
}
