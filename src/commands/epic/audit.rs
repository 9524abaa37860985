//! Epic readiness audit.
//!
//! Pure evaluation over tracker data: same issue-store state in, same report
//! out, including ordering. The runner refuses to start on a non-ready
//! report unless --skip-audit is passed.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::beads::{Bead, IssueGateway};
use crate::error::ExitError;

/// Audit outcome for one epic.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub ready: bool,
    /// Dependent beads in processing order: ascending priority, tracker
    /// order preserved among equals.
    pub beads: Vec<String>,
    pub bead_titles: BTreeMap<String, String>,
    pub issues: Vec<String>,
    /// (bead, blocker) pairs where the blocker lies outside the epic.
    pub external_blockers: Vec<(String, String)>,
}

impl AuditReport {
    /// Convert a failed audit into the fatal pre-start error it implies.
    pub fn into_error(self, epic_id: &str) -> ExitError {
        if let Some((bead, blocker)) = self.external_blockers.into_iter().next() {
            return ExitError::ExternalBlocker { bead, blocker };
        }
        for issue in &self.issues {
            if let Some(id) = issue.strip_prefix("unready:") {
                return ExitError::BeadUnready(id.to_string());
            }
        }
        ExitError::EmptyEpic(epic_id.to_string())
    }
}

/// Fetch tracker state and evaluate readiness for `epic_id`.
pub fn run(gateway: &IssueGateway, epic_id: &str) -> anyhow::Result<AuditReport> {
    let epic = gateway.show(epic_id)?;
    if !epic.is_epic() {
        return Err(ExitError::NotAnEpic(epic_id.to_string()).into());
    }

    let mut details = Vec::new();
    let mut blockers = BTreeMap::new();
    for dep in &epic.dependents {
        let bead = gateway.show(&dep.id)?;
        blockers.insert(dep.id.clone(), gateway.blockers(&dep.id)?);
        details.push(bead);
    }

    Ok(evaluate(&epic, &details, &blockers))
}

/// The pure core: no tracker access, fully deterministic.
pub fn evaluate(
    epic: &Bead,
    details: &[Bead],
    blockers: &BTreeMap<String, Vec<String>>,
) -> AuditReport {
    let mut issues = Vec::new();
    let mut external_blockers = Vec::new();

    if details.is_empty() {
        issues.push(format!("empty: epic {} has no dependent beads", epic.id));
    }

    let member_ids: Vec<&str> = details.iter().map(|b| b.id.as_str()).collect();

    for bead in details {
        if bead.description.trim().is_empty() {
            issues.push(format!("unready:{}", bead.id));
        }
        if let Some(bead_blockers) = blockers.get(&bead.id) {
            for blocker in bead_blockers {
                let inside = blocker == &epic.id || member_ids.contains(&blocker.as_str());
                if !inside {
                    external_blockers.push((bead.id.clone(), blocker.clone()));
                }
            }
        }
    }

    // Stable sort: priority ascending, tracker order preserved among equals.
    let mut ordered: Vec<&Bead> = details.iter().collect();
    ordered.sort_by_key(|b| b.priority);

    let beads: Vec<String> = ordered.iter().map(|b| b.id.clone()).collect();
    let bead_titles: BTreeMap<String, String> = ordered
        .iter()
        .map(|b| (b.id.clone(), b.title.clone()))
        .collect();

    AuditReport {
        ready: issues.is_empty() && external_blockers.is_empty(),
        beads,
        bead_titles,
        issues,
        external_blockers,
    }
}

/// Human-readable report for `herd audit`.
pub fn render(epic_id: &str, report: &AuditReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "epic {epic_id}: {}\n",
        if report.ready { "ready" } else { "not ready" }
    ));
    out.push_str(&format!("beads ({}):\n", report.beads.len()));
    for bead in &report.beads {
        let title = report.bead_titles.get(bead).map_or("", String::as_str);
        out.push_str(&format!("  {bead}  {title}\n"));
    }
    for issue in &report.issues {
        if let Some(id) = issue.strip_prefix("unready:") {
            out.push_str(&format!("issue: bead {id} has no description\n"));
        } else {
            out.push_str(&format!("issue: {issue}\n"));
        }
    }
    for (bead, blocker) in &report.external_blockers {
        out.push_str(&format!(
            "issue: {bead} is blocked by {blocker} (outside the epic)\n"
        ));
    }
    out
}
