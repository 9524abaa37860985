//! `herd check` — read-only run introspection. Never mutates.

use std::io::IsTerminal;

use anyhow::Context;
use serde::Serialize;

use crate::commands::doctor::OutputFormat;
use crate::commands::epic::journal::Journal;
use crate::commands::epic::resolve_existing;
use crate::config::Config;
use crate::lockfile;
use crate::state::StateStore;
use crate::tmux::SessionHost;

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub project: String,
    pub lock: Option<String>,
    pub stop_requested: bool,
    pub state: Option<StateSummary>,
    pub session: String,
    pub recent: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StateSummary {
    pub epic_id: String,
    pub epic_title: String,
    pub status: String,
    pub completed: usize,
    pub total: usize,
    pub failed: Vec<(String, String)>,
    pub current_bead: Option<String>,
    pub worktree: String,
    pub merge_mode: Option<String>,
}

pub fn run(project: Option<&str>, format: Option<OutputFormat>) -> anyhow::Result<()> {
    let (project, project_dir) = resolve_existing(project)?;
    let config = Config::for_project(&project_dir)?;
    let store = StateStore::open();

    let format = format.unwrap_or_else(|| {
        if std::io::stdout().is_terminal() {
            OutputFormat::Pretty
        } else {
            OutputFormat::Text
        }
    });

    let mut report = CheckReport {
        project: project.clone(),
        lock: lockfile::read(&store, &project).map(|r| lockfile::describe(&r)),
        stop_requested: lockfile::stop_requested(&store, &project),
        state: None,
        session: "no session".to_string(),
        recent: Journal::new(&project)
            .tail(8)
            .map(|t| t.lines().map(str::to_string).collect())
            .unwrap_or_default(),
    };

    match store.load(&project) {
        Ok(Some(state)) => {
            let host = SessionHost::new(&config.tools.tmux);
            if host.has_session(&state.session_name) {
                report.session = format!("{} (alive)", state.session_name);
            }
            report.state = Some(StateSummary {
                epic_id: state.epic_id.clone(),
                epic_title: state.epic_title.clone(),
                status: state.status.to_string(),
                completed: state.completed_beads.len(),
                total: state.beads.len(),
                failed: state
                    .failed_beads
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                current_bead: (!state.current_bead.is_empty()).then(|| state.current_bead.clone()),
                worktree: state.worktree.display().to_string(),
                merge_mode: (!state.merge_mode.is_empty()).then(|| state.merge_mode.clone()),
            });
        }
        Ok(None) => {}
        Err(e) => {
            eprintln!("warning: state file unreadable: {e:#}");
        }
    }

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing check report")?
            );
        }
        OutputFormat::Pretty | OutputFormat::Text => print_report(&report),
    }

    Ok(())
}

fn print_report(report: &CheckReport) {
    println!("project: {}", report.project);
    match &report.lock {
        Some(lock) => println!("lock: {lock}"),
        None => println!("lock: none"),
    }
    if report.stop_requested {
        println!("stop: requested");
    }

    let Some(state) = &report.state else {
        println!("state: none");
        println!("session: {}", report.session);
        return;
    };

    println!("epic: {} — {}", state.epic_id, state.epic_title);
    println!("status: {}", state.status);
    println!(
        "progress: {}/{} completed, {} failed",
        state.completed,
        state.total,
        state.failed.len()
    );
    if let Some(current) = &state.current_bead {
        println!("current: {current}");
    }
    for (bead, tag) in &state.failed {
        println!("failed: {bead} ({tag})");
    }
    println!("worktree: {}", state.worktree);
    if let Some(mode) = &state.merge_mode {
        println!("merge mode: {mode}");
    }
    println!("session: {}", report.session);

    if !report.recent.is_empty() {
        println!("recent:");
        for line in &report.recent {
            println!("  {line}");
        }
    }
}
