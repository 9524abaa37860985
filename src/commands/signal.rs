//! `herd signal bead-done` — the worker's completion entry point.
//!
//! Invoked from inside the worktree after the worker has committed. Exactly
//! one of two paths runs, decided by lock liveness:
//!
//! - Runner alive: the runner owns the state machine. We stage a done drop
//!   file (and a DONE message on the side channel) for its next poll tick
//!   and touch nothing else.
//! - Runner dead: crash recovery. We take over the stale lock, record the
//!   completion ourselves, and either inject the next bead's prompt or
//!   finalize the epic.

use anyhow::Context;

use crate::beads::IssueGateway;
use crate::config::Config;
use crate::error::ExitError;
use crate::lockfile;
use crate::oob::{subject, OobChannel, ORCHESTRATOR};
use crate::state::{EpicState, EpicStatus, StateStore};
use crate::tmux::SessionHost;
use crate::worktree::{self, WorktreeProvisioner};

use super::epic::prompt;

/// Handle `herd signal bead-done <summary>`.
pub fn bead_done(summary: &str) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("determining current directory")?;
    let root = worktree::find_marked_root(&cwd).ok_or_else(|| {
        ExitError::Other("not inside an orchestrated worktree (no batch marker found)".to_string())
    })?;

    let store = StateStore::open();
    let (project, mut state) = store
        .find_by_worktree(&root)?
        .ok_or_else(|| ExitError::NoState(root.display().to_string()))?;

    let bead_id = active_bead(&state).ok_or_else(|| {
        ExitError::Other(format!(
            "epic {} has no bead awaiting completion",
            state.epic_id
        ))
    })?;

    let config = Config::for_project(&state.project_dir)?;
    let oob = OobChannel::connect(&config.oob);

    if lockfile::holder_alive(&store, &project) {
        // The runner is polling; leave the state machine to it.
        worktree::write_done_signal(&root, &bead_id, summary)?;
        oob.send_message(
            &state.session_name,
            &[ORCHESTRATOR],
            &subject::done(&bead_id),
            summary,
            true,
        );
        eprintln!("recorded bead-done for {bead_id}; the runner will advance");
        return Ok(());
    }

    // No live runner: this process owns the advancement.
    eprintln!("no live runner; advancing epic {} directly", state.epic_id);
    lockfile::acquire(&store, &project, &state.epic_id, false)?;
    let result = advance(&store, &project, &mut state, &bead_id, summary, &config, &oob);
    lockfile::release(&store, &project);
    result
}

/// The bead this signal refers to: the one marked current, else the first
/// pending one.
fn active_bead(state: &EpicState) -> Option<String> {
    if !state.current_bead.is_empty() {
        return Some(state.current_bead.clone());
    }
    state.pending_beads().into_iter().next()
}

fn advance(
    store: &StateStore,
    project: &str,
    state: &mut EpicState,
    bead_id: &str,
    summary: &str,
    config: &Config,
    oob: &OobChannel,
) -> anyhow::Result<()> {
    let gateway = IssueGateway::new(&config.tools.beads, &state.project_dir);
    let host = SessionHost::new(&config.tools.tmux);
    let provisioner =
        WorktreeProvisioner::new(&config.tools.worktree, &config.tools.git, &state.project_dir);

    state.record_completion(bead_id);
    state.current_bead.clear();

    match provisioner.latest_commit(&state.worktree) {
        Ok((hash, commit_subject)) => {
            state.record_commit(bead_id, &hash, &commit_subject);
        }
        Err(e) => {
            tracing::warn!("commit capture failed for {bead_id}: {e:#}");
        }
    }
    if let Err(e) = gateway.set_status(bead_id, "closed") {
        tracing::warn!("could not close {bead_id}: {e:#}");
    }
    store.save(project, state)?;

    let pending = state.pending_beads();
    let Some(next_id) = pending.first().cloned() else {
        return finalize(store, project, state, &gateway, oob);
    };

    // Recycle the agent and hand the next bead to a fresh instance.
    if let Err(e) = host.kill_agent(&state.session_name) {
        tracing::warn!("kill-agent: {e:#}");
    }
    host.wait_idle(
        &state.session_name,
        std::time::Duration::from_secs(config.agent.prompt_wait_secs),
    );

    let next = gateway.show(&next_id)?;
    if let Err(e) = gateway.set_status(&next_id, "in_progress") {
        tracing::warn!("could not mark {next_id} in progress: {e:#}");
    }

    let position = state
        .beads
        .iter()
        .position(|b| b == &next_id)
        .unwrap_or_default();
    let prompt_text = prompt::for_bead(
        config.agent.prompt_template.as_deref(),
        state,
        &next_id,
        &next.title,
        &next.description,
        position,
    )?;

    host.inject(&state.session_name, &config.agent.command)?;
    std::thread::sleep(std::time::Duration::from_secs(2));
    host.inject(&state.session_name, &prompt_text)?;

    state.current_bead = next_id.clone();
    store.save(project, state)?;

    oob.send_message(
        ORCHESTRATOR,
        &[&state.session_name],
        &subject::task(&next_id),
        &next.title,
        false,
    );
    eprintln!(
        "{bead_id} done ({summary}); injected {next_id} ({} of {} remain)",
        pending.len(),
        state.beads.len()
    );
    Ok(())
}

fn finalize(
    store: &StateStore,
    project: &str,
    state: &mut EpicState,
    gateway: &IssueGateway,
    oob: &OobChannel,
) -> anyhow::Result<()> {
    if !state.all_done() {
        // Failures recorded by an earlier runner remain; leave the state for
        // resume/abort instead of closing the epic over them.
        state.status = EpicStatus::Partial;
        store.save(project, state)?;
        eprintln!(
            "last bead done, but {} failed beads remain; epic left open",
            state.failed_beads.len()
        );
        return Ok(());
    }

    gateway
        .close(&state.epic_id)
        .map_err(|e| ExitError::IssueIo(format!("closing epic {}: {e:#}", state.epic_id)))?;

    remove_run_artifacts(store, project, state);
    oob.send_message(
        ORCHESTRATOR,
        &[ORCHESTRATOR],
        &subject::epic_done(&state.epic_id),
        &format!("{} beads completed", state.completed_beads.len()),
        false,
    );
    oob.release(ORCHESTRATOR);

    eprintln!(
        "epic {} completed ({} beads)",
        state.epic_id,
        state.completed_beads.len()
    );
    Ok(())
}

fn remove_run_artifacts(store: &StateStore, project: &str, state: &mut EpicState) {
    let marker = state.worktree.join(worktree::BATCH_MARKER);
    let _ = std::fs::remove_file(marker);
    worktree::clear_done_signal(&state.worktree);
    state.status = EpicStatus::Completed;
    store.remove(project);
}
