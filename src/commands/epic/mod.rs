pub mod audit;
pub mod journal;
pub mod prompt;
pub mod reconcile;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;

use crate::beads::IssueGateway;
use crate::config::Config;
use crate::error::ExitError;
use crate::lockfile;
use crate::names;
use crate::oob::{subject, OobChannel, ORCHESTRATOR};
use crate::state::{EpicState, EpicStatus, StateStore};
use crate::tmux::SessionHost;
use crate::worktree::{self, WorktreeProvisioner};

use journal::Journal;

/// Options for `herd run`.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub project: Option<String>,
    pub force: bool,
    pub skip_audit: bool,
    pub pause_on_failure: bool,
    pub merge: Option<String>,
}

/// Outcome of driving one bead to its end.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BeadOutcome {
    /// Worker signaled completion; optional one-line summary from the signal.
    Success(Option<String>),
    Timeout,
    Stopped,
    FailedExited,
    FailedInject,
}

impl BeadOutcome {
    fn tag(&self) -> &'static str {
        match self {
            BeadOutcome::Success(_) => "success",
            BeadOutcome::Timeout => "timeout",
            BeadOutcome::Stopped => "stopped",
            BeadOutcome::FailedExited => "failed-exited",
            BeadOutcome::FailedInject => "failed-inject",
        }
    }
}

/// Everything a run needs, resolved once.
pub struct Orchestrator {
    project: String,
    project_dir: PathBuf,
    config: Config,
    store: StateStore,
    gateway: IssueGateway,
    host: SessionHost,
    provisioner: WorktreeProvisioner,
    oob: OobChannel,
    journal: Journal,
    stop_flag: Arc<AtomicBool>,
}

impl Orchestrator {
    fn new(project: String, project_dir: PathBuf) -> anyhow::Result<Self> {
        let config = Config::for_project(&project_dir)?;
        let store = StateStore::open();
        let gateway = IssueGateway::new(&config.tools.beads, &project_dir);
        let host = SessionHost::new(&config.tools.tmux);
        let provisioner =
            WorktreeProvisioner::new(&config.tools.worktree, &config.tools.git, &project_dir);
        let oob = OobChannel::connect(&config.oob);
        let journal = Journal::new(&project);
        let stop_flag = lockfile::install_signal_stop(&store, &project);

        Ok(Self {
            project,
            project_dir,
            config,
            store,
            gateway,
            host,
            provisioner,
            oob,
            journal,
            stop_flag,
        })
    }

    fn should_stop(&self) -> bool {
        lockfile::should_stop(&self.store, &self.project, &self.stop_flag)
    }
}

/// Start a new epic run.
pub fn run(epic_id: &str, opts: &RunOptions) -> anyhow::Result<()> {
    let (project, project_dir) = resolve_for_epic(opts.project.as_deref(), epic_id)?;
    let orch = Orchestrator::new(project, project_dir)?;

    let epic = orch.gateway.show(epic_id)?;
    if !epic.is_epic() {
        return Err(ExitError::NotAnEpic(epic_id.to_string()).into());
    }

    // Audit: fatal pre-start unless --skip-audit. Runs before the lock so a
    // hopeless epic never contends with anything.
    let report = audit::run(&orch.gateway, epic_id)?;
    if !report.ready {
        eprint!("{}", audit::render(epic_id, &report));
        if !opts.skip_audit {
            return Err(report.into_error(epic_id).into());
        }
        eprintln!("--skip-audit set; continuing anyway");
    }
    if report.beads.is_empty() {
        return Err(ExitError::EmptyEpic(epic_id.to_string()).into());
    }

    lockfile::acquire(&orch.store, &orch.project, epic_id, opts.force)?;

    // Provision the worktree/session pair. Failures here are fatal and leave
    // no state file behind.
    let (worktree_path, session_name) = match provision(&orch, epic_id) {
        Ok(pair) => pair,
        Err(e) => {
            lockfile::release(&orch.store, &orch.project);
            return Err(e);
        }
    };

    eprintln!("Epic:     {epic_id} — {}", epic.title);
    eprintln!("Project:  {}", orch.project);
    eprintln!("Worktree: {}", worktree_path.display());
    eprintln!("Session:  {session_name}");
    eprintln!("Beads:    {}", report.beads.len());

    let mut state = EpicState {
        epic_id: epic_id.to_string(),
        epic_title: epic.title.clone(),
        worktree: worktree_path,
        session_name,
        beads: report.beads.clone(),
        bead_titles: report.bead_titles.clone(),
        completed_beads: Vec::new(),
        bead_commits: Vec::new(),
        failed_beads: BTreeMap::new(),
        current_bead: String::new(),
        status: EpicStatus::Running,
        start_time: Utc::now(),
        project_dir: orch.project_dir.clone(),
        merge_mode: opts.merge.clone().unwrap_or_default(),
    };
    orch.store.save(&orch.project, &state)?;

    orch.journal.truncate();
    orch.oob.register_agent(ORCHESTRATOR, "herd", "");
    orch.oob.reserve_paths(
        ORCHESTRATOR,
        &[format!("{}/**", state.worktree.display())],
        orch.config.agent.timeout_minutes * 60 * state.beads.len() as u64,
        true,
    );

    run_loop(&orch, &mut state, opts.pause_on_failure)
        .inspect_err(|_| lockfile::release(&orch.store, &orch.project))
}

/// Continue an interrupted run from its state file.
pub fn resume(project: Option<&str>) -> anyhow::Result<()> {
    let (project, project_dir) = resolve_existing(project)?;
    let orch = Orchestrator::new(project, project_dir)?;

    let mut state = orch
        .store
        .load(&orch.project)?
        .ok_or_else(|| ExitError::NoState(orch.project.clone()))?;

    lockfile::acquire(&orch.store, &orch.project, &state.epic_id, false)?;

    // Crash recovery: fold missed DONE messages in before deciding what is
    // left to do.
    let recovered = reconcile::run(&mut state, &orch.oob);
    for bead in &recovered.beads {
        eprintln!("reconciled completion for {bead} from the message channel");
        orch.journal.append(&format!("{bead}: reconciled from inbox"));
    }

    // A resume retries failures.
    state.failed_beads.clear();
    state.current_bead.clear();
    state.status = EpicStatus::Running;
    orch.store.save(&orch.project, &state)?;

    if !state.pending_beads().is_empty() && !orch.host.has_session(&state.session_name) {
        lockfile::release(&orch.store, &orch.project);
        return Err(ExitError::AgentIo(format!(
            "session {} is gone; run `herd abort --project {}` and start over",
            state.session_name, orch.project
        ))
        .into());
    }

    eprintln!(
        "Resuming epic {} at bead {}/{}",
        state.epic_id,
        state.completed_beads.len() + 1,
        state.beads.len()
    );

    run_loop(&orch, &mut state, false)
        .inspect_err(|_| lockfile::release(&orch.store, &orch.project))
}

/// Tear down a run: session, worktree, marker, state, lock.
pub fn abort(project: Option<&str>, yes: bool) -> anyhow::Result<()> {
    let (project, project_dir) = resolve_existing(project)?;
    let orch = Orchestrator::new(project, project_dir)?;

    let state = orch
        .store
        .load(&orch.project)?
        .ok_or_else(|| ExitError::NoState(orch.project.clone()))?;

    eprintln!(
        "Epic {}: {} of {} beads completed, status {}",
        state.epic_id,
        state.completed_beads.len(),
        state.beads.len(),
        state.status
    );

    if !yes && !confirm_abort(&state)? {
        eprintln!("abort cancelled");
        return Ok(());
    }

    orch.host.kill(&state.session_name)?;
    orch.provisioner.remove_marker(&state.worktree);
    if state.worktree.exists() {
        if let Err(e) = orch.provisioner.remove(&state.worktree) {
            tracing::warn!("worktree removal failed: {e:#}");
            eprintln!("warning: could not remove {}: {e:#}", state.worktree.display());
        }
    }
    orch.store.remove(&orch.project);
    lockfile::release(&orch.store, &orch.project);
    lockfile::clear_stop(&orch.store, &orch.project);
    orch.oob.release(ORCHESTRATOR);

    eprintln!(
        "aborted epic {} ({} beads had completed)",
        state.epic_id,
        state.completed_beads.len()
    );
    Ok(())
}

/// Cooperative stop: drop the stop file for the runner to observe.
pub fn stop(project: Option<&str>) -> anyhow::Result<()> {
    let (project, _dir) = resolve_existing(project)?;
    let store = StateStore::open();

    lockfile::request_stop(&store, &project)?;
    if lockfile::holder_alive(&store, &project) {
        eprintln!("stop requested; the runner will pause after the current bead");
    } else {
        eprintln!("stop requested (no live runner found for {project})");
    }
    Ok(())
}

// --- the per-bead loop ---

fn run_loop(
    orch: &Orchestrator,
    state: &mut EpicState,
    pause_on_failure: bool,
) -> anyhow::Result<()> {
    let beads = state.beads.clone();
    let total = beads.len();

    for (position, bead_id) in beads.iter().enumerate() {
        if state.completed_beads.contains(bead_id) {
            continue;
        }
        if state.failed_beads.contains_key(bead_id) {
            continue;
        }

        if orch.should_stop() {
            lockfile::clear_stop(&orch.store, &orch.project);
            state.current_bead = bead_id.clone();
            state.status = EpicStatus::Paused;
            orch.store.save(&orch.project, state)?;
            lockfile::release(&orch.store, &orch.project);
            eprintln!(
                "paused before {bead_id}; resume with `herd resume --project {}`",
                orch.project
            );
            return Ok(());
        }

        eprintln!("\n--- bead {}/{total}: {bead_id} ---", position + 1);

        process_bead(orch, state, bead_id, position, pause_on_failure)?;
    }

    finalize(orch, state)
}

fn process_bead(
    orch: &Orchestrator,
    state: &mut EpicState,
    bead_id: &str,
    position: usize,
    pause_on_failure: bool,
) -> anyhow::Result<()> {
    // Re-read: someone may have closed the bead underneath us.
    let bead = match orch.gateway.show(bead_id) {
        Ok(bead) => bead,
        Err(e) => {
            tracing::warn!("could not read {bead_id}: {e:#}");
            eprintln!("warning: could not read {bead_id}; recording as failed");
            state.record_failure(bead_id, "failed-show");
            orch.store.save(&orch.project, state)?;
            return Ok(());
        }
    };

    if bead.is_closed() {
        eprintln!("{bead_id} is already closed; skipping");
        state.record_completion(bead_id);
        orch.store.save(&orch.project, state)?;
        return Ok(());
    }

    state.current_bead = bead_id.to_string();
    orch.store.save(&orch.project, state)?;

    if let Err(e) = orch.gateway.set_status(bead_id, "in_progress") {
        tracing::warn!("could not mark {bead_id} in progress: {e:#}");
    }

    let prompt_text = prompt::for_bead(
        orch.config.agent.prompt_template.as_deref(),
        state,
        bead_id,
        &bead.title,
        &bead.description,
        position,
    )?;

    worktree::clear_done_signal(&state.worktree);
    orch.oob.send_message(
        ORCHESTRATOR,
        &[&state.session_name],
        &subject::task(bead_id),
        &bead.title,
        false,
    );

    let outcome = match launch_agent(orch, state, &prompt_text) {
        Ok(()) => wait_for_outcome(orch, state, bead_id),
        Err(e) => {
            tracing::warn!("prompt injection failed: {e:#}");
            eprintln!("warning: prompt injection failed: {e:#}");
            BeadOutcome::FailedInject
        }
    };

    handle_outcome(orch, state, bead_id, outcome, pause_on_failure)
}

/// Start a fresh agent in the session shell, then paste the prompt into it.
fn launch_agent(orch: &Orchestrator, state: &EpicState, prompt_text: &str) -> anyhow::Result<()> {
    let session = &state.session_name;

    orch.host.inject(session, &orch.config.agent.command)?;

    // Give the agent a moment to come up before pasting. The pane leaving
    // idle is the signal that the command actually started.
    let started = {
        let budget = Duration::from_secs(orch.config.agent.prompt_wait_secs);
        let start = Instant::now();
        loop {
            if !orch.host.is_idle(session).unwrap_or(true) {
                break true;
            }
            if start.elapsed() >= budget {
                break false;
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    };
    if !started {
        return Err(ExitError::AgentIo("agent did not start in the session".to_string()).into());
    }
    std::thread::sleep(Duration::from_secs(2));

    orch.host.inject(session, prompt_text)
}

/// Poll until the bead reaches an outcome.
///
/// Three completion channels, checked in order of trust: the done drop file
/// written by `herd signal bead-done`, an unacknowledged DONE message on the
/// side channel, and the pane going idle (agent exited without signaling).
fn wait_for_outcome(orch: &Orchestrator, state: &EpicState, bead_id: &str) -> BeadOutcome {
    let deadline = Instant::now() + Duration::from_secs(orch.config.agent.timeout_minutes * 60);
    let poll = Duration::from_secs(orch.config.agent.poll_secs.max(1));
    let mut stop_seen = false;

    loop {
        std::thread::sleep(poll);

        if let Some(signal) = worktree::read_done_signal(&state.worktree) {
            worktree::clear_done_signal(&state.worktree);
            if signal.bead_id == bead_id {
                return BeadOutcome::Success(Some(signal.summary));
            }
            tracing::warn!(
                "stale done signal for {} while running {bead_id}",
                signal.bead_id
            );
        }

        if orch.oob.is_enabled() {
            for message in orch.oob.fetch_inbox(ORCHESTRATOR, 20) {
                if message.acked {
                    continue;
                }
                if subject::parse_done(&message.subject) == Some(bead_id) {
                    orch.oob.acknowledge(ORCHESTRATOR, &message.id);
                    return BeadOutcome::Success(None);
                }
            }
        }

        if orch.should_stop() {
            stop_seen = true;
        }

        if orch.host.is_idle(&state.session_name).unwrap_or(false) {
            // One more look: the agent may have dropped the signal right
            // before exiting.
            if let Some(signal) = worktree::read_done_signal(&state.worktree) {
                worktree::clear_done_signal(&state.worktree);
                if signal.bead_id == bead_id {
                    return BeadOutcome::Success(Some(signal.summary));
                }
            }
            return if stop_seen {
                BeadOutcome::Stopped
            } else {
                BeadOutcome::FailedExited
            };
        }

        if Instant::now() >= deadline {
            return BeadOutcome::Timeout;
        }
    }
}

fn handle_outcome(
    orch: &Orchestrator,
    state: &mut EpicState,
    bead_id: &str,
    outcome: BeadOutcome,
    pause_on_failure: bool,
) -> anyhow::Result<()> {
    match outcome {
        BeadOutcome::Success(summary) => {
            record_success(orch, state, bead_id, summary.as_deref())?;
            if !state.pending_beads().is_empty() {
                recycle(orch, state);
            }
            Ok(())
        }
        outcome => {
            let tag = outcome.tag();
            eprintln!("{bead_id}: {tag}");
            orch.journal.append(&format!("{bead_id}: {tag}"));

            // A timed-out agent may still hold the pane; reclaim it the same
            // way a successful bead does before anything else is injected.
            recycle(orch, state);

            if pause_on_failure {
                state.record_failure(bead_id, tag);
                state.status = EpicStatus::Failed;
                orch.store.save(&orch.project, state)?;
                let err = ExitError::BeadFailed {
                    bead: bead_id.to_string(),
                    outcome: tag.to_string(),
                };
                if let Some(hint) = err.remediation(&orch.project) {
                    eprintln!("{hint}");
                }
                return Err(err.into());
            }

            state.record_failure(bead_id, tag);
            state.current_bead.clear();
            orch.store.save(&orch.project, state)?;
            Ok(())
        }
    }
}

fn record_success(
    orch: &Orchestrator,
    state: &mut EpicState,
    bead_id: &str,
    summary: Option<&str>,
) -> anyhow::Result<()> {
    state.record_completion(bead_id);
    state.current_bead.clear();

    // The worker commits before signaling, so HEAD right now is this bead's
    // commit. Capture failures are warnings; the bead still counts.
    match orch.provisioner.latest_commit(&state.worktree) {
        Ok((hash, commit_subject)) => {
            eprintln!("{bead_id}: success ({hash} {commit_subject})");
            state.record_commit(bead_id, &hash, &commit_subject);
        }
        Err(e) => {
            tracing::warn!("commit capture failed for {bead_id}: {e:#}");
            eprintln!("warning: could not capture commit for {bead_id}");
        }
    }

    orch.store.save(&orch.project, state)?;

    if let Err(e) = orch.gateway.close(bead_id) {
        tracing::warn!("could not close {bead_id}: {e:#}");
    }

    orch.journal.append(&format!(
        "{bead_id}: success{}",
        summary.map(|s| format!(" — {s}")).unwrap_or_default()
    ));
    orch.oob.send_message(
        ORCHESTRATOR,
        &[ORCHESTRATOR],
        &subject::progress(bead_id),
        summary.unwrap_or(""),
        false,
    );

    Ok(())
}

/// Kill the agent between beads, keeping the shell and worktree, then wait
/// for the shell prompt. A fresh agent per bead keeps each context window
/// clean of the previous bead's reasoning.
fn recycle(orch: &Orchestrator, state: &EpicState) {
    match orch.host.kill_agent(&state.session_name) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("agent still busy after kill-agent; continuing");
            eprintln!("warning: agent did not yield the pane cleanly");
        }
        Err(e) => {
            tracing::warn!("kill-agent failed: {e:#}");
        }
    }
    let budget = Duration::from_secs(orch.config.agent.prompt_wait_secs);
    if !orch.host.wait_idle(&state.session_name, budget) {
        eprintln!("warning: shell prompt did not reappear within {}s", budget.as_secs());
    }
}

fn finalize(orch: &Orchestrator, state: &mut EpicState) -> anyhow::Result<()> {
    state.current_bead.clear();

    if state.all_done() {
        // Close exactly once, and only with every bead completed.
        orch.gateway
            .close(&state.epic_id)
            .map_err(|e| ExitError::IssueIo(format!("closing epic {}: {e:#}", state.epic_id)))?;

        orch.provisioner.remove_marker(&state.worktree);
        worktree::clear_done_signal(&state.worktree);
        state.status = EpicStatus::Completed;
        orch.store.remove(&orch.project);
        lockfile::release(&orch.store, &orch.project);

        orch.oob.send_message(
            ORCHESTRATOR,
            &[ORCHESTRATOR],
            &subject::epic_done(&state.epic_id),
            &format!("{} beads completed", state.completed_beads.len()),
            false,
        );
        orch.oob.release(ORCHESTRATOR);
        orch.journal.append(&format!(
            "epic {} completed ({} beads)",
            state.epic_id,
            state.completed_beads.len()
        ));

        eprintln!(
            "\nepic {} completed: {} beads, {} commits",
            state.epic_id,
            state.completed_beads.len(),
            state.bead_commits.len()
        );
        for commit in &state.bead_commits {
            eprintln!("  {}  {}  {}", commit.commit_hash, commit.bead_id, commit.summary);
        }
        return Ok(());
    }

    state.status = EpicStatus::Partial;
    orch.store.save(&orch.project, state)?;
    lockfile::release(&orch.store, &orch.project);

    eprintln!(
        "\nepic {} finished partial: {} completed, {} failed",
        state.epic_id,
        state.completed_beads.len(),
        state.failed_beads.len()
    );
    for (bead, tag) in &state.failed_beads {
        eprintln!("  failed {bead}: {tag}");
    }
    eprintln!(
        "retry failures with `herd resume --project {}` or tear down with `herd abort --project {}`",
        orch.project, orch.project
    );
    Ok(())
}

// --- provisioning and project resolution ---

fn provision(orch: &Orchestrator, epic_id: &str) -> anyhow::Result<(PathBuf, String)> {
    let mut session_name = derive_session_name(epic_id);
    if orch.host.has_session(&session_name) {
        let in_use = orch.host.list_sessions();
        session_name = format!("auto-{}", names::allocate(&in_use));
        tracing::warn!("derived session name was taken; using {session_name}");
    }

    let (worktree_path, actual_session) = orch.provisioner.create(epic_id, &session_name)?;
    orch.provisioner
        .write_marker(&worktree_path, epic_id)
        .context("writing batch-mode marker")?;
    Ok((worktree_path, actual_session))
}

/// `auto-` plus the first 8 id-chars of the lowercased epic ID.
pub fn derive_session_name(epic_id: &str) -> String {
    let id: String = epic_id
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(8)
        .collect();
    format!("auto-{id}")
}

/// Resolve the project that owns `epic_id`.
pub fn resolve_for_epic(
    project_flag: Option<&str>,
    epic_id: &str,
) -> anyhow::Result<(String, PathBuf)> {
    let global = Config::load_global()?.unwrap_or_default();

    if let Some(name) = project_flag {
        let entry = global.find_project(name).ok_or_else(|| {
            ExitError::Config(format!("project {name} is not registered"))
        })?;
        return Ok((entry.name, entry.dir));
    }

    for entry in global.registry() {
        let config = Config::for_project(&entry.dir)?;
        let gateway = IssueGateway::new(&config.tools.beads, &entry.dir);
        match gateway.show(epic_id) {
            Ok(bead) if bead.is_epic() => return Ok((entry.name, entry.dir)),
            _ => continue,
        }
    }
    Err(ExitError::EpicNotFound(epic_id.to_string()).into())
}

/// Resolve a project for state-file operations (resume/abort/stop/check).
pub fn resolve_existing(project_flag: Option<&str>) -> anyhow::Result<(String, PathBuf)> {
    let global = Config::load_global()?.unwrap_or_default();

    if let Some(name) = project_flag {
        if let Some(entry) = global.find_project(name) {
            return Ok((entry.name, entry.dir));
        }
        return Err(ExitError::Config(format!("project {name} is not registered")).into());
    }

    let cwd = std::env::current_dir().context("determining current directory")?;
    let config = Config::for_project(&cwd)?;
    Ok((config.project_name(&cwd), cwd))
}

fn confirm_abort(state: &EpicState) -> anyhow::Result<bool> {
    use std::io::IsTerminal;
    if !std::io::stdin().is_terminal() {
        // Non-interactive without --yes: refuse rather than guess.
        anyhow::bail!("refusing to abort without --yes in a non-interactive session");
    }
    let prompt_text = format!(
        "Abort epic {} and delete worktree {}?",
        state.epic_id,
        state.worktree.display()
    );
    dialoguer::Confirm::new()
        .with_prompt(prompt_text)
        .default(false)
        .interact()
        .context("reading abort confirmation")
}
