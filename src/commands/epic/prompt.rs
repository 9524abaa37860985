//! Batch-aware bead prompts.
//!
//! Rebuilt from scratch for every bead; the builder holds no state. A fresh
//! agent instance sees the epic context and the commits its predecessors
//! left behind, which is all the continuity the batch gets.

use minijinja::Environment;
use serde::Serialize;

use crate::state::EpicState;

const BEAD_PROMPT_TEMPLATE: &str = include_str!("../../templates/bead-prompt.md.jinja");

/// Template context for one bead.
#[derive(Debug, Serialize)]
struct PromptContext<'a> {
    bead_id: &'a str,
    title: &'a str,
    description: &'a str,
    index: usize,
    total: usize,
    epic_id: &'a str,
    epic_title: &'a str,
    session: &'a str,
    project: String,
    worktree: String,
    previous: Vec<PreviousWork<'a>>,
}

#[derive(Debug, Serialize)]
struct PreviousWork<'a> {
    bead_id: &'a str,
    title: &'a str,
    commit_hash: &'a str,
}

/// Render the prompt for the bead at `position` (0-based) in the batch.
pub fn build(
    state: &EpicState,
    bead_id: &str,
    title: &str,
    description: &str,
    position: usize,
) -> anyhow::Result<String> {
    let previous: Vec<PreviousWork> = state
        .bead_commits
        .iter()
        .map(|c| PreviousWork {
            bead_id: &c.bead_id,
            title: &c.title,
            commit_hash: &c.commit_hash,
        })
        .collect();

    let ctx = PromptContext {
        bead_id,
        title,
        description,
        index: position + 1,
        total: state.beads.len(),
        epic_id: &state.epic_id,
        epic_title: &state.epic_title,
        session: &state.session_name,
        project: state.project_dir.display().to_string(),
        worktree: state.worktree.display().to_string(),
        previous,
    };

    let mut env = Environment::new();
    env.add_template("bead-prompt", BEAD_PROMPT_TEMPLATE)?;
    let rendered = env.get_template("bead-prompt")?.render(&ctx)?;
    Ok(rendered)
}

/// Substitute a user-supplied prompt template.
///
/// Placeholders are literal markers, not a template language: {BEAD_ID},
/// {TITLE}, {DESCRIPTION}, {SESSION}, {PROJECT}, {WORKTREE}.
pub fn substitute(
    template: &str,
    state: &EpicState,
    bead_id: &str,
    title: &str,
    description: &str,
) -> String {
    template
        .replace("{BEAD_ID}", bead_id)
        .replace("{TITLE}", title)
        .replace("{DESCRIPTION}", description)
        .replace("{SESSION}", &state.session_name)
        .replace("{PROJECT}", &state.project_dir.display().to_string())
        .replace("{WORKTREE}", &state.worktree.display().to_string())
}

/// Pick the configured override when present, else the built-in template.
pub fn for_bead(
    prompt_template: Option<&str>,
    state: &EpicState,
    bead_id: &str,
    title: &str,
    description: &str,
    position: usize,
) -> anyhow::Result<String> {
    match prompt_template {
        Some(template) => Ok(substitute(template, state, bead_id, title, description)),
        None => build(state, bead_id, title, description, position),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EpicStatus;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn state_with_commits() -> EpicState {
        let mut state = EpicState {
            epic_id: "ep-auth".into(),
            epic_title: "Auth overhaul".into(),
            worktree: PathBuf::from("/repos/demo/.wt/ep-auth"),
            session_name: "auto-ep-auth".into(),
            beads: vec!["bd-1".into(), "bd-2".into(), "bd-3".into()],
            bead_titles: BTreeMap::from([
                ("bd-1".into(), "login form".into()),
                ("bd-2".into(), "token refresh".into()),
                ("bd-3".into(), "logout".into()),
            ]),
            completed_beads: vec![],
            bead_commits: vec![],
            failed_beads: BTreeMap::new(),
            current_bead: String::new(),
            status: EpicStatus::Running,
            start_time: chrono::Utc::now(),
            project_dir: PathBuf::from("/repos/demo"),
            merge_mode: String::new(),
        };
        state.record_completion("bd-1");
        state.record_commit("bd-1", "abc123", "feat: login form");
        state.record_completion("bd-2");
        state.record_commit("bd-2", "def456", "feat: token refresh");
        state
    }

    #[test]
    fn prompt_sections_in_order() {
        let state = state_with_commits();
        let prompt = build(&state, "bd-3", "logout", "Clear the session cookie.", 2).unwrap();

        assert!(prompt.contains("bead 3/3 in epic ep-auth"));
        let header = prompt.find("bead 3/3").unwrap();
        let context = prompt.find("## Epic context").unwrap();
        let previous = prompt.find("## Previous work").unwrap();
        let task = prompt.find("## Your task").unwrap();
        let workflow = prompt.find("## Workflow").unwrap();
        let prohibitions = prompt.find("## Do not").unwrap();
        let footer = prompt.find("## Commit message footer").unwrap();
        assert!(header < context);
        assert!(context < previous);
        assert!(previous < task);
        assert!(task < workflow);
        assert!(workflow < prohibitions);
        assert!(prohibitions < footer);
    }

    #[test]
    fn prompt_lists_every_prior_commit() {
        let state = state_with_commits();
        let prompt = build(&state, "bd-3", "logout", "Clear the session cookie.", 2).unwrap();

        for commit in &state.bead_commits {
            assert!(prompt.contains(&commit.bead_id));
            assert!(prompt.contains(&commit.commit_hash));
        }
    }

    #[test]
    fn prompt_carries_signal_command_and_session() {
        let state = state_with_commits();
        let prompt = build(&state, "bd-3", "logout", "Clear the session cookie.", 2).unwrap();
        assert!(prompt.contains("herd signal bead-done"));
        assert!(prompt.contains("Session: auto-ep-auth"));
        assert!(prompt.contains("Do not open pull requests"));
    }

    #[test]
    fn first_bead_has_no_previous_section() {
        let mut state = state_with_commits();
        state.completed_beads.clear();
        state.bead_commits.clear();
        let prompt = build(&state, "bd-1", "login form", "Build it.", 0).unwrap();
        assert!(!prompt.contains("## Previous work"));
        assert!(prompt.contains("bead 1/3"));
    }

    #[test]
    fn substitute_replaces_all_placeholders() {
        let state = state_with_commits();
        let template = "{BEAD_ID}|{TITLE}|{DESCRIPTION}|{SESSION}|{PROJECT}|{WORKTREE}";
        let out = substitute(template, &state, "bd-3", "logout", "desc");
        assert_eq!(
            out,
            "bd-3|logout|desc|auto-ep-auth|/repos/demo|/repos/demo/.wt/ep-auth"
        );
    }

    #[test]
    fn for_bead_prefers_override() {
        let state = state_with_commits();
        let out = for_bead(Some("work on {BEAD_ID}"), &state, "bd-3", "t", "d", 2).unwrap();
        assert_eq!(out, "work on bd-3");
    }
}
