//! Crash reconciliation from the out-of-band inbox.
//!
//! A worker may commit, signal DONE over the channel, and then lose the
//! runner before the completion is persisted. On resume we replay every
//! unacknowledged DONE for a bead of this epic that the state has not seen.
//! Replaying the same inbox twice is a no-op.

use crate::oob::{subject, OobChannel, OobMessage, ORCHESTRATOR};
use crate::state::EpicState;

/// Recovered completions: bead IDs applied and message IDs to acknowledge.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Recovered {
    pub beads: Vec<String>,
    pub message_ids: Vec<String>,
}

/// Fetch the orchestrator inbox and fold missed completions into `state`.
pub fn run(state: &mut EpicState, oob: &OobChannel) -> Recovered {
    if !oob.is_enabled() {
        return Recovered::default();
    }
    let messages = oob.fetch_inbox(ORCHESTRATOR, 100);
    let recovered = apply(state, &messages);
    for id in &recovered.message_ids {
        oob.acknowledge(ORCHESTRATOR, id);
    }
    recovered
}

/// The pure part: decide which messages represent missed completions.
pub fn apply(state: &mut EpicState, messages: &[OobMessage]) -> Recovered {
    let mut recovered = Recovered::default();

    for message in messages {
        if message.acked {
            continue;
        }
        let Some(bead_id) = subject::parse_done(&message.subject) else {
            continue;
        };
        if !state.beads.iter().any(|b| b == bead_id) {
            continue;
        }
        if state.completed_beads.iter().any(|b| b == bead_id) {
            // Already persisted; just clear the message.
            recovered.message_ids.push(message.id.clone());
            continue;
        }

        state.record_completion(bead_id);
        if state.current_bead == bead_id {
            state.current_bead.clear();
        }
        recovered.beads.push(bead_id.to_string());
        recovered.message_ids.push(message.id.clone());
    }

    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EpicStatus;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn state() -> EpicState {
        EpicState {
            epic_id: "ep-1".into(),
            epic_title: "Epic".into(),
            worktree: PathBuf::from("/wt"),
            session_name: "auto-ep-1".into(),
            beads: vec!["bd-1".into(), "bd-2".into()],
            bead_titles: BTreeMap::new(),
            completed_beads: vec![],
            bead_commits: vec![],
            failed_beads: BTreeMap::new(),
            current_bead: "bd-1".into(),
            status: EpicStatus::Running,
            start_time: chrono::Utc::now(),
            project_dir: PathBuf::from("/repo"),
            merge_mode: String::new(),
        }
    }

    fn message(id: &str, subject: &str, acked: bool) -> OobMessage {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "from": "worker",
            "subject": subject,
            "body": "",
            "acked": acked,
        }))
        .unwrap()
    }

    #[test]
    fn recovers_unacked_done() {
        let mut s = state();
        let recovered = apply(&mut s, &[message("m-1", "DONE: bd-1", false)]);
        assert_eq!(recovered.beads, vec!["bd-1"]);
        assert_eq!(recovered.message_ids, vec!["m-1"]);
        assert_eq!(s.completed_beads, vec!["bd-1"]);
        assert!(s.current_bead.is_empty());
    }

    #[test]
    fn skips_acked_foreign_and_non_done() {
        let mut s = state();
        let messages = vec![
            message("m-1", "DONE: bd-1", true),
            message("m-2", "DONE: bd-99", false),
            message("m-3", "PROGRESS: bd-1", false),
        ];
        let recovered = apply(&mut s, &messages);
        assert!(recovered.beads.is_empty());
        assert!(recovered.message_ids.is_empty());
        assert!(s.completed_beads.is_empty());
    }

    #[test]
    fn already_completed_bead_only_acks() {
        let mut s = state();
        s.record_completion("bd-1");
        let recovered = apply(&mut s, &[message("m-1", "DONE: bd-1", false)]);
        assert!(recovered.beads.is_empty());
        assert_eq!(recovered.message_ids, vec!["m-1"]);
        assert_eq!(s.completed_beads, vec!["bd-1"]);
    }

    #[test]
    fn replay_is_idempotent() {
        let mut s = state();
        let messages = vec![message("m-1", "DONE: bd-1", false)];
        let first = apply(&mut s, &messages);
        assert_eq!(first.beads, vec!["bd-1"]);

        let second = apply(&mut s, &messages);
        assert!(second.beads.is_empty());
        assert_eq!(s.completed_beads, vec!["bd-1"]);
    }
}
