//! End-to-end epic runs against scripted companion tools.
//!
//! Every external collaborator (bd, tmux, git, wt, pgrep) is a shell script
//! on a private PATH. The tmux fake plays the worker: when it sees a bead
//! prompt pasted into the buffer it drops the bead-done signal file, exactly
//! as a real agent running `herd signal bead-done` would.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

struct Harness {
    _root: tempfile::TempDir,
    project_dir: PathBuf,
    state_dir: PathBuf,
    ctrl_dir: PathBuf,
    worktree_dir: PathBuf,
    bin_dir: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("demo");
        let state_dir = root.path().join("state");
        let ctrl_dir = root.path().join("ctrl");
        let worktree_dir = root.path().join("worktree");
        let bin_dir = root.path().join("bin");
        for dir in [&project_dir, &state_dir, &ctrl_dir, &bin_dir] {
            fs::create_dir_all(dir).unwrap();
        }

        fs::write(
            project_dir.join(".herd.toml"),
            "[agent]\n\
             command = \"agent-fake\"\n\
             timeoutMinutes = 1\n\
             pollSecs = 1\n\
             promptWaitSecs = 2\n\
             \n\
             [oob]\n\
             enabled = false\n",
        )
        .unwrap();

        let harness = Self {
            _root: root,
            project_dir,
            state_dir,
            ctrl_dir,
            worktree_dir,
            bin_dir,
        };
        harness.install_fakes();
        harness
    }

    fn install_fakes(&self) {
        self.script(
            "bd",
            r#"#!/bin/sh
ctrl="$HERD_TEST_CTRL"
case "$1" in
  show)
    case "$2" in
      E1) printf '%s' '{"id":"E1","title":"Epic one","description":"parent","status":"open","priority":0,"issue_type":"epic","dependents":[{"id":"B1"},{"id":"B2"}]}' ;;
      B1) printf '%s' '{"id":"B1","title":"first task","description":"do the first thing","status":"open","priority":1,"issue_type":"task"}' ;;
      B2) printf '%s' '{"id":"B2","title":"second task","description":"do the second thing","status":"open","priority":1,"issue_type":"task"}' ;;
      E2) printf '%s' '{"id":"E2","title":"Epic two","description":"parent","status":"open","priority":0,"issue_type":"epic","dependents":[{"id":"B3"}]}' ;;
      B3) printf '%s' '{"id":"B3","title":"undescribed","description":"","status":"open","priority":1,"issue_type":"task"}' ;;
      E3) printf '%s' '{"id":"E3","title":"Epic three","description":"parent","status":"open","priority":0,"issue_type":"epic","dependents":[{"id":"B1"},{"id":"B2f"},{"id":"B4"}]}' ;;
      B2f) printf '%s' '{"id":"B2f","title":"doomed task","description":"the agent will die on this one","status":"open","priority":1,"issue_type":"task"}' ;;
      B4) printf '%s' '{"id":"B4","title":"fourth task","description":"do the fourth thing","status":"open","priority":1,"issue_type":"task"}' ;;
      *) printf '{}' ; exit 1 ;;
    esac ;;
  dep) printf '[]' ;;
  ready) printf '[]' ;;
  update) echo "update $2 $4" >> "$ctrl/bd.log" ;;
  close) echo "close $2" >> "$ctrl/bd.log" ;;
esac
exit 0
"#,
        );

        self.script(
            "wt",
            r#"#!/bin/sh
# worktree-create <epic> --shell --session <name>
mkdir -p "$HERD_TEST_WORKTREE"
touch "$HERD_TEST_CTRL/session_$5"
echo "Branch: epic/$2"
echo "Worktree: $HERD_TEST_WORKTREE"
echo "Session '$5' ready"
"#,
        );

        self.script(
            "git",
            r#"#!/bin/sh
ctrl="$HERD_TEST_CTRL"
n=$(cat "$ctrl/done_count" 2>/dev/null || echo 1)
case "$1" in
  rev-parse) echo "hash$n" ;;
  log) echo "feat: commit $n" ;;
  worktree) rm -rf "$4" ;;
esac
exit 0
"#,
        );

        self.script(
            "tmux",
            r#"#!/bin/sh
ctrl="$HERD_TEST_CTRL"
case "$1" in
  new-session) touch "$ctrl/session_$4" ;;
  has-session) [ -f "$ctrl/session_$3" ] || exit 1 ;;
  kill-session) rm -f "$ctrl/session_$3" ;;
  display-message) echo 99999 ;;
  list-sessions) : ;;
  send-keys) : ;;
  load-buffer) cp "$4" "$ctrl/buffer.txt" ;;
  paste-buffer)
    if grep -q '^Bead: ' "$ctrl/buffer.txt" 2>/dev/null; then
      bead=$(sed -n 's/^Bead: //p' "$ctrl/buffer.txt" | head -1)
      if [ "$bead" = "B2f" ]; then
        # This agent crashes without committing or signaling.
        rm -f "$ctrl/agent_running"
      else
        n=$(cat "$ctrl/done_count" 2>/dev/null || echo 0)
        n=$((n+1))
        echo "$n" > "$ctrl/done_count"
        printf '{"beadId":"%s","summary":"finished %s","at":"2026-01-01T00:00:00Z"}' "$bead" "$bead" > "$HERD_TEST_WORKTREE/.herd-bead-done"
        rm -f "$ctrl/agent_running"
      fi
    else
      touch "$ctrl/agent_running"
    fi ;;
esac
exit 0
"#,
        );

        self.script(
            "pgrep",
            r#"#!/bin/sh
if [ -f "$HERD_TEST_CTRL/agent_running" ]; then
  echo 4242
  exit 0
fi
exit 1
"#,
        );
    }

    /// Rewrite the project config with the message channel pointed at `url`.
    fn enable_oob(&self, url: &str) {
        fs::write(
            self.project_dir.join(".herd.toml"),
            format!(
                "[agent]\n\
                 command = \"agent-fake\"\n\
                 timeoutMinutes = 1\n\
                 pollSecs = 1\n\
                 promptWaitSecs = 2\n\
                 \n\
                 [oob]\n\
                 url = \"{url}\"\n"
            ),
        )
        .unwrap();
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.bin_dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    fn herd(&self) -> Command {
        let path = format!(
            "{}:{}",
            self.bin_dir.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let mut cmd = Command::cargo_bin("herd").unwrap();
        cmd.current_dir(&self.project_dir)
            .env("PATH", path)
            .env("HERD_STATE_DIR", &self.state_dir)
            .env("HERD_TEST_CTRL", &self.ctrl_dir)
            .env("HERD_TEST_WORKTREE", &self.worktree_dir)
            .env("XDG_CONFIG_HOME", self.ctrl_dir.join("xdg-config"))
            .env("XDG_CACHE_HOME", self.ctrl_dir.join("xdg-cache"))
            .timeout(std::time::Duration::from_secs(60));
        cmd
    }

    fn bd_log(&self) -> Vec<String> {
        fs::read_to_string(self.ctrl_dir.join("bd.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join("demo.state.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join("demo.lock")
    }
}

/// A one-message OOB endpoint: the inbox always serves an unacknowledged
/// `DONE: B1`, and every ack lands in the shared vec.
fn spawn_oob_server(acks: std::sync::Arc<std::sync::Mutex<Vec<String>>>) -> String {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let line = request.lines().next().unwrap_or("");

            let body = if line.starts_with("GET /inbox/") {
                r#"{"messages":[{"id":"m-1","from":"auto-e1","subject":"DONE: B1","body":"","acked":false}]}"#
            } else if line.starts_with("POST /messages/m-1/ack") {
                acks.lock().unwrap().push("m-1".to_string());
                "{}"
            } else {
                "{}"
            };

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    format!("http://{addr}")
}

#[test]
fn happy_path_two_beads_completes_and_closes_epic() {
    let h = Harness::new();

    h.herd()
        .args(["run", "E1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("B1: success (hash1"))
        .stderr(predicate::str::contains("B2: success (hash2"))
        .stderr(predicate::str::contains("epic E1 completed: 2 beads"));

    assert_eq!(
        h.bd_log(),
        vec![
            "update B1 in_progress",
            "close B1",
            "update B2 in_progress",
            "close B2",
            "close E1",
        ]
    );

    // Completed runs leave nothing behind: no state, no lock, no marker.
    assert!(!h.state_path().exists());
    assert!(!h.lock_path().exists());
    assert!(!h.worktree_dir.join(".wt-batch-mode").exists());
}

#[test]
fn audit_failure_writes_no_state_and_no_lock() {
    let h = Harness::new();

    h.herd()
        .args(["run", "E2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("B3"));

    assert!(!h.state_path().exists());
    assert!(!h.lock_path().exists());
    assert!(h.bd_log().is_empty());
}

#[test]
fn mid_epic_failure_continues_and_ends_partial() {
    let h = Harness::new();

    // B2f's agent dies without committing or signaling; B1 and B4 succeed.
    h.herd()
        .args(["run", "E3"])
        .assert()
        .success()
        .stderr(predicate::str::contains("B1: success (hash1"))
        .stderr(predicate::str::contains("B2f: failed-exited"))
        .stderr(predicate::str::contains("B4: success (hash2"))
        .stderr(predicate::str::contains(
            "epic E3 finished partial: 2 completed, 1 failed",
        ));

    // The failed bead is recorded and the run kept going past it.
    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(h.state_path()).unwrap()).unwrap();
    assert_eq!(state["status"], "partial");
    assert_eq!(state["completedBeads"], serde_json::json!(["B1", "B4"]));
    assert_eq!(
        state["failedBeads"],
        serde_json::json!({"B2f": "failed-exited"})
    );

    // The epic is never closed over a failure, and neither is the failed bead.
    assert_eq!(
        h.bd_log(),
        vec![
            "update B1 in_progress",
            "close B1",
            "update B2f in_progress",
            "update B4 in_progress",
            "close B4",
        ]
    );

    // State survives for resume/abort; the lock does not.
    assert!(h.state_path().exists());
    assert!(!h.lock_path().exists());
}

#[test]
fn resume_reconciles_unacked_done_from_the_channel() {
    let h = Harness::new();
    let acks = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let url = spawn_oob_server(std::sync::Arc::clone(&acks));
    h.enable_oob(&url);

    // A crashed run: B1 was committed and signaled over the channel, but the
    // runner died before persisting. No live lock remains.
    fs::create_dir_all(&h.worktree_dir).unwrap();
    fs::File::create(h.ctrl_dir.join("session_auto-e1")).unwrap();
    fs::write(h.ctrl_dir.join("done_count"), "1").unwrap();
    let state = serde_json::json!({
        "epicId": "E1",
        "epicTitle": "Epic one",
        "worktree": h.worktree_dir,
        "sessionName": "auto-e1",
        "beads": ["B1", "B2"],
        "beadTitles": {"B1": "first task", "B2": "second task"},
        "completedBeads": [],
        "beadCommits": [],
        "failedBeads": {},
        "currentBead": "B1",
        "status": "running",
        "startTime": "2026-01-01T00:00:00Z",
        "projectDir": h.project_dir,
        "mergeMode": ""
    });
    fs::write(h.state_path(), serde_json::to_string_pretty(&state).unwrap()).unwrap();

    h.herd()
        .args(["resume"])
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "reconciled completion for B1 from the message channel",
        ))
        .stderr(predicate::str::contains("epic E1 completed: 2 beads"));

    // B1 was recovered from the inbox, not re-run; only B2 went to the agent.
    assert_eq!(
        h.bd_log(),
        vec!["update B2 in_progress", "close B2", "close E1"]
    );
    assert!(acks.lock().unwrap().contains(&"m-1".to_string()));
    assert!(!h.state_path().exists());
}

#[test]
fn stop_file_pauses_before_first_bead_then_resume_finishes() {
    let h = Harness::new();

    // A pre-existing stop request pauses the run at the first boundary.
    fs::write(h.state_dir.join("demo.stop"), "now").unwrap();

    h.herd()
        .args(["run", "E1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("paused before B1"));

    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(h.state_path()).unwrap()).unwrap();
    assert_eq!(state["status"], "paused");
    assert_eq!(state["currentBead"], "B1");
    assert!(h.bd_log().is_empty());

    h.herd()
        .args(["resume"])
        .assert()
        .success()
        .stderr(predicate::str::contains("epic E1 completed: 2 beads"));

    assert!(!h.state_path().exists());
    assert_eq!(h.bd_log().last().unwrap(), "close E1");
}

#[test]
fn resume_never_reruns_completed_beads() {
    let h = Harness::new();

    // A paused run that already finished B1.
    fs::create_dir_all(&h.worktree_dir).unwrap();
    fs::File::create(h.ctrl_dir.join("session_auto-e1")).unwrap();
    fs::write(h.ctrl_dir.join("done_count"), "1").unwrap();
    let state = serde_json::json!({
        "epicId": "E1",
        "epicTitle": "Epic one",
        "worktree": h.worktree_dir,
        "sessionName": "auto-e1",
        "beads": ["B1", "B2"],
        "beadTitles": {"B1": "first task", "B2": "second task"},
        "completedBeads": ["B1"],
        "beadCommits": [
            {"beadId": "B1", "commitHash": "hash1", "summary": "feat: commit 1", "title": "first task"}
        ],
        "failedBeads": {},
        "currentBead": "B2",
        "status": "paused",
        "startTime": "2026-01-01T00:00:00Z",
        "projectDir": h.project_dir,
        "mergeMode": ""
    });
    fs::write(h.state_path(), serde_json::to_string_pretty(&state).unwrap()).unwrap();

    h.herd()
        .args(["resume"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Resuming epic E1 at bead 2/2"))
        .stderr(predicate::str::contains("epic E1 completed: 2 beads"));

    let log = h.bd_log();
    assert!(!log.iter().any(|l| l.contains("B1")), "B1 was touched: {log:?}");
    assert_eq!(
        log,
        vec!["update B2 in_progress", "close B2", "close E1"]
    );
    assert!(!h.state_path().exists());
}

#[test]
fn abort_tears_down_worktree_state_and_lock() {
    let h = Harness::new();

    fs::write(h.state_dir.join("demo.stop"), "now").unwrap();
    h.herd().args(["run", "E1"]).assert().success();
    assert!(h.state_path().exists());
    assert!(h.worktree_dir.exists());

    h.herd()
        .args(["abort", "--yes"])
        .assert()
        .success()
        .stderr(predicate::str::contains("aborted epic E1"));

    assert!(!h.state_path().exists());
    assert!(!h.lock_path().exists());
    assert!(!h.worktree_dir.exists());

    h.herd()
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("state: none"))
        .stdout(predicate::str::contains("no session"));
}

#[test]
fn check_reports_paused_run_without_mutating() {
    let h = Harness::new();

    fs::write(h.state_dir.join("demo.stop"), "now").unwrap();
    h.herd().args(["run", "E1"]).assert().success();

    let before = fs::read_to_string(h.state_path()).unwrap();
    h.herd()
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("epic: E1"))
        .stdout(predicate::str::contains("status: paused"))
        .stdout(predicate::str::contains("progress: 0/2"));
    let after = fs::read_to_string(h.state_path()).unwrap();
    assert_eq!(before, after);
}
