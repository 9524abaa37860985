//! Session Host: adapter over the terminal multiplexer.
//!
//! Prompt delivery goes through a named paste buffer (load-buffer, then
//! paste-buffer, then a single Enter). Per-key send-keys delivery corrupts
//! long prompts under load and is only used for control keys.
//!
//! The runner never learns the agent's PID. Agent teardown works through the
//! pane: an interrupt keystroke, a bounded wait, then one more interrupt.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::ExitError;
use crate::subprocess::Tool;

const PROMPT_BUFFER: &str = "herd-prompt";

/// Session host bound to one multiplexer binary.
#[derive(Debug, Clone)]
pub struct SessionHost {
    bin: String,
}

impl SessionHost {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }

    /// Create a detached session. With `command` the pane runs that as its
    /// root process; without, it gets an interactive shell.
    pub fn create(
        &self,
        name: &str,
        workdir: &Path,
        env: &[(String, String)],
        command: Option<&str>,
    ) -> anyhow::Result<()> {
        if !workdir.exists() {
            return Err(ExitError::AgentIo(format!(
                "working directory does not exist: {}",
                workdir.display()
            ))
            .into());
        }

        let mut tool = Tool::new(&self.bin)
            .args(&["new-session", "-d", "-s", name, "-c"])
            .arg(&workdir.to_string_lossy());
        for (key, value) in env {
            tool = tool.arg("-e").arg(&format!("{key}={value}"));
        }
        if let Some(cmd) = command {
            tool = tool.arg(cmd);
        }

        let output = tool.run()?;
        if !output.success() {
            return Err(ExitError::AgentIo(format!(
                "session create failed: {}",
                output.stderr.trim()
            ))
            .into());
        }
        Ok(())
    }

    /// Deliver `text` atomically to the pane, then press Enter.
    ///
    /// The text is staged in a temp file, loaded into a named buffer, and
    /// pasted in one operation, so the pane's reader sees a single write.
    pub fn inject(&self, name: &str, text: &str) -> anyhow::Result<()> {
        let staging =
            std::env::temp_dir().join(format!("herd-prompt-{}-{name}.txt", std::process::id()));
        std::fs::write(&staging, text).context("staging prompt text")?;

        let path = staging.to_string_lossy().into_owned();
        let result = self
            .run_checked(&["load-buffer", "-b", PROMPT_BUFFER, &path], "load-buffer")
            .and_then(|()| {
                self.run_checked(
                    &["paste-buffer", "-d", "-b", PROMPT_BUFFER, "-t", name],
                    "paste-buffer",
                )
            })
            .and_then(|()| self.send_enter(name));

        let _ = std::fs::remove_file(&staging);
        result
    }

    /// Press Enter in the pane.
    pub fn send_enter(&self, name: &str) -> anyhow::Result<()> {
        self.run_checked(&["send-keys", "-t", name, "Enter"], "send-keys")
    }

    /// Terminate the foreground child of the pane's shell, leaving the shell
    /// alive. Returns true once the pane is idle.
    pub fn kill_agent(&self, name: &str) -> anyhow::Result<bool> {
        if self.is_idle(name)? {
            return Ok(true);
        }

        self.send_interrupt(name)?;
        if self.wait_idle(name, Duration::from_secs(2)) {
            return Ok(true);
        }

        // A TUI agent can swallow the first interrupt; one more, shorter wait.
        self.send_interrupt(name)?;
        Ok(self.wait_idle(name, Duration::from_secs(1)))
    }

    /// True iff the pane's shell has no live child process.
    pub fn is_idle(&self, name: &str) -> anyhow::Result<bool> {
        let pid = self.pane_pid(name)?;
        let output = Tool::new("pgrep").args(&["-P", &pid]).run()?;
        // pgrep exits 1 when nothing matches.
        Ok(!output.success())
    }

    /// Wait up to `budget` for the pane to become idle.
    pub fn wait_idle(&self, name: &str, budget: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_idle(name).unwrap_or(false) {
                return true;
            }
            if start.elapsed() >= budget {
                return false;
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    /// Kill the whole session. Missing sessions are fine.
    pub fn kill(&self, name: &str) -> anyhow::Result<()> {
        let _ = Tool::new(&self.bin)
            .args(&["kill-session", "-t", name])
            .run()?;
        Ok(())
    }

    pub fn has_session(&self, name: &str) -> bool {
        Tool::new(&self.bin)
            .args(&["has-session", "-t", name])
            .run()
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Names of all live sessions, for collision-free allocation.
    pub fn list_sessions(&self) -> Vec<String> {
        let output = Tool::new(&self.bin)
            .args(&["list-sessions", "-F", "#{session_name}"])
            .run();
        match output {
            Ok(o) if o.success() => o.stdout.lines().map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }

    /// Last `lines` of pane content.
    pub fn capture(&self, name: &str, lines: u32) -> anyhow::Result<String> {
        let output = Tool::new(&self.bin)
            .args(&["capture-pane", "-t", name, "-p", "-S"])
            .arg(&format!("-{lines}"))
            .run()?;
        if !output.success() {
            return Err(ExitError::AgentIo(format!("no such session: {name}")).into());
        }
        Ok(output.stdout)
    }

    fn send_interrupt(&self, name: &str) -> anyhow::Result<()> {
        self.run_checked(&["send-keys", "-t", name, "C-c"], "send-keys")
    }

    fn pane_pid(&self, name: &str) -> anyhow::Result<String> {
        let output = Tool::new(&self.bin)
            .args(&["display-message", "-p", "-t", name, "#{pane_pid}"])
            .run()?;
        if !output.success() {
            return Err(ExitError::AgentIo(format!("no such session: {name}")).into());
        }
        let pid = output.stdout.trim().to_string();
        if pid.is_empty() {
            return Err(ExitError::AgentIo(format!("no pane pid for session {name}")).into());
        }
        Ok(pid)
    }

    fn run_checked(&self, args: &[&str], verb: &str) -> anyhow::Result<()> {
        let output = Tool::new(&self.bin).args(args).run()?;
        if output.success() {
            Ok(())
        } else {
            Err(ExitError::AgentIo(format!("{verb} failed: {}", output.stderr.trim())).into())
        }
    }
}
