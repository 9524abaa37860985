//! Companion-tool invocation.
//!
//! Every external collaborator (bd, tmux, git, the worktree tool, pgrep)
//! goes through [`Tool`]. Invocations are always bounded: a tool that hangs
//! would otherwise wedge the runner mid-bead, so each run gets a deadline
//! (generous default, overridable per call). Stdin is closed — a companion
//! tool that prompts interactively must fail, not wait.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::ExitError;

/// Ceiling for a single companion-tool call. Worktree creation is the
/// slowest thing we shell out to; two minutes covers it with room.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

/// How often the deadline loop re-checks the child.
const WAIT_STEP: Duration = Duration::from_millis(100);

/// Result of running a subprocess.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for one companion-tool invocation.
pub struct Tool {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    deadline: Duration,
}

impl Tool {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    /// Run with the given working directory.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Add an environment variable for the child.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Tighten (or loosen) the deadline for this call.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.deadline = limit;
        self
    }

    /// Run the tool, capturing stdout and stderr.
    #[tracing::instrument(skip(self), fields(tool = %self.program, cwd = ?self.cwd))]
    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        self.supervise(child)
    }

    /// Run the tool and return an error if it fails.
    pub fn run_ok(&self) -> anyhow::Result<RunOutput> {
        let output = self.run()?;
        if !output.success() {
            return Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    /// Wait for the child under the deadline, draining both pipes as it runs.
    ///
    /// The pipes are read on their own threads so a tool that prints more
    /// than a pipe buffer's worth cannot block against the wait loop.
    fn supervise(&self, mut child: Child) -> anyhow::Result<RunOutput> {
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || drain(stdout_pipe));
        let stderr_reader = std::thread::spawn(move || drain(stderr_pipe));

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExitError::Timeout {
                        tool: self.program.clone(),
                        timeout_secs: self.deadline.as_secs(),
                    }
                    .into());
                }
                Ok(None) => std::thread::sleep(WAIT_STEP),
                Err(e) => {
                    return Err(
                        anyhow::Error::new(e).context(format!("waiting for {}", self.program))
                    );
                }
            }
        };

        Ok(RunOutput {
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
            exit_code: status.code().unwrap_or(-1),
        })
    }

    fn spawn_error(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExitError::ToolNotFound {
                tool: self.program.clone(),
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("spawning {}", self.program))
        }
    }
}

fn drain<R: Read>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_both_streams_and_exit_code() {
        let output = Tool::new("sh")
            .args(&["-c", "echo ready; echo grumble >&2; exit 3"])
            .run()
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "ready");
        assert_eq!(output.stderr.trim(), "grumble");
    }

    #[test]
    fn current_dir_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let output = Tool::new("pwd").current_dir(dir.path()).run().unwrap();
        let got = PathBuf::from(output.stdout.trim());
        assert_eq!(
            got.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn env_is_passed_to_child() {
        let output = Tool::new("sh")
            .args(&["-c", "printf %s \"$HERD_PROBE\""])
            .env("HERD_PROBE", "bd-42")
            .run()
            .unwrap();
        assert_eq!(output.stdout, "bd-42");
    }

    #[test]
    fn missing_tool_maps_to_tool_not_found() {
        let err = Tool::new("no-such-issue-tracker").run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExitError>().unwrap(),
            ExitError::ToolNotFound { .. }
        ));
    }

    #[test]
    fn deadline_kills_a_hung_tool() {
        let started = Instant::now();
        let err = Tool::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExitError>().unwrap(),
            ExitError::Timeout { .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn run_ok_surfaces_stderr_in_the_error() {
        let err = Tool::new("sh")
            .args(&["-c", "echo tracker exploded >&2; exit 4"])
            .run_ok()
            .unwrap_err();
        let exit = err.downcast_ref::<ExitError>().unwrap();
        match exit {
            ExitError::ToolFailed { code, message, .. } => {
                assert_eq!(*code, 4);
                assert_eq!(message, "tracker exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stdin_is_closed_for_children() {
        // `cat` with no stdin must see EOF immediately instead of hanging.
        let output = Tool::new("cat")
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn large_output_does_not_deadlock_the_wait_loop() {
        // Well past a pipe buffer; the reader threads must keep draining
        // while the deadline loop waits.
        let output = Tool::new("sh")
            .args(&["-c", "i=0; while [ $i -lt 8000 ]; do echo line-$i; i=$((i+1)); done"])
            .timeout(Duration::from_secs(30))
            .run()
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.lines().count(), 8000);
        assert!(output.stdout.ends_with("line-7999\n"));
    }
}
