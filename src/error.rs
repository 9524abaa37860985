use std::process::ExitCode;

/// Errors that cause herd to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("epic {0} not found in any registered project")]
    EpicNotFound(String),

    #[error("{0} is not an epic")]
    NotAnEpic(String),

    #[error("epic {0} has no dependent beads")]
    EmptyEpic(String),

    #[error("bead {0} is not ready: missing description")]
    BeadUnready(String),

    #[error("bead {bead} is blocked by {blocker}, which is outside the epic")]
    ExternalBlocker { bead: String, blocker: String },

    #[error("another run holds the lock for project {project} (pid {pid})")]
    Contended { project: String, pid: i32 },

    #[error("no epic state found for project {0}")]
    NoState(String),

    #[error("state file for project {project} is corrupt: {detail}")]
    StateCorrupt { project: String, detail: String },

    #[error("bead {bead} failed: {outcome}")]
    BeadFailed { bead: String, outcome: String },

    #[error("session I/O error: {0}")]
    AgentIo(String),

    #[error("issue tracker error: {0}")]
    IssueIo(String),

    #[error("version control error: {0}")]
    VcsIo(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::EpicNotFound(_) | ExitError::NotAnEpic(_) => ExitCode::from(6),
            ExitError::EmptyEpic(_)
            | ExitError::BeadUnready(_)
            | ExitError::ExternalBlocker { .. } => ExitCode::from(7),
            ExitError::Contended { .. } => ExitCode::from(8),
            ExitError::NoState(_) => ExitCode::from(9),
            ExitError::StateCorrupt { .. } => ExitCode::from(10),
            ExitError::BeadFailed { .. } => ExitCode::from(11),
            ExitError::AgentIo(_) => ExitCode::from(12),
            ExitError::IssueIo(_) | ExitError::VcsIo(_) => ExitCode::from(13),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }

    /// Remediation hint printed under fatal errors, where one exists.
    pub fn remediation(&self, project: &str) -> Option<String> {
        match self {
            ExitError::BeadFailed { .. } => Some(format!(
                "resume with `herd resume --project {project}` or tear down with `herd abort --project {project}`"
            )),
            ExitError::Contended { .. } => Some(format!(
                "check the running instance with `herd check --project {project}`, or pass --force if it is stale"
            )),
            ExitError::NoState(_) => Some("start a new run with `herd run <epic-id>`".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_exit_codes_for_audit_and_lock_errors() {
        let unready = ExitError::BeadUnready("bd-12".into());
        let contended = ExitError::Contended {
            project: "demo".into(),
            pid: 123,
        };
        assert_ne!(
            format!("{:?}", unready.exit_code()),
            format!("{:?}", contended.exit_code())
        );
    }

    #[test]
    fn bead_failed_has_remediation() {
        let err = ExitError::BeadFailed {
            bead: "bd-9".into(),
            outcome: "timeout".into(),
        };
        let hint = err.remediation("demo").unwrap();
        assert!(hint.contains("herd resume --project demo"));
        assert!(hint.contains("herd abort --project demo"));
    }
}
