use std::fs;
use std::path::PathBuf;

/// Journal recording per-bead outcomes for a project's epic runs.
///
/// Stored at `~/.cache/herd/projects/<project>/epic-run.txt` (XDG-compliant).
/// Purely informational; `herd check` surfaces the tail.
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(project: &str) -> Self {
        Self {
            path: cache_dir(project).join("epic-run.txt"),
        }
    }

    /// Truncate at the start of a new epic run.
    pub fn truncate(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if self.path.exists() {
            let _ = fs::write(&self.path, "");
        }
    }

    /// Append an entry with a timestamp header.
    pub fn append(&self, entry: &str) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let content = format!("\n--- {timestamp} ---\n{}\n", entry.trim());

        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(content.as_bytes())
            })
        {
            tracing::warn!("failed to append to journal: {e}");
        }
    }

    /// Last few entries, for check output. None when empty or unreadable.
    pub fn tail(&self, max_lines: usize) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lines: Vec<&str> = trimmed.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Some(lines[start..].join("\n"))
    }
}

/// XDG-compliant cache directory for a project's run artifacts.
fn cache_dir(project: &str) -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg)
    } else {
        dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
    };
    base.join("herd").join("projects").join(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: tests in this module run on one thread at a time per test
        // binary startup; the var is process-local scratch.
        unsafe {
            std::env::set_var("XDG_CACHE_HOME", dir.path());
        }

        let journal = Journal::new("demo-journal-test");
        journal.truncate();
        journal.append("bd-1: success (abc123)");
        journal.append("bd-2: timeout");

        let tail = journal.tail(10).unwrap();
        assert!(tail.contains("bd-1: success"));
        assert!(tail.contains("bd-2: timeout"));
    }
}
