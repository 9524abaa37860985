use std::io::IsTerminal;

use anyhow::Context;
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::ExitError;
use crate::subprocess::Tool;

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Project name (default: current directory)
    #[arg(long)]
    pub project: Option<String>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DoctorReport {
    pub project: String,
    pub tools: Vec<ToolStatus>,
    pub oob: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: String,
    pub version: Option<String>,
    pub present: bool,
}

impl DoctorArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let (project, project_dir) =
            crate::commands::epic::resolve_existing(self.project.as_deref())?;
        let config = Config::for_project(&project_dir)?;

        let format = self.format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        });

        let mut report = DoctorReport {
            project,
            tools: vec![],
            oob: String::new(),
            issues: vec![],
        };

        let agent_binary = config
            .agent
            .command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        let required: Vec<(String, String)> = vec![
            ("issue tracker".to_string(), config.tools.beads.clone()),
            ("multiplexer".to_string(), config.tools.tmux.clone()),
            ("git".to_string(), config.tools.git.clone()),
            ("worktree tool".to_string(), config.tools.worktree.clone()),
            ("agent".to_string(), agent_binary),
        ];

        for (label, binary) in required {
            if binary.is_empty() {
                report.issues.push(format!("{label}: no command configured"));
                continue;
            }
            let version_output = Tool::new(&binary).arg("--version").run();
            match version_output {
                Ok(output) if output.success() => {
                    report.tools.push(ToolStatus {
                        name: format!("{label} ({binary})"),
                        version: Some(
                            output.stdout.lines().next().unwrap_or_default().to_string(),
                        ),
                        present: true,
                    });
                }
                _ => {
                    report.tools.push(ToolStatus {
                        name: format!("{label} ({binary})"),
                        version: None,
                        present: false,
                    });
                    report.issues.push(format!("tool not found: {binary}"));
                }
            }
        }

        report.oob = match (config.oob.enabled, config.oob.url.as_deref()) {
            (false, _) => "disabled".to_string(),
            (true, None) => "not configured".to_string(),
            (true, Some(url)) => {
                let oob = crate::oob::OobChannel::connect(&config.oob);
                if oob.is_enabled() {
                    format!("reachable at {url}")
                } else {
                    report.issues.push(format!("oob endpoint unreachable: {url}"));
                    format!("unreachable at {url}")
                }
            }
        };

        let issue_count = report.issues.len();

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing doctor report")?
                );
            }
        }

        if issue_count > 0 {
            return Err(ExitError::Other(format!("{issue_count} issue(s) found")).into());
        }
        Ok(())
    }
}

fn print_pretty(report: &DoctorReport) {
    println!("=== Herd Doctor ===\n");
    println!("Project: {}", report.project);
    println!();

    println!("Tools:");
    for tool in &report.tools {
        if tool.present {
            println!(
                "  ✓ {}: {}",
                tool.name,
                tool.version.as_deref().unwrap_or("OK")
            );
        } else {
            println!("  ✗ {}: NOT FOUND", tool.name);
        }
    }

    println!("\nMessage channel: {}", report.oob);

    if report.issues.is_empty() {
        println!("\n✓ No issues found");
    } else {
        println!("\nIssues ({}):", report.issues.len());
        for issue in &report.issues {
            println!("  • {issue}");
        }
    }
}

fn print_text(report: &DoctorReport) {
    println!("herd-doctor  project={}", report.project);
    for tool in &report.tools {
        let status = if tool.present {
            format!("ok  {}", tool.version.as_deref().unwrap_or(""))
        } else {
            "missing".to_string()
        };
        println!("tool  {}  {}", tool.name, status);
    }
    println!("oob  {}", report.oob);
    for issue in &report.issues {
        println!("issue  {issue}");
    }
}
