mod beads;
mod commands;
mod config;
mod error;
mod lockfile;
mod names;
mod oob;
mod state;
mod subprocess;
mod telemetry;
mod tmux;
mod worktree;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::doctor::DoctorArgs;
use commands::epic::RunOptions;

#[derive(Debug, Parser)]
#[command(
    name = "herd",
    version,
    about = "Drive coding agents through an epic's beads, one tmux session per epic"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every bead under an epic in one worktree/session pair
    Run {
        /// Epic ID to run
        epic_id: String,
        /// Project name (default: search registered projects for the epic)
        #[arg(long)]
        project: Option<String>,
        /// Take over a live lock
        #[arg(long)]
        force: bool,
        /// Start even when the readiness audit fails (not recommended)
        #[arg(long)]
        skip_audit: bool,
        /// Stop at the first failed bead instead of continuing
        #[arg(long)]
        pause_on_failure: bool,
        /// Merge mode recorded in state for downstream tooling
        #[arg(long)]
        merge: Option<String>,
    },
    /// Continue a paused, failed, or crashed run
    Resume {
        /// Project name (default: current directory)
        #[arg(long)]
        project: Option<String>,
    },
    /// Tear down the run: kill session, remove worktree, delete state
    Abort {
        /// Project name (default: current directory)
        #[arg(long)]
        project: Option<String>,
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Report run status without touching anything
    Check {
        /// Project name (default: current directory)
        #[arg(long)]
        project: Option<String>,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<commands::doctor::OutputFormat>,
    },
    /// Ask the runner to pause after the current bead
    Stop {
        /// Project name (default: current directory)
        #[arg(long)]
        project: Option<String>,
    },
    /// Audit an epic's readiness without starting it
    Audit {
        /// Epic ID to audit
        epic_id: String,
        /// Project name (default: search registered projects for the epic)
        #[arg(long)]
        project: Option<String>,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Worker-side signals (invoked from inside the worktree)
    Signal {
        #[command(subcommand)]
        command: SignalCommand,
    },
    /// Validate config and companion tools
    Doctor(DoctorArgs),
    /// Print the JSON Schema for .herd.toml
    Schema,
}

#[derive(Debug, Subcommand)]
enum SignalCommand {
    /// The current bead is committed; advance the epic
    BeadDone {
        /// One-line summary of the completed work
        summary: String,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Resume { .. } => "resume",
            Self::Abort { .. } => "abort",
            Self::Check { .. } => "check",
            Self::Stop { .. } => "stop",
            Self::Audit { .. } => "audit",
            Self::Signal { .. } => "signal",
            Self::Doctor(_) => "doctor",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run {
            epic_id,
            project,
            force,
            skip_audit,
            pause_on_failure,
            merge,
        } => commands::epic::run(
            &epic_id,
            &RunOptions {
                project,
                force,
                skip_audit,
                pause_on_failure,
                merge,
            },
        ),
        Commands::Resume { project } => commands::epic::resume(project.as_deref()),
        Commands::Abort { project, yes } => commands::epic::abort(project.as_deref(), yes),
        Commands::Check { project, format } => commands::check::run(project.as_deref(), format),
        Commands::Stop { project } => commands::epic::stop(project.as_deref()),
        Commands::Audit {
            epic_id,
            project,
            json,
        } => run_audit(&epic_id, project.as_deref(), json),
        Commands::Signal { command } => match command {
            SignalCommand::BeadDone { summary } => commands::signal::bead_done(&summary),
        },
        Commands::Doctor(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

/// `herd audit` — standalone read-only readiness report.
fn run_audit(epic_id: &str, project: Option<&str>, json: bool) -> anyhow::Result<()> {
    use crate::beads::IssueGateway;
    use crate::commands::epic::audit;
    use crate::config::Config;

    let (_, project_dir) = commands::epic::resolve_for_epic(project, epic_id)?;
    let config = Config::for_project(&project_dir)?;
    let gateway = IssueGateway::new(&config.tools.beads, &project_dir);

    let report = audit::run(&gateway, epic_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", audit::render(epic_id, &report));
    }
    if report.ready {
        Ok(())
    } else {
        Err(report.into_error(epic_id).into())
    }
}
