use std::process::ExitCode;

use clap::{Parser, Subcommand};

use conductor::commands;
use conductor::commands::cleanup::CleanupArgs;
use conductor::commands::complete::CompleteArgs;
use conductor::commands::doctor::DoctorArgs;
use conductor::commands::dupes::DupesArgs;
use conductor::commands::init::InitArgs;
use conductor::commands::labels::LabelsArgs;
use conductor::commands::monitor::MonitorArgs;
use conductor::commands::progress::ProgressArgs;
use conductor::commands::release::ReleaseArgs;
use conductor::commands::start::StartArgs;
use conductor::commands::status::StatusArgs;
use conductor::commands::task::TaskCommand;
use conductor::commands::tasks::TasksArgs;
use conductor::error::ExitError;
use conductor::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "conductor",
    version,
    about = "Claim GitHub issues as tasks, work them in isolated worktrees, and reap stale claims"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Claim the next task for a role and create its worktree
    Start(StartArgs),
    /// Post a heartbeat on the current task
    Progress(ProgressArgs),
    /// Open the pull request, finish the claim, and remove the worktree
    Complete(CompleteArgs),
    /// Give the current task back to the pool
    Release(ReleaseArgs),
    /// Show the current claim and what is claimable
    Status(StatusArgs),
    /// List claimable tasks in claim order
    Tasks(TasksArgs),
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Find existing tasks similar to a title
    Dupes(DupesArgs),
    /// Reclaim stale claims and refresh the status issue
    Monitor(MonitorArgs),
    /// Sweep idle worktrees and archive finished tasks
    Cleanup(CleanupArgs),
    /// Create any missing labels
    Labels(LabelsArgs),
    /// Check gh, git, config, and labels
    Doctor(DoctorArgs),
    /// Write a default .conductor.toml and create labels
    Init(InitArgs),
    /// Print the JSON Schema for .conductor.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Progress(_) => "progress",
            Self::Complete(_) => "complete",
            Self::Release(_) => "release",
            Self::Status(_) => "status",
            Self::Tasks(_) => "tasks",
            Self::Task { .. } => "task",
            Self::Dupes(_) => "dupes",
            Self::Monitor(_) => "monitor",
            Self::Cleanup(_) => "cleanup",
            Self::Labels(_) => "labels",
            Self::Doctor(_) => "doctor",
            Self::Init(_) => "init",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Start(args) => args.execute(),
        Commands::Progress(args) => args.execute(),
        Commands::Complete(args) => args.execute(),
        Commands::Release(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Tasks(args) => args.execute(),
        Commands::Task { command } => command.execute(),
        Commands::Dupes(args) => args.execute(),
        Commands::Monitor(args) => args.execute(),
        Commands::Cleanup(args) => args.execute(),
        Commands::Labels(args) => args.execute(),
        Commands::Doctor(args) => args.execute(),
        Commands::Init(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                if let Some(hint) = exit_err.hint() {
                    eprintln!("hint: {hint}");
                }
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::from(4)
            }
        }
    }
}
