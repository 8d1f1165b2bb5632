use chrono::Utc;
use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, print_json};
use crate::cleanup::{ArchiveReport, CleanupJob, SweepAction, SweepReport};

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Keep idle worktrees younger than this many days (default from config)
    #[arg(long)]
    pub retention_days: Option<u64>,
    /// Report what would be removed or archived without changing anything
    #[arg(long)]
    pub dry_run: bool,
    /// Skip relabelling finished tasks as archived
    #[arg(long)]
    pub no_archive: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct CleanupReport {
    sweep: SweepReport,
    archive: Option<ArchiveReport>,
}

impl CleanupArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let worktrees = session.worktrees()?;
        let job = CleanupJob::new(&session.store, &worktrees, &session.config);

        let retention = self
            .retention_days
            .unwrap_or(session.config.worktree.retention_days);
        let sweep = job.sweep_worktrees(retention, self.dry_run, Utc::now())?;
        let archive = if self.no_archive {
            None
        } else {
            Some(job.archive_completed(self.dry_run)?)
        };
        let report = CleanupReport { sweep, archive };

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }
}

fn print_pretty(report: &CleanupReport) {
    let sweep = &report.sweep;
    let verb = if sweep.dry_run { "would remove" } else { "removed" };
    println!("Worktrees (retention {} days):", sweep.retention_days);
    if sweep.items.is_empty() {
        println!("  none");
    }
    for item in &sweep.items {
        let age = item.age.as_deref().unwrap_or("unknown");
        let action = match item.action {
            SweepAction::Remove => verb,
            SweepAction::Keep => "keep",
        };
        println!("  #{:<5} {:<12} idle {:<8} {} ({})", item.task, action, age, item.path.display(), item.reason);
    }
    for e in &sweep.errors {
        println!("  failed {}: {}", e.item, e.error);
    }

    if let Some(archive) = &report.archive {
        let verb = if archive.dry_run { "Would archive" } else { "Archived" };
        if archive.archived.is_empty() {
            println!("\nNo finished tasks to archive.");
        } else {
            let numbers: Vec<String> = archive.archived.iter().map(|n| format!("#{n}")).collect();
            println!("\n{verb} {}", numbers.join(", "));
        }
        for e in &archive.errors {
            println!("  failed {}: {}", e.item, e.error);
        }
    }
}

fn print_text(report: &CleanupReport) {
    for item in &report.sweep.items {
        println!(
            "worktree  task={}  action={:?}  age={}  path={}  reason={}",
            item.task,
            item.action,
            item.age.as_deref().unwrap_or("unknown"),
            item.path.display(),
            item.reason
        );
    }
    if let Some(archive) = &report.archive {
        for number in &archive.archived {
            println!("archived  task={number}");
        }
    }
    let errors = report.sweep.errors.len() + report.archive.as_ref().map_or(0, |a| a.errors.len());
    println!(
        "summary  removed={}  archived={}  errors={errors}  dry_run={}",
        report.sweep.removed.len(),
        report.archive.as_ref().map_or(0, |a| a.archived.len()),
        report.sweep.dry_run
    );
}
