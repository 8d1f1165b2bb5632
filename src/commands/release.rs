use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, acting_agent, print_json};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct ReleaseArgs {
    /// Task number (defaults to the current worktree's task)
    #[arg(long)]
    pub task: Option<u64>,
    /// Remove the worktree and branch even with local changes
    #[arg(long)]
    pub force: bool,
    /// Why the task is being given back
    #[arg(short, long)]
    pub message: Option<String>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct ReleaseReport {
    task: u64,
    agent: String,
    removed_worktree: Option<String>,
    kept_branch: Option<String>,
}

impl ReleaseArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let target = session.target(self.task)?;
        let claims = session.claims()?;
        let claim = claims.current_claim(target.task)?.ok_or_else(|| ExitError::NoClaim {
            task: target.task,
            reason: "no assignee".into(),
        })?;
        let agent = acting_agent(&target, &claim);
        let worktrees = session.worktrees().ok();

        // Refuse before touching the claim so a dirty tree leaves nothing half done.
        let mut pushed = false;
        if let (Some(wt), Some(manager)) = (&target.worktree, &worktrees) {
            if !self.force && manager.is_dirty(&wt.path)? {
                return Err(ExitError::DirtyWorktree {
                    path: wt.path.display().to_string(),
                }
                .into());
            }
            pushed = manager.is_pushed(&wt.path, &wt.branch)?;
        }

        claims.release(target.task, &agent, self.message.as_deref())?;

        let mut report = ReleaseReport {
            task: target.task,
            agent: agent.id(),
            removed_worktree: None,
            kept_branch: None,
        };
        if let (Some(wt), Some(manager)) = (&target.worktree, &worktrees) {
            manager.remove(&wt.path, self.force)?;
            report.removed_worktree = Some(wt.path.display().to_string());
            if self.force || pushed {
                manager.delete_branch(&wt.branch)?;
            } else {
                report.kept_branch = Some(wt.branch.clone());
            }
        }

        match format {
            OutputFormat::Pretty => {
                println!("Released #{} ({})", report.task, report.agent);
                if let Some(path) = &report.removed_worktree {
                    println!("  removed  {path}");
                }
                if let Some(branch) = &report.kept_branch {
                    println!("  kept branch {branch}: it has unpushed commits (delete with `git branch -D {branch}`)");
                }
            }
            OutputFormat::Text => println!("released  task={}  agent={}", report.task, report.agent),
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }
}
