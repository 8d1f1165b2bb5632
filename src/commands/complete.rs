use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, acting_agent, print_json};
use crate::error::ExitError;
use crate::store::{IssueStore, NewPullRequest, PullRequest};
use crate::template::render_pull_request;
use crate::worktree::branch_name;

#[derive(Debug, Args)]
pub struct CompleteArgs {
    /// Task number (defaults to the current worktree's task)
    #[arg(long)]
    pub task: Option<u64>,
    /// Skip the clean/pushed checks and discard local changes
    #[arg(long)]
    pub force: bool,
    /// Do not open or link a pull request
    #[arg(long)]
    pub no_pr: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct CompleteReport {
    task: u64,
    agent: String,
    pull_request: Option<PullRequest>,
    closed: bool,
    removed_worktree: Option<String>,
}

impl CompleteArgs {
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
        claims.held_by(target.task, &agent)?;

        let worktrees = session.worktrees().ok();
        let branch = target
            .worktree
            .as_ref()
            .map_or_else(|| branch_name(&agent.role, target.task), |wt| wt.branch.clone());

        let mut pushed = false;
        if let (Some(wt), Some(manager)) = (&target.worktree, &worktrees) {
            pushed = manager.is_pushed(&wt.path, &branch)?;
            if !self.force {
                if manager.is_dirty(&wt.path)? {
                    return Err(ExitError::DirtyWorktree {
                        path: wt.path.display().to_string(),
                    }
                    .into());
                }
                if !pushed {
                    return Err(ExitError::Other(format!(
                        "branch {branch} has commits that are not on {}; run `git push -u {} {branch}`",
                        session.config.worktree.remote, session.config.worktree.remote
                    ))
                    .into());
                }
            }
        }

        let pull_request = if self.no_pr {
            None
        } else {
            Some(self.open_pull_request(&session, target.task, &claim.title, &agent.id(), &branch)?)
        };

        let close = session.config.complete.close_issue;
        claims.complete(target.task, &agent, pull_request.as_ref(), close)?;

        let mut removed_worktree = None;
        if let (Some(wt), Some(manager)) = (&target.worktree, &worktrees) {
            manager.remove(&wt.path, self.force)?;
            // Unpushed work only survives on the local branch.
            if pushed {
                manager.delete_branch(&wt.branch)?;
            }
            removed_worktree = Some(wt.path.display().to_string());
        }

        let report = CompleteReport {
            task: target.task,
            agent: agent.id(),
            pull_request,
            closed: close,
            removed_worktree,
        };
        match format {
            OutputFormat::Pretty => {
                println!("Completed #{} as {}", report.task, report.agent);
                if let Some(pr) = &report.pull_request {
                    println!("  pull request  {}", pr.url);
                }
                if let Some(path) = &report.removed_worktree {
                    println!("  removed       {path}");
                    println!("\ncd {}", session.root().display());
                }
            }
            OutputFormat::Text => {
                let pr = report.pull_request.as_ref().map_or("-", |pr| pr.url.as_str());
                println!("completed  task={}  agent={}  pr={pr}  closed={}", report.task, report.agent, report.closed);
            }
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }

    fn open_pull_request(
        &self,
        session: &Session,
        task: u64,
        title: &str,
        agent: &str,
        branch: &str,
    ) -> anyhow::Result<PullRequest> {
        if let Some(existing) = session.store.find_pull_request(branch)? {
            tracing::info!(task, pr = existing.number, "reusing pull request");
            return Ok(existing);
        }
        let label = &session.config.complete.pr_label;
        let pr = session.store.create_pull_request(&NewPullRequest {
            head: branch.to_string(),
            base: session.config.worktree.base_branch.clone(),
            title: title.to_string(),
            body: render_pull_request(task, title, agent, branch)?,
            labels: if label.is_empty() { Vec::new() } else { vec![label.clone()] },
        })?;
        tracing::info!(task, pr = pr.number, "opened pull request");
        Ok(pr)
    }
}
