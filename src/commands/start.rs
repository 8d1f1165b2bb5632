use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, print_json};
use crate::claims::ClaimOutcome;
use crate::config::Config;
use crate::error::ExitError;
use crate::model::{AgentIdentity, Role, Task};
use crate::store::IssueStore;
use crate::template::TaskContext;
use crate::worktree::branch_name;

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Role to work as (falls back to CONDUCTOR_ROLE, then a prompt)
    pub role: Option<String>,
    /// Claim this task instead of the top-ranked one
    #[arg(long)]
    pub task: Option<u64>,
    /// Branch from local refs without fetching first
    #[arg(long)]
    pub no_fetch: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct StartReport {
    pub task: u64,
    pub title: String,
    pub role: String,
    pub agent: String,
    pub branch: String,
    pub base: String,
    pub path: PathBuf,
    pub context_file: PathBuf,
}

impl StartArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let role = self.resolve_role(&session.config)?;
        let worktrees = session.worktrees()?;
        let claims = session.claims()?;
        let agent = AgentIdentity::for_role(&role);

        let (task, claim) = match self.task {
            Some(number) => {
                let issue = session.store.issue(number)?;
                let task = Task::from_issue(&issue, &session.scheme);
                if !task.labels.is_task {
                    return Err(ExitError::Other(format!(
                        "#{number} is not labelled {}",
                        session.scheme.task()
                    ))
                    .into());
                }
                let branch = branch_name(&role.name, number);
                match claims.claim(number, &agent, Some(&branch))? {
                    ClaimOutcome::Claimed(claim) => (task, claim),
                    ClaimOutcome::Conflict { task, holder } => {
                        tracing::info!(task, %holder, "task is held by another agent");
                        return Err(ExitError::ClaimConflict { task }.into());
                    }
                }
            }
            None => claims.claim_next(
                &role,
                &agent,
                |n| branch_name(&role.name, n),
                |n| worktrees.collides(&role.name, n),
            )?,
        };

        let (worktree, base) = match worktrees.create(&role.name, task.number, !self.no_fetch) {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(task = task.number, error = %e, "worktree creation failed, releasing claim");
                if let Err(release) = claims.release(task.number, &agent, Some("worktree creation failed")) {
                    tracing::warn!(task = task.number, error = %release, "could not release claim");
                }
                return Err(e);
            }
        };

        let context = TaskContext {
            task: task.number,
            title: task.title.clone(),
            body: task.body.clone(),
            role: role.name.clone(),
            agent: agent.id(),
            branch: worktree.branch.clone(),
            base: base.clone(),
            started_at: claim
                .claimed_at
                .unwrap_or_else(Utc::now)
                .format("%Y-%m-%d %H:%M UTC")
                .to_string(),
        };
        let context_file = worktrees.write_context(&worktree, &context)?;

        let report = StartReport {
            task: task.number,
            title: task.title,
            role: role.name,
            agent: agent.id(),
            branch: worktree.branch,
            base,
            path: worktree.path,
            context_file,
        };
        match format {
            OutputFormat::Pretty => {
                println!("Claimed #{} {} as {}", report.task, report.title, report.agent);
                println!("  branch   {} (from {})", report.branch, report.base);
                println!("  context  {}", report.context_file.display());
                println!("\ncd {}", report.path.display());
            }
            // Scripts do `cd "$(conductor start dev)"`.
            OutputFormat::Text => println!("{}", report.path.display()),
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }

    fn resolve_role(&self, config: &Config) -> anyhow::Result<Role> {
        let given = self
            .role
            .clone()
            .or_else(|| std::env::var("CONDUCTOR_ROLE").ok().filter(|r| !r.trim().is_empty()));
        let input = match given {
            Some(role) => role,
            None if std::io::stdin().is_terminal() => prompt_role(config)?,
            None => {
                return Err(ExitError::Config("no role given; pass ROLE or set CONDUCTOR_ROLE".into()).into());
            }
        };
        Ok(Role::resolve(config, &input)?)
    }
}

fn prompt_role(config: &Config) -> anyhow::Result<String> {
    let names: Vec<&str> = config.roles.keys().map(String::as_str).collect();
    let picked = dialoguer::Select::new()
        .with_prompt("Role")
        .items(&names)
        .default(0)
        .interact()
        .context("reading role selection")?;
    names
        .get(picked)
        .map(|name| (*name).to_string())
        .ok_or_else(|| ExitError::Config("no role selected".into()).into())
}
