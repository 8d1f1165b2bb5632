//! CLI subcommands, one file each.

pub mod cleanup;
pub mod complete;
pub mod doctor;
pub mod dupes;
pub mod init;
pub mod labels;
pub mod monitor;
pub mod progress;
pub mod release;
pub mod schema;
pub mod start;
pub mod status;
pub mod task;
pub mod tasks;

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;

use crate::claims::ClaimManager;
use crate::config::Config;
use crate::error::ExitError;
use crate::labels::LabelScheme;
use crate::model::{AgentIdentity, Claim};
use crate::store::{GhStore, IssueStore};
use crate::worktree::{AgentWorktree, WorktreeManager, locate_repo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Explicit choice, else pretty on a terminal and text when piped.
    pub fn resolve(format: Option<Self>) -> Self {
        format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render markdown to the terminal.
pub fn print_markdown(text: &str) {
    termimad::print_text(text);
}

/// Everything a command needs: where it runs, the config, and the store.
pub struct Session {
    pub cwd: PathBuf,
    pub config: Config,
    pub store: GhStore,
    pub scheme: LabelScheme,
    repo: Option<(PathBuf, PathBuf)>,
}

/// The task a worktree command acts on.
#[derive(Debug, Clone)]
pub struct Target {
    pub task: u64,
    pub worktree: Option<AgentWorktree>,
}

impl Session {
    pub fn load() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("could not determine current directory")?;
        let repo = match locate_repo(&cwd) {
            Ok(repo) => Some(repo),
            Err(e) => {
                tracing::debug!(error = %e, "not in a git repository");
                None
            }
        };
        let root = repo.as_ref().map_or(cwd.as_path(), |(root, _)| root.as_path());
        let config = Config::discover(root)?;
        let store = GhStore::new(&config);
        let scheme = LabelScheme::new(&config.labels.prefix);
        Ok(Self {
            cwd,
            config,
            store,
            scheme,
            repo,
        })
    }

    /// Root of the main checkout, or the cwd outside a repository.
    pub fn root(&self) -> PathBuf {
        self.repo
            .as_ref()
            .map_or_else(|| self.cwd.clone(), |(root, _)| root.clone())
    }

    /// The configured assignee with `@me` resolved.
    pub fn login(&self) -> anyhow::Result<String> {
        let assignee = &self.config.github.assignee;
        if assignee == "@me" {
            self.store.current_login()
        } else {
            Ok(assignee.clone())
        }
    }

    pub fn claims(&self) -> anyhow::Result<ClaimManager<'_, GhStore>> {
        Ok(ClaimManager::new(&self.store, &self.config, &self.login()?))
    }

    pub fn worktrees(&self) -> anyhow::Result<WorktreeManager> {
        let (root, common_dir) = self.repo.as_ref().ok_or_else(|| {
            ExitError::Config(format!("{} is not inside a git repository", self.cwd.display()))
        })?;
        Ok(WorktreeManager::new(root, common_dir, &self.config))
    }

    /// `--task` if given, else the task of the worktree we are standing in.
    pub fn target(&self, task: Option<u64>) -> anyhow::Result<Target> {
        let worktrees = self.worktrees().ok();
        let here = match &worktrees {
            Some(w) => w.current(&self.cwd)?,
            None => None,
        };
        match task {
            Some(task) => {
                let worktree = match (here, &worktrees) {
                    (Some(wt), _) if wt.task == task => Some(wt),
                    (_, Some(w)) => w.agent_worktrees()?.into_iter().find(|wt| wt.task == task),
                    _ => None,
                };
                Ok(Target { task, worktree })
            }
            None => {
                let wt = here.ok_or(ExitError::NotInWorktree)?;
                Ok(Target {
                    task: wt.task,
                    worktree: Some(wt),
                })
            }
        }
    }
}

/// Who we act as on an existing claim.
///
/// `CONDUCTOR_AGENT_ID` wins. Otherwise a command run for the claim's own
/// role continues under the identity recorded in the claim marker.
pub fn acting_agent(target: &Target, claim: &Claim) -> AgentIdentity {
    let holder = AgentIdentity::parse(&claim.agent);
    let role = target
        .worktree
        .as_ref()
        .map(|wt| wt.role.clone())
        .or_else(|| holder.as_ref().map(|h| h.role.clone()))
        .unwrap_or_else(|| claim.agent.clone());
    if let Some(me) = AgentIdentity::from_env(&role) {
        return me;
    }
    match holder {
        Some(holder) if holder.role == role => holder,
        _ => AgentIdentity::new(&role, "operator"),
    }
}
