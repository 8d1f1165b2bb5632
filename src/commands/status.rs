use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use clap::Args;
use serde::Serialize;

use super::tasks::{TaskSummary, any_role};
use super::{OutputFormat, Session, print_json, print_markdown};
use crate::model::{ClaimState, Role, format_age};
use crate::monitor::HealthMonitor;
use crate::store::IssueStore;

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct ClaimSummary {
    pub task: u64,
    pub title: String,
    pub agent: String,
    pub idle: String,
    pub state: ClaimState,
}

#[derive(Debug, Serialize)]
pub struct WorktreeSummary {
    pub task: u64,
    pub role: String,
    pub path: PathBuf,
    pub claim: Option<ClaimSummary>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Set when run inside an agent worktree.
    pub current: Option<WorktreeSummary>,
    #[serde(skip)]
    pub current_body: Option<String>,
    pub worktrees: Vec<WorktreeSummary>,
    pub claimable: usize,
    pub next: Vec<TaskSummary>,
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let now = Utc::now();
        let timeout = session.config.heartbeat.timeout();

        let mut report = StatusReport {
            current: None,
            current_body: None,
            worktrees: Vec::new(),
            claimable: 0,
            next: Vec::new(),
        };

        let here = session.target(None).ok().and_then(|t| t.worktree);
        let role = match &here {
            Some(wt) => Role::resolve(&session.config, &wt.role).unwrap_or_else(|_| any_role()),
            None => any_role(),
        };

        if let Some(wt) = here {
            let claim = session.claims()?.current_claim(wt.task)?;
            report.current_body = Some(session.store.issue(wt.task)?.body);
            report.current = Some(WorktreeSummary {
                task: wt.task,
                role: wt.role,
                path: wt.path,
                claim: claim.map(|c| ClaimSummary {
                    task: c.task,
                    idle: format_age(c.idle(now)),
                    state: c.state(now, timeout),
                    title: c.title,
                    agent: c.agent,
                }),
            });
        } else if let Ok(worktrees) = session.worktrees() {
            let mut claims: BTreeMap<u64, ClaimSummary> = HealthMonitor::new(&session.store, &session.config)
                .claims()?
                .into_iter()
                .map(|c| {
                    let summary = ClaimSummary {
                        task: c.task,
                        idle: format_age(c.idle(now)),
                        state: c.state(now, timeout),
                        title: c.title,
                        agent: c.agent,
                    };
                    (summary.task, summary)
                })
                .collect();
            report.worktrees = worktrees
                .agent_worktrees()?
                .into_iter()
                .map(|wt| WorktreeSummary {
                    task: wt.task,
                    claim: claims.remove(&wt.task),
                    role: wt.role,
                    path: wt.path,
                })
                .collect();
        }

        let claimable: Vec<TaskSummary> = session
            .claims()?
            .list_claimable(&role)?
            .map(|t| TaskSummary::from(&t))
            .collect();
        report.claimable = claimable.len();
        report.next = claimable.into_iter().take(5).collect();

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }
}

fn print_pretty(report: &StatusReport) {
    println!("=== Conductor Status ===\n");
    if let Some(current) = &report.current {
        match &current.claim {
            Some(claim) => {
                println!("Working on #{} {}", claim.task, claim.title);
                println!("  agent      {}", claim.agent);
                println!("  heartbeat  {} ago ({})", claim.idle, claim.state.as_str());
            }
            None => println!("Worktree for #{} has no claim; run `conductor release` or `conductor start`", current.task),
        }
        println!("  worktree   {}", current.path.display());
        if let Some(body) = report.current_body.as_deref().filter(|b| !b.trim().is_empty()) {
            println!();
            print_markdown(body);
        }
    } else if report.worktrees.is_empty() {
        println!("No agent worktrees.");
    } else {
        println!("Agent worktrees:");
        for wt in &report.worktrees {
            match &wt.claim {
                Some(c) => println!("  #{:<5} {:<12} {:<20} {} ago ({})", wt.task, wt.role, c.agent, c.idle, c.state.as_str()),
                None => println!("  #{:<5} {:<12} unclaimed", wt.task, wt.role),
            }
        }
    }

    println!("\nClaimable tasks: {}", report.claimable);
    for task in &report.next {
        println!("  {}", task.line());
    }
    if report.claimable > report.next.len() {
        println!("  ... and {} more", report.claimable - report.next.len());
    }
}

fn print_text(report: &StatusReport) {
    println!("conductor-status");
    let current = report.current.iter();
    for wt in current.chain(report.worktrees.iter()) {
        match &wt.claim {
            Some(c) => println!(
                "worktree  task={}  role={}  agent={}  idle={}  state={}",
                wt.task,
                wt.role,
                c.agent,
                c.idle,
                c.state.as_str()
            ),
            None => println!("worktree  task={}  role={}  state=unclaimed", wt.task, wt.role),
        }
    }
    println!("claimable  count={}", report.claimable);
    for task in &report.next {
        println!("next  number={}  priority={}  title={}", task.number, task.priority, task.title);
    }
}
