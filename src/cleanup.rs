//! Cleanup / Archival Job.
//!
//! Both passes are best-effort batches: a failure on one worktree or issue
//! is logged, recorded in the report and skipped.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Config, days};
use crate::labels::{LabelScheme, TaskLabels};
use crate::model::{ClaimState, format_age};
use crate::monitor::HealthMonitor;
use crate::store::{IssueQuery, IssueStore, PrState, StateFilter};
use crate::worktree::{AgentWorktree, WorktreeManager, last_activity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepAction {
    Remove,
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepItem {
    pub task: u64,
    pub path: PathBuf,
    pub branch: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub age: Option<String>,
    pub claim: Option<ClaimState>,
    pub action: SweepAction,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub retention_days: u64,
    pub items: Vec<SweepItem>,
    pub removed: Vec<PathBuf>,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub dry_run: bool,
    pub archived: Vec<u64>,
    pub errors: Vec<ItemError>,
}

/// Decide what happens to each worktree.
///
/// A worktree goes when its task has no active claim and it has been idle
/// for strictly longer than the retention window. Unknown activity counts
/// as idle forever.
pub fn plan_sweep(
    worktrees: &[(AgentWorktree, Option<DateTime<Utc>>)],
    claims: &BTreeMap<u64, ClaimState>,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<SweepItem> {
    worktrees
        .iter()
        .map(|(wt, activity)| {
            let claim = claims.get(&wt.task).copied();
            let age = activity.map(|at| now - at);
            let (action, reason) = if claim == Some(ClaimState::Active) {
                (SweepAction::Keep, "claim is active".to_string())
            } else if age.is_some_and(|age| age <= retention) {
                (SweepAction::Keep, "within retention window".to_string())
            } else if claim.is_some() {
                (SweepAction::Remove, "claim is stale".to_string())
            } else {
                (SweepAction::Remove, "no claim".to_string())
            };
            SweepItem {
                task: wt.task,
                path: wt.path.clone(),
                branch: wt.branch.clone(),
                last_activity: *activity,
                age: age.map(format_age),
                claim,
                action,
                reason,
            }
        })
        .collect()
}

pub struct CleanupJob<'a, S: IssueStore + ?Sized> {
    store: &'a S,
    worktrees: &'a WorktreeManager,
    config: &'a Config,
    scheme: LabelScheme,
}

impl<'a, S: IssueStore + ?Sized> CleanupJob<'a, S> {
    pub fn new(store: &'a S, worktrees: &'a WorktreeManager, config: &'a Config) -> Self {
        Self {
            store,
            worktrees,
            config,
            scheme: LabelScheme::new(&config.labels.prefix),
        }
    }

    /// Remove agent worktrees (and their branches) that outlived their claim.
    pub fn sweep_worktrees(&self, retention_days: u64, dry_run: bool, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        if !dry_run {
            if let Err(e) = self.worktrees.prune() {
                tracing::warn!(error = %e, "git worktree prune failed");
            }
        }

        let found = self.worktrees.agent_worktrees()?;
        let timeout = self.config.heartbeat.timeout();
        let claims: BTreeMap<u64, ClaimState> = HealthMonitor::new(self.store, self.config)
            .claims()?
            .iter()
            .map(|c| (c.task, c.state(now, timeout)))
            .collect();

        let with_activity: Vec<_> = found
            .into_iter()
            .map(|wt| {
                let at = last_activity(&wt.path);
                (wt, at)
            })
            .collect();
        let items = plan_sweep(&with_activity, &claims, days(retention_days), now);

        let mut report = SweepReport {
            dry_run,
            retention_days,
            items,
            removed: Vec::new(),
            errors: Vec::new(),
        };
        if dry_run {
            return Ok(report);
        }

        for item in report.items.iter().filter(|i| i.action == SweepAction::Remove) {
            let result = self
                .worktrees
                .remove(&item.path, true)
                .and_then(|()| self.worktrees.delete_branch(&item.branch));
            match result {
                Ok(()) => {
                    tracing::info!(path = %item.path.display(), reason = %item.reason, "swept worktree");
                    report.removed.push(item.path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %item.path.display(), error = %e, "failed to sweep worktree");
                    report.errors.push(ItemError {
                        item: item.path.display().to_string(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Relabel closed tasks whose linked pull requests are all merged or closed.
    pub fn archive_completed(&self, dry_run: bool) -> anyhow::Result<ArchiveReport> {
        let closed = self
            .store
            .list_issues(&IssueQuery::labelled(&self.scheme.task()).state(StateFilter::Closed))?;
        let mut report = ArchiveReport {
            dry_run,
            archived: Vec::new(),
            errors: Vec::new(),
        };

        for issue in &closed {
            if TaskLabels::parse(&self.scheme, &issue.labels).archived {
                continue;
            }
            let result = self.archive_one(issue.number, dry_run);
            match result {
                Ok(true) => report.archived.push(issue.number),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(task = issue.number, error = %e, "failed to archive task");
                    report.errors.push(ItemError {
                        item: format!("#{}", issue.number),
                        error: format!("{e:#}"),
                    });
                }
            }
        }
        Ok(report)
    }

    fn archive_one(&self, task: u64, dry_run: bool) -> anyhow::Result<bool> {
        let prs = self.store.linked_pull_requests(task)?;
        let finished = !prs.is_empty() && prs.iter().all(|pr| pr.state != PrState::Open);
        if !finished {
            return Ok(false);
        }
        if !dry_run {
            self.store.add_labels(task, &[self.scheme.archived()])?;
            self.store
                .remove_labels(task, &[self.scheme.task(), self.scheme.in_progress()])?;
            tracing::info!(task, "archived task");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IssueState, MemoryStore};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn wt(task: u64) -> AgentWorktree {
        AgentWorktree {
            role: "dev".into(),
            task,
            path: PathBuf::from(format!("/repo/worktrees/agent-dev-{task}")),
            branch: format!("agent-dev-{task}"),
        }
    }

    #[test]
    fn retention_boundary_keeps_exact_age() {
        let retention = chrono::Duration::days(7);
        let worktrees = vec![
            (wt(1), Some(now() - retention)),
            (wt(2), Some(now() - retention - chrono::Duration::seconds(1))),
        ];
        let plan = plan_sweep(&worktrees, &BTreeMap::new(), retention, now());
        assert_eq!(plan[0].action, SweepAction::Keep);
        assert_eq!(plan[1].action, SweepAction::Remove);
    }

    #[test]
    fn active_claim_is_never_swept() {
        let retention = chrono::Duration::days(7);
        let worktrees = vec![(wt(1), Some(now() - chrono::Duration::days(30)))];
        let claims = BTreeMap::from([(1, ClaimState::Active)]);
        let plan = plan_sweep(&worktrees, &claims, retention, now());
        assert_eq!(plan[0].action, SweepAction::Keep);

        let claims = BTreeMap::from([(1, ClaimState::Stale)]);
        let plan = plan_sweep(&worktrees, &claims, retention, now());
        assert_eq!(plan[0].action, SweepAction::Remove);
        assert_eq!(plan[0].reason, "claim is stale");
    }

    #[test]
    fn missing_activity_counts_as_idle() {
        let plan = plan_sweep(&[(wt(3), None)], &BTreeMap::new(), chrono::Duration::days(7), now());
        assert_eq!(plan[0].action, SweepAction::Remove);
        assert!(plan[0].age.is_none());
    }

    fn archive_fixture() -> (MemoryStore, u64, u64, u64) {
        let store = MemoryStore::new("bot");
        let merged = store.seed("Merged work", &["conductor:task"]);
        let open_pr = store.seed("Still in review", &["conductor:task"]);
        let no_pr = store.seed("Closed by hand", &["conductor:task"]);
        for n in [merged, open_pr, no_pr] {
            store.set_state(n, IssueState::Closed);
        }
        store.seed_pull_request(&format!("agent-dev-{merged}"), "", PrState::Merged);
        store.seed_pull_request("feature", &format!("Closes #{open_pr}"), PrState::Open);
        (store, merged, open_pr, no_pr)
    }

    #[test]
    fn archives_only_finished_tasks() {
        let (store, merged, open_pr, no_pr) = archive_fixture();
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let worktrees = WorktreeManager::new(dir.path(), &dir.path().join(".git"), &config);
        let job = CleanupJob::new(&store, &worktrees, &config);

        let report = job.archive_completed(false).unwrap();
        assert_eq!(report.archived, vec![merged]);

        let labels = store.snapshot(merged).unwrap().labels;
        assert!(labels.contains(&"conductor:archived".to_string()));
        assert!(!labels.contains(&"conductor:task".to_string()));
        assert!(store.snapshot(open_pr).unwrap().labels.contains(&"conductor:task".to_string()));
        assert!(store.snapshot(no_pr).unwrap().labels.contains(&"conductor:task".to_string()));

        // Archived tasks drop out of the next pass
        assert!(job.archive_completed(false).unwrap().archived.is_empty());
    }

    #[test]
    fn archive_dry_run_changes_nothing() {
        let (store, merged, _, _) = archive_fixture();
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let worktrees = WorktreeManager::new(dir.path(), &dir.path().join(".git"), &config);
        let job = CleanupJob::new(&store, &worktrees, &config);

        assert_eq!(job.archive_completed(true).unwrap().archived, vec![merged]);
        assert!(store.snapshot(merged).unwrap().labels.contains(&"conductor:task".to_string()));
    }
}
