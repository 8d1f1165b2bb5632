//! Task Claim Manager.
//!
//! The store's single assignment call is the only lock. Agents that share a
//! GitHub login cannot be told apart by assignment, so after assigning we
//! also check that our claim marker is the earliest one in the current
//! window.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::activity::{self, Marker, MarkerKind};
use crate::config::Config;
use crate::error::{ExitError, is_transient};
use crate::labels::LabelScheme;
use crate::model::{AgentIdentity, Claim, Role, Task, format_age, rank};
use crate::store::{AssigneeFilter, Assignment, IssueQuery, IssueState, IssueStore, PullRequest};
use crate::template::{CommentDetails, render_comment};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ClaimOutcome {
    Claimed(Claim),
    /// Someone else holds the task. Nothing of theirs was touched.
    Conflict { task: u64, holder: String },
}

pub struct ClaimManager<'a, S: IssueStore + ?Sized> {
    store: &'a S,
    scheme: LabelScheme,
    login: String,
    max_attempts: u32,
}

impl<'a, S: IssueStore + ?Sized> ClaimManager<'a, S> {
    pub fn new(store: &'a S, config: &Config, login: &str) -> Self {
        Self {
            store,
            scheme: LabelScheme::new(&config.labels.prefix),
            login: login.to_string(),
            max_attempts: config.claim.max_attempts,
        }
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    /// Claimable tasks for `role` in claim order.
    pub fn list_claimable(&self, role: &Role) -> anyhow::Result<std::vec::IntoIter<Task>> {
        let query = IssueQuery::labelled(&self.scheme.task()).assignee(AssigneeFilter::Unassigned);
        let mut tasks: Vec<Task> = self
            .store
            .list_issues(&query)?
            .iter()
            .map(|issue| Task::from_issue(issue, &self.scheme))
            .filter(|task| task.is_claimable() && role.matches(task))
            .collect();
        rank(&mut tasks);
        Ok(tasks.into_iter())
    }

    /// Try to claim one task for `agent`.
    pub fn claim(&self, task: u64, agent: &AgentIdentity, branch: Option<&str>) -> anyhow::Result<ClaimOutcome> {
        let issue = self.store.issue(task)?;
        if issue.state != IssueState::Open {
            return Err(ExitError::Other(format!("task #{task} is closed")).into());
        }
        let others: Vec<&String> = issue.assignees.iter().filter(|a| **a != self.login).collect();
        if !others.is_empty() {
            return Ok(self.conflict(task, others.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")));
        }

        // Only undo an assignment this call made, never one a same-login agent holds.
        let newly_assigned = issue.assignees.is_empty();
        match self.store.assign(task, &self.login)? {
            Assignment::Assigned => {}
            Assignment::AlreadyAssigned { assignees } => {
                return Ok(self.conflict(task, assignees.join(",")));
            }
        }

        if let Err(e) = self.mark_claimed(task, agent, branch) {
            if newly_assigned {
                self.roll_back(task, None);
            }
            return Err(e);
        }
        match self.confirm_claim(task, agent) {
            Err(e) if newly_assigned => {
                self.roll_back(task, Some(agent));
                Err(e)
            }
            result => result,
        }
    }

    fn mark_claimed(&self, task: u64, agent: &AgentIdentity, branch: Option<&str>) -> anyhow::Result<()> {
        self.store.add_labels(task, &[self.scheme.in_progress()])?;
        let marker = Marker::new(MarkerKind::Claim, &agent.id());
        let body = render_comment(
            &marker,
            &CommentDetails {
                branch,
                ..CommentDetails::default()
            },
        )?;
        self.store.comment(task, &body)
    }

    fn confirm_claim(&self, task: u64, agent: &AgentIdentity) -> anyhow::Result<ClaimOutcome> {
        // Another agent on the same login may have claimed first.
        let comments = self.store.comments(task)?;
        let events = activity::events(&comments);
        let me = agent.id();
        match activity::holder(&events) {
            Some(holder) if holder != me => return Ok(self.conflict(task, holder.to_string())),
            _ => {}
        }

        let issue = self.store.issue(task)?;
        let assigned_at = self.store.assigned_at(task)?;
        let claim = activity::reconstruct(&issue, &comments, assigned_at).ok_or_else(|| ExitError::NoClaim {
            task,
            reason: "assignment disappeared right after claiming".into(),
        })?;
        tracing::info!(task, agent = %agent, "claimed task");
        Ok(ClaimOutcome::Claimed(claim))
    }

    /// Best-effort undo of a half-finished claim. `posted_by` is set once the
    /// claim marker is on the issue.
    fn roll_back(&self, task: u64, posted_by: Option<&AgentIdentity>) {
        if let Some(agent) = posted_by {
            let marker = Marker::new(MarkerKind::Release, &agent.id()).with_reason("claim-failed");
            let posted = render_comment(&marker, &CommentDetails::default())
                .and_then(|body| self.store.comment(task, &body));
            if let Err(e) = posted {
                tracing::warn!(task, error = %e, "could not post release marker for failed claim");
            }
        }
        if let Err(e) = self.store.remove_labels(task, &[self.scheme.in_progress()]) {
            tracing::warn!(task, error = %e, "could not drop in-progress label for failed claim");
        }
        if let Err(e) = self.store.unassign(task, &[self.login.clone()]) {
            tracing::warn!(task, error = %e, "could not unassign failed claim");
        } else {
            tracing::info!(task, "rolled back failed claim");
        }
    }

    fn conflict(&self, task: u64, holder: String) -> ClaimOutcome {
        tracing::info!(task, %holder, "claim conflict");
        ClaimOutcome::Conflict { task, holder }
    }

    /// Walk the claimable list until one claim sticks.
    ///
    /// Conflicts count against the attempt cap; a task whose calls keep
    /// failing transiently is skipped in favour of the next one. Tasks for
    /// which `blocked` returns true (leftover worktree or branch) are never
    /// claimed.
    pub fn claim_next(
        &self,
        role: &Role,
        agent: &AgentIdentity,
        branch_for: impl Fn(u64) -> String,
        blocked: impl Fn(u64) -> bool,
    ) -> anyhow::Result<(Task, Claim)> {
        let mut conflicts = 0;
        let mut last_conflict = None;
        let mut last_transient = None;
        let mut skipped = Vec::new();

        for task in self.list_claimable(role)? {
            if blocked(task.number) {
                tracing::info!(task = task.number, "skipping task with a leftover worktree or branch");
                skipped.push(task.number);
                continue;
            }
            let branch = branch_for(task.number);
            match self.claim(task.number, agent, Some(&branch)) {
                Ok(ClaimOutcome::Claimed(claim)) => return Ok((task, claim)),
                Ok(ClaimOutcome::Conflict { task, .. }) => {
                    conflicts += 1;
                    last_conflict = Some(task);
                    if conflicts >= self.max_attempts {
                        break;
                    }
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(task = task.number, error = %e, "giving up on task after transient failures");
                    last_transient = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(task) = last_conflict {
            return Err(ExitError::ClaimConflict { task }.into());
        }
        if let Some(e) = last_transient {
            return Err(e);
        }
        if !skipped.is_empty() {
            tracing::warn!(?skipped, "claimable tasks skipped for leftover worktrees; run `conductor cleanup`");
        }
        Err(ExitError::NoTasks {
            role: role.name.clone(),
        }
        .into())
    }

    /// Rebuild the claim on `task` from the store.
    pub fn current_claim(&self, task: u64) -> anyhow::Result<Option<Claim>> {
        let issue = self.store.issue(task)?;
        if issue.state != IssueState::Open {
            return Ok(None);
        }
        let comments = self.store.comments(task)?;
        let assigned_at = self.store.assigned_at(task)?;
        Ok(activity::reconstruct(&issue, &comments, assigned_at))
    }

    /// The claim on `task`, which must be held by `agent`.
    pub fn held_by(&self, task: u64, agent: &AgentIdentity) -> anyhow::Result<Claim> {
        let claim = self.current_claim(task)?.ok_or_else(|| ExitError::NoClaim {
            task,
            reason: "no assignee".into(),
        })?;
        let me = agent.id();
        if claim.agent != me && claim.agent != self.login {
            return Err(ExitError::NoClaim {
                task,
                reason: format!("held by {}", claim.agent),
            }
            .into());
        }
        Ok(claim)
    }

    /// Post a heartbeat for a claim `agent` holds.
    pub fn heartbeat(&self, task: u64, agent: &AgentIdentity, message: Option<&str>) -> anyhow::Result<Claim> {
        self.held_by(task, agent)?;
        let marker = Marker::new(MarkerKind::Heartbeat, &agent.id());
        let body = render_comment(
            &marker,
            &CommentDetails {
                message,
                ..CommentDetails::default()
            },
        )?;
        self.store.comment(task, &body)?;
        tracing::info!(task, agent = %agent, "heartbeat");
        self.held_by(task, agent)
    }

    /// Give a held task back to the pool.
    pub fn release(&self, task: u64, agent: &AgentIdentity, message: Option<&str>) -> anyhow::Result<()> {
        let claim = self.held_by(task, agent)?;
        let marker = Marker::new(MarkerKind::Release, &agent.id()).with_reason("released");
        let body = render_comment(
            &marker,
            &CommentDetails {
                message,
                ..CommentDetails::default()
            },
        )?;
        self.store.comment(task, &body)?;
        self.store.unassign(task, &claim.assignees)?;
        self.store.remove_labels(task, &[self.scheme.in_progress()])?;
        tracing::info!(task, agent = %agent, "released task");
        Ok(())
    }

    /// Mark a held task done: completion marker, unassign, drop in-progress,
    /// optionally close.
    pub fn complete(
        &self,
        task: u64,
        agent: &AgentIdentity,
        pr: Option<&PullRequest>,
        close: bool,
    ) -> anyhow::Result<()> {
        let claim = self.held_by(task, agent)?;
        let marker = Marker::new(MarkerKind::Complete, &agent.id());
        let body = render_comment(
            &marker,
            &CommentDetails {
                pr_url: pr.map(|p| p.url.as_str()),
                ..CommentDetails::default()
            },
        )?;
        self.store.comment(task, &body)?;
        self.store.remove_labels(task, &[self.scheme.in_progress()])?;
        self.store.unassign(task, &claim.assignees)?;
        if close {
            self.store.close_issue(task)?;
        }
        tracing::info!(task, agent = %agent, "completed task");
        Ok(())
    }
}

/// Clear a stale claim: release marker, unassign everyone, drop in-progress.
pub fn reclaim<S: IssueStore + ?Sized>(
    store: &S,
    scheme: &LabelScheme,
    claim: &Claim,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let marker = Marker::new(MarkerKind::Release, &claim.agent).with_reason("stale");
    let body = render_comment(
        &marker,
        &CommentDetails {
            idle: Some(format_age(claim.idle(now))),
            ..CommentDetails::default()
        },
    )?;
    store.comment(claim.task, &body)?;
    store.unassign(claim.task, &claim.assignees)?;
    store.remove_labels(claim.task, &[scheme.in_progress()])?;
    tracing::info!(task = claim.task, agent = %claim.agent, "reclaimed stale task");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn setup() -> (MemoryStore, Config) {
        (MemoryStore::new("bot"), Config::default())
    }

    fn role(config: &Config, name: &str) -> Role {
        Role::resolve(config, name).unwrap()
    }

    #[test]
    fn claim_assigns_labels_and_marks() {
        let (store, config) = setup();
        let n = store.seed("Add dark mode", &["conductor:task"]);
        let mgr = ClaimManager::new(&store, &config, "bot");
        let agent = AgentIdentity::new("frontend", "aaaaaa");

        let outcome = mgr.claim(n, &agent, Some("agent-frontend-1")).unwrap();
        let ClaimOutcome::Claimed(claim) = outcome else {
            panic!("expected claim, got {outcome:?}");
        };
        assert_eq!(claim.agent, "frontend-aaaaaa");
        let issue = store.snapshot(n).unwrap();
        assert_eq!(issue.assignees, vec!["bot"]);
        assert!(issue.labels.contains(&"conductor:in-progress".to_string()));
    }

    #[test]
    fn exactly_one_concurrent_claim_wins() {
        let (store, config) = setup();
        let n = store.seed("Add dark mode", &["conductor:task"]);

        let wins: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = &store;
                    let config = &config;
                    s.spawn(move || {
                        let login = format!("agent{i}");
                        let mgr = ClaimManager::new(store, config, &login);
                        let agent = AgentIdentity::new("dev", &format!("{i:06}"));
                        matches!(mgr.claim(n, &agent, None).unwrap(), ClaimOutcome::Claimed(_))
                    })
                })
                .collect();
            handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum()
        });
        assert_eq!(wins, 1);
        assert_eq!(store.snapshot(n).unwrap().assignees.len(), 1);
    }

    #[test]
    fn shared_login_second_claimer_loses() {
        let (store, config) = setup();
        let n = store.seed("Add dark mode", &["conductor:task"]);
        let mgr = ClaimManager::new(&store, &config, "bot");
        let a = AgentIdentity::new("frontend", "aaaaaa");
        let b = AgentIdentity::new("frontend", "bbbbbb");

        assert!(matches!(mgr.claim(n, &a, None).unwrap(), ClaimOutcome::Claimed(_)));
        assert_eq!(
            mgr.claim(n, &b, None).unwrap(),
            ClaimOutcome::Conflict {
                task: n,
                holder: "frontend-aaaaaa".into()
            }
        );
        // A still holds it
        assert_eq!(mgr.current_claim(n).unwrap().unwrap().agent, "frontend-aaaaaa");
        assert_eq!(store.snapshot(n).unwrap().assignees, vec!["bot"]);
    }

    #[test]
    fn claimed_task_drops_out_of_listing() {
        let (store, config) = setup();
        let first = store.seed("one", &["conductor:task"]);
        let second = store.seed("two", &["conductor:task"]);
        let dev = role(&config, "dev");
        let winner = ClaimManager::new(&store, &config, "alice");
        let loser = ClaimManager::new(&store, &config, "bob");

        winner.claim(first, &AgentIdentity::new("dev", "aaaaaa"), None).unwrap();
        let outcome = loser.claim(first, &AgentIdentity::new("dev", "bbbbbb"), None).unwrap();
        assert!(matches!(outcome, ClaimOutcome::Conflict { .. }));

        let listed: Vec<u64> = loser.list_claimable(&dev).unwrap().map(|t| t.number).collect();
        assert_eq!(listed, vec![second]);
    }

    #[test]
    fn two_agents_starting_get_different_tasks() {
        let (store, config) = setup();
        let t42 = store.seed("Add dark mode", &["conductor:task", "skill:frontend"]);
        let t43 = store.seed("Fix navbar", &["conductor:task", "skill:ui"]);
        let frontend = role(&config, "frontend");

        let a = ClaimManager::new(&store, &config, "alice");
        let b = ClaimManager::new(&store, &config, "bob");
        let (task_a, _) = a
            .claim_next(&frontend, &AgentIdentity::new("frontend", "aaaaaa"), |n| format!("agent-frontend-{n}"), |_| false)
            .unwrap();
        let (task_b, _) = b
            .claim_next(&frontend, &AgentIdentity::new("frontend", "bbbbbb"), |n| format!("agent-frontend-{n}"), |_| false)
            .unwrap();
        assert_eq!(task_a.number, t42);
        assert_eq!(task_b.number, t43);

        let err = b
            .claim_next(&frontend, &AgentIdentity::new("frontend", "cccccc"), |n| format!("agent-frontend-{n}"), |_| false)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::NoTasks { .. })));
    }

    #[test]
    fn failed_claim_gives_the_task_back() {
        let (store, config) = setup();
        let first = store.seed("one", &["conductor:task"]);
        let second = store.seed("two", &["conductor:task"]);
        store.fail_labels_on(first);
        let dev = role(&config, "dev");
        let mgr = ClaimManager::new(&store, &config, "bot");

        let (task, _) = mgr
            .claim_next(&dev, &AgentIdentity::new("dev", "aaaaaa"), |n| format!("agent-dev-{n}"), |_| false)
            .unwrap();
        assert_eq!(task.number, second);

        let issue = store.snapshot(first).unwrap();
        assert!(issue.assignees.is_empty());
        assert!(!issue.labels.contains(&"conductor:in-progress".to_string()));
        assert!(store.comments(first).unwrap().is_empty());

        let other = ClaimManager::new(&store, &config, "alice");
        let listed: Vec<u64> = other.list_claimable(&dev).unwrap().map(|t| t.number).collect();
        assert_eq!(listed, vec![first]);
    }

    #[test]
    fn claim_next_skips_blocked_tasks() {
        let (store, config) = setup();
        let leftover = store.seed("one", &["conductor:task"]);
        let fresh = store.seed("two", &["conductor:task"]);
        let dev = role(&config, "dev");
        let mgr = ClaimManager::new(&store, &config, "bot");
        let agent = AgentIdentity::new("dev", "aaaaaa");

        let (task, _) = mgr
            .claim_next(&dev, &agent, |n| format!("agent-dev-{n}"), |n| n == leftover)
            .unwrap();
        assert_eq!(task.number, fresh);
        assert!(store.snapshot(leftover).unwrap().assignees.is_empty());

        let err = mgr
            .claim_next(&dev, &agent, |n| format!("agent-dev-{n}"), |n| n == leftover)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::NoTasks { .. })));
    }

    #[test]
    fn role_filter_skips_other_specialities() {
        let (store, config) = setup();
        store.seed("Terraform state", &["conductor:task", "skill:devops"]);
        let ui = store.seed("Button colors", &["conductor:task", "skill:ui"]);
        let untagged = store.seed("Update docs", &["conductor:task"]);
        store.seed("Not a task", &[]);
        let mgr = ClaimManager::new(&store, &config, "bot");

        let listed: Vec<u64> = mgr
            .list_claimable(&role(&config, "fe"))
            .unwrap()
            .map(|t| t.number)
            .collect();
        assert_eq!(listed, vec![ui, untagged]);
        assert_eq!(mgr.list_claimable(&role(&config, "dev")).unwrap().count(), 3);
    }

    #[test]
    fn transient_failures_surface_after_retries() {
        let (store, config) = setup();
        store.seed("one", &["conductor:task"]);
        let mgr = ClaimManager::new(&store, &config, "bot");
        store.fail_next(1);
        let err = mgr.list_claimable(&role(&config, "dev")).err().unwrap();
        assert!(is_transient(&err));
    }

    #[test]
    fn heartbeat_requires_holder() {
        let (store, config) = setup();
        let n = store.seed("one", &["conductor:task"]);
        let mgr = ClaimManager::new(&store, &config, "bot");
        let a = AgentIdentity::new("dev", "aaaaaa");
        let b = AgentIdentity::new("dev", "bbbbbb");
        mgr.claim(n, &a, None).unwrap();

        store.advance(chrono::Duration::hours(2));
        let claim = mgr.heartbeat(n, &a, Some("halfway")).unwrap();
        assert_eq!(claim.last_heartbeat, store.now());

        let err = mgr.heartbeat(n, &b, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::NoClaim { .. })));
    }

    #[test]
    fn release_returns_task_to_pool() {
        let (store, config) = setup();
        let n = store.seed("one", &["conductor:task"]);
        let mgr = ClaimManager::new(&store, &config, "bot");
        let a = AgentIdentity::new("dev", "aaaaaa");
        mgr.claim(n, &a, None).unwrap();
        mgr.release(n, &a, None).unwrap();

        assert!(mgr.current_claim(n).unwrap().is_none());
        let listed: Vec<u64> = mgr.list_claimable(&role(&config, "dev")).unwrap().map(|t| t.number).collect();
        assert_eq!(listed, vec![n]);

        // A later claimer is the holder, not the released one
        let b = AgentIdentity::new("dev", "bbbbbb");
        assert!(matches!(mgr.claim(n, &b, None).unwrap(), ClaimOutcome::Claimed(_)));
        assert_eq!(mgr.current_claim(n).unwrap().unwrap().agent, "dev-bbbbbb");
    }

    #[test]
    fn complete_closes_issue() {
        let (store, config) = setup();
        let n = store.seed("one", &["conductor:task"]);
        let mgr = ClaimManager::new(&store, &config, "bot");
        let a = AgentIdentity::new("dev", "aaaaaa");
        mgr.claim(n, &a, None).unwrap();
        mgr.complete(n, &a, None, true).unwrap();

        let issue = store.snapshot(n).unwrap();
        assert_eq!(issue.state, IssueState::Closed);
        assert!(issue.assignees.is_empty());
        assert!(!issue.labels.contains(&"conductor:in-progress".to_string()));
    }
}
