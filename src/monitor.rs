//! Heartbeat / Health Monitor.
//!
//! A scan reads every assigned task first and only then reclaims the stale
//! ones, so an unreachable store aborts the scan before anything changes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::activity;
use crate::claims::reclaim;
use crate::config::Config;
use crate::labels::LabelScheme;
use crate::model::{Claim, ClaimState, Task, format_age};
use crate::store::{IssueQuery, IssueStore, NewIssue, StateFilter};
use crate::template::{StatusRecord, StatusRow, render_status};

pub const STATUS_TITLE: &str = "Conductor Status";

#[derive(Debug, Clone, Serialize)]
pub struct ClaimReport {
    pub task: u64,
    pub title: String,
    pub agent: String,
    pub last_heartbeat: DateTime<Utc>,
    pub idle: String,
    pub state: ClaimState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub task: u64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scanned_at: DateTime<Utc>,
    pub dry_run: bool,
    pub claims: Vec<ClaimReport>,
    pub errors: Vec<TaskError>,
}

impl ScanReport {
    pub fn count(&self, state: ClaimState) -> usize {
        self.claims.iter().filter(|c| c.state == state).count()
    }

    /// Claims found stale, whether or not they were reclaimed.
    pub fn stale(&self) -> usize {
        self.claims.iter().filter(|c| c.state != ClaimState::Active).count()
    }
}

pub struct HealthMonitor<'a, S: IssueStore + ?Sized> {
    store: &'a S,
    scheme: LabelScheme,
    timeout: chrono::Duration,
}

impl<'a, S: IssueStore + ?Sized> HealthMonitor<'a, S> {
    pub fn new(store: &'a S, config: &Config) -> Self {
        Self {
            store,
            scheme: LabelScheme::new(&config.labels.prefix),
            timeout: config.heartbeat.timeout(),
        }
    }

    /// Every claim on an open task, read without side effects.
    pub fn claims(&self) -> anyhow::Result<Vec<Claim>> {
        let issues = self.store.list_issues(&IssueQuery::labelled(&self.scheme.task()))?;
        let mut claims = Vec::new();
        for issue in issues.iter().filter(|i| !i.assignees.is_empty()) {
            let comments = self.store.comments(issue.number)?;
            let assigned_at = self.store.assigned_at(issue.number)?;
            claims.extend(activity::reconstruct(issue, &comments, assigned_at));
        }
        Ok(claims)
    }

    /// Classify every claim and reclaim the stale ones.
    pub fn scan(&self, now: DateTime<Utc>, dry_run: bool) -> anyhow::Result<ScanReport> {
        let claims = self.claims()?;
        let mut report = ScanReport {
            scanned_at: now,
            dry_run,
            claims: Vec::with_capacity(claims.len()),
            errors: Vec::new(),
        };

        for claim in &claims {
            let mut state = claim.state(now, self.timeout);
            if state == ClaimState::Stale && !dry_run {
                match reclaim(self.store, &self.scheme, claim, now) {
                    Ok(()) => state = ClaimState::Reclaimed,
                    Err(e) => {
                        tracing::warn!(task = claim.task, error = %e, "failed to reclaim stale task");
                        report.errors.push(TaskError {
                            task: claim.task,
                            error: format!("{e:#}"),
                        });
                    }
                }
            }
            report.claims.push(ClaimReport {
                task: claim.task,
                title: claim.title.clone(),
                agent: claim.agent.clone(),
                last_heartbeat: claim.last_heartbeat,
                idle: format_age(claim.idle(now)),
                state,
            });
        }
        tracing::info!(
            claims = report.claims.len(),
            stale = report.stale(),
            reclaimed = report.count(ClaimState::Reclaimed),
            "health scan finished"
        );
        Ok(report)
    }

    /// Build the dashboard from a scan.
    pub fn status_record(&self, report: &ScanReport) -> anyhow::Result<StatusRecord> {
        let open = self.store.list_issues(&IssueQuery::labelled(&self.scheme.task()))?;
        let queued = open
            .iter()
            .map(|i| Task::from_issue(i, &self.scheme))
            .filter(Task::is_claimable)
            .count();

        let mut completed = BTreeSet::new();
        for label in [self.scheme.task(), self.scheme.archived()] {
            let closed = self
                .store
                .list_issues(&IssueQuery::labelled(&label).state(StateFilter::Closed))?;
            completed.extend(closed.iter().map(|i| i.number));
        }

        let active: Vec<&ClaimReport> = report
            .claims
            .iter()
            .filter(|c| c.state == ClaimState::Active)
            .collect();
        let agents: BTreeSet<&str> = active.iter().map(|c| c.agent.as_str()).collect();

        Ok(StatusRecord {
            active_agents: agents.len(),
            queued,
            completed: completed.len(),
            stale: report.stale(),
            reclaimed: report.count(ClaimState::Reclaimed),
            claims: active
                .iter()
                .map(|c| StatusRow {
                    task: c.task,
                    title: c.title.clone(),
                    agent: c.agent.clone(),
                    idle: c.idle.clone(),
                    state: c.state.as_str().to_string(),
                })
                .collect(),
            updated_at: report.scanned_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        })
    }

    /// Create or edit the singleton status issue. Returns its number.
    pub fn update_status_record(&self, record: &StatusRecord) -> anyhow::Result<u64> {
        let body = render_status(record)?;
        let existing = self
            .store
            .list_issues(&IssueQuery::labelled(&self.scheme.status()).state(StateFilter::All))?;
        if let Some(issue) = existing.iter().min_by_key(|i| i.number) {
            self.store.edit_body(issue.number, &body)?;
            tracing::info!(issue = issue.number, "updated status record");
            return Ok(issue.number);
        }
        let number = self.store.create_issue(&NewIssue {
            title: STATUS_TITLE.to_string(),
            body,
            labels: vec![self.scheme.status()],
        })?;
        tracing::info!(issue = number, "created status record");
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ClaimManager;
    use crate::model::{AgentIdentity, Role};
    use crate::store::{IssueState, MemoryStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
    }

    /// Task claimed at t0 by `dev-aaaaaa`, plus one fresh unclaimed task.
    fn claimed_store(config: &Config) -> (MemoryStore, u64) {
        let store = MemoryStore::new("bot");
        store.set_now(t0());
        let n = store.seed("Cache layer", &["conductor:task"]);
        store.seed("Docs", &["conductor:task"]);
        let mgr = ClaimManager::new(&store, config, "bot");
        mgr.claim(n, &AgentIdentity::new("dev", "aaaaaa"), None).unwrap();
        (store, n)
    }

    #[test]
    fn stale_claim_is_reclaimed_and_claimable_again() {
        let config = Config::default();
        let (store, n) = claimed_store(&config);
        store.advance(chrono::Duration::days(8));

        let monitor = HealthMonitor::new(&store, &config);
        let report = monitor.scan(store.now(), false).unwrap();
        assert_eq!(report.count(ClaimState::Reclaimed), 1);
        assert!(report.errors.is_empty());

        let issue = store.snapshot(n).unwrap();
        assert!(issue.assignees.is_empty());
        assert!(!issue.labels.contains(&"conductor:in-progress".to_string()));

        let mgr = ClaimManager::new(&store, &config, "bot");
        let dev = Role::resolve(&config, "dev").unwrap();
        assert!(mgr.list_claimable(&dev).unwrap().any(|t| t.number == n));
    }

    #[test]
    fn fresh_claim_stays_active() {
        let config = Config::default();
        let (store, n) = claimed_store(&config);
        store.advance(chrono::Duration::days(7));

        let report = HealthMonitor::new(&store, &config).scan(store.now(), false).unwrap();
        assert_eq!(report.count(ClaimState::Active), 1);
        assert_eq!(store.snapshot(n).unwrap().assignees, vec!["bot"]);
    }

    #[test]
    fn dry_run_only_classifies() {
        let config = Config::default();
        let (store, n) = claimed_store(&config);
        store.advance(chrono::Duration::days(8));

        let report = HealthMonitor::new(&store, &config).scan(store.now(), true).unwrap();
        assert_eq!(report.count(ClaimState::Stale), 1);
        assert_eq!(store.snapshot(n).unwrap().assignees, vec!["bot"]);
    }

    #[test]
    fn repeated_scan_has_no_extra_side_effects() {
        let config = Config::default();
        let (store, n) = claimed_store(&config);
        let fresh = store.seed("Fresh", &["conductor:task"]);
        store.advance(chrono::Duration::days(8));
        ClaimManager::new(&store, &config, "bot")
            .claim(fresh, &AgentIdentity::new("dev", "bbbbbb"), None)
            .unwrap();

        let monitor = HealthMonitor::new(&store, &config);
        let first = monitor.scan(store.now(), false).unwrap();
        let comments_after_first = store.comments(n).unwrap().len();
        let second = monitor.scan(store.now(), false).unwrap();

        assert_eq!(first.count(ClaimState::Reclaimed), 1);
        assert_eq!(second.count(ClaimState::Reclaimed), 0);
        assert!(second.errors.is_empty());
        assert_eq!(store.comments(n).unwrap().len(), comments_after_first);
        assert_eq!(first.count(ClaimState::Active), second.count(ClaimState::Active));
    }

    #[test]
    fn unreachable_store_aborts_without_writes() {
        let config = Config::default();
        let (store, n) = claimed_store(&config);
        store.advance(chrono::Duration::days(8));
        store.fail_next(1);

        assert!(HealthMonitor::new(&store, &config).scan(store.now(), false).is_err());
        assert_eq!(store.snapshot(n).unwrap().assignees, vec!["bot"]);
    }

    #[test]
    fn status_record_is_created_once_then_edited() {
        let config = Config::default();
        let (store, _) = claimed_store(&config);
        let done = store.seed("Done already", &["conductor:task"]);
        store.set_state(done, IssueState::Closed);

        let monitor = HealthMonitor::new(&store, &config);
        let report = monitor.scan(store.now(), false).unwrap();
        let record = monitor.status_record(&report).unwrap();
        assert_eq!(record.active_agents, 1);
        assert_eq!(record.queued, 1);
        assert_eq!(record.completed, 1);

        let first = monitor.update_status_record(&record).unwrap();
        let second = monitor.update_status_record(&record).unwrap();
        assert_eq!(first, second);
        let body = store.snapshot(first).unwrap().body;
        assert!(body.contains("| Queued tasks | 1 |"));
    }
}
