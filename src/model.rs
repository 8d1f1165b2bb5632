//! Core domain types: tasks, roles, agent identities and claims.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::config::Config;
use crate::error::ExitError;
use crate::labels::{LabelScheme, TaskLabels};
use crate::store::{Issue, IssueState};

/// An issue carrying the task label, with its labels decoded.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub open: bool,
    pub labels: TaskLabels,
    pub assignees: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_issue(issue: &Issue, scheme: &LabelScheme) -> Self {
        Self {
            number: issue.number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            open: issue.state == IssueState::Open,
            labels: TaskLabels::parse(scheme, &issue.labels),
            assignees: issue.assignees.clone(),
            created_at: issue.created_at,
            updated_at: issue.updated_at,
        }
    }

    /// Open, task-labelled, unassigned and not parked in another state.
    pub fn is_claimable(&self) -> bool {
        self.open
            && self.labels.is_task
            && self.assignees.is_empty()
            && !self.labels.in_progress
            && !self.labels.blocked
            && !self.labels.archived
    }

    /// Ranking key: priority first (high wins), then oldest, then lowest number.
    pub fn rank_key(&self) -> (Reverse<crate::labels::Priority>, DateTime<Utc>, u64) {
        (
            Reverse(self.labels.effective_priority()),
            self.created_at,
            self.number,
        )
    }
}

/// Sort tasks into claim order.
pub fn rank(tasks: &mut [Task]) {
    tasks.sort_by_key(Task::rank_key);
}

/// A named category of agent and the skill tags it works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    pub name: String,
    pub skills: BTreeSet<String>,
}

impl Role {
    /// Resolve a role name or alias against the configured roles.
    pub fn resolve(config: &Config, input: &str) -> Result<Self, ExitError> {
        let wanted = input.trim().to_lowercase();
        let found = config.roles.iter().find(|(name, role)| {
            **name == wanted || role.aliases.iter().any(|a| *a == wanted)
        });
        match found {
            Some((name, role)) => Ok(Self {
                name: name.clone(),
                skills: role.skills.iter().map(|s| s.to_lowercase()).collect(),
            }),
            None => Err(ExitError::Config(format!(
                "unknown role {input:?}; configured roles: {}",
                config.roles.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    pub fn is_generalist(&self) -> bool {
        self.skills.is_empty()
    }

    /// Generalists take anything; specialists take untagged tasks or tasks
    /// sharing at least one skill tag.
    pub fn matches(&self, task: &Task) -> bool {
        if self.is_generalist() || task.labels.skills.is_empty() {
            return true;
        }
        task.labels
            .skills
            .iter()
            .any(|s| self.skills.contains(&s.to_lowercase()))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Role plus instance id, e.g. `frontend-3fa2c1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentIdentity {
    pub role: String,
    pub instance: String,
}

impl AgentIdentity {
    /// Uses `CONDUCTOR_AGENT_ID` when set, otherwise 6 random hex digits.
    pub fn for_role(role: &Role) -> Self {
        Self::from_env(&role.name).unwrap_or_else(|| Self::new(&role.name, &random_instance()))
    }

    /// Identity pinned by `CONDUCTOR_AGENT_ID`, if set to something usable.
    pub fn from_env(role: &str) -> Option<Self> {
        let instance = std::env::var("CONDUCTOR_AGENT_ID").ok().filter(|id| is_valid_instance(id))?;
        Some(Self::new(role, &instance))
    }

    /// Split a rendered id back into role and instance.
    pub fn parse(id: &str) -> Option<Self> {
        let (role, instance) = id.rsplit_once('-')?;
        (!role.is_empty() && is_valid_instance(instance)).then(|| Self::new(role, instance))
    }

    pub fn new(role: &str, instance: &str) -> Self {
        Self {
            role: role.to_string(),
            instance: instance.to_string(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.role, self.instance)
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role, self.instance)
    }
}

fn is_valid_instance(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 32
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn random_instance() -> String {
    let value: u32 = rand::rng().random_range(0..0x0100_0000);
    format!("{value:06x}")
}

/// Liveness classification of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimState {
    Active,
    Stale,
    Reclaimed,
}

impl ClaimState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ClaimState::Active => "active",
            ClaimState::Stale => "stale",
            ClaimState::Reclaimed => "reclaimed",
        }
    }
}

/// The derived fact that one agent holds a task. Rebuilt from the issue's
/// assignees and marker comments; never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub task: u64,
    pub title: String,
    /// Agent id from the claim marker, or the assignee login without one.
    pub agent: String,
    pub assignees: Vec<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Claim {
    /// Stale once strictly more than `timeout` has passed since the last heartbeat.
    pub fn state(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> ClaimState {
        if now - self.last_heartbeat > timeout {
            ClaimState::Stale
        } else {
            ClaimState::Active
        }
    }

    pub fn idle(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Human-readable age such as `3d 4h` or `12m`.
pub fn format_age(age: chrono::Duration) -> String {
    let mins = age.num_minutes().max(0);
    let (days, hours, mins) = (mins / 1440, (mins / 60) % 24, mins % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issue(number: u64, labels: &[&str], assignees: &[&str], day: u32) -> Issue {
        Issue {
            number,
            title: format!("task {number}"),
            body: String::new(),
            state: IssueState::Open,
            labels: labels.iter().map(|s| (*s).to_string()).collect(),
            assignees: assignees.iter().map(|s| (*s).to_string()).collect(),
            created_at: Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap(),
            closed_at: None,
        }
    }

    fn scheme() -> LabelScheme {
        LabelScheme::new("conductor")
    }

    #[test]
    fn claimable_requires_label_open_and_unassigned() {
        let s = scheme();
        assert!(Task::from_issue(&issue(1, &["conductor:task"], &[], 1), &s).is_claimable());
        assert!(!Task::from_issue(&issue(2, &[], &[], 1), &s).is_claimable());
        assert!(!Task::from_issue(&issue(3, &["conductor:task"], &["bob"], 1), &s).is_claimable());
        assert!(!Task::from_issue(&issue(4, &["conductor:task", "conductor:blocked"], &[], 1), &s).is_claimable());

        let mut closed = issue(5, &["conductor:task"], &[], 1);
        closed.state = IssueState::Closed;
        assert!(!Task::from_issue(&closed, &s).is_claimable());
    }

    #[test]
    fn ranking_is_priority_then_oldest() {
        let s = scheme();
        let mut tasks = vec![
            Task::from_issue(&issue(10, &["conductor:task", "priority:low"], &[], 1), &s),
            Task::from_issue(&issue(11, &["conductor:task"], &[], 5), &s),
            Task::from_issue(&issue(12, &["conductor:task", "priority:high"], &[], 9), &s),
            Task::from_issue(&issue(13, &["conductor:task", "priority:medium"], &[], 2), &s),
        ];
        rank(&mut tasks);
        let order: Vec<u64> = tasks.iter().map(|t| t.number).collect();
        assert_eq!(order, vec![12, 13, 11, 10]);
    }

    #[test]
    fn resolve_role_by_alias() {
        let config = Config::default();
        let role = Role::resolve(&config, "fe").unwrap();
        assert_eq!(role.name, "frontend");
        assert!(role.skills.contains("ui"));

        let err = Role::resolve(&config, "wizard").unwrap_err();
        assert!(matches!(err, ExitError::Config(_)));
    }

    #[test]
    fn specialist_matches_untagged_or_shared_skill() {
        let s = scheme();
        let config = Config::default();
        let frontend = Role::resolve(&config, "frontend").unwrap();
        let dev = Role::resolve(&config, "dev").unwrap();

        let untagged = Task::from_issue(&issue(1, &["conductor:task"], &[], 1), &s);
        let ui = Task::from_issue(&issue(2, &["conductor:task", "skill:ui"], &[], 1), &s);
        let ops = Task::from_issue(&issue(3, &["conductor:task", "skill:devops"], &[], 1), &s);

        assert!(frontend.matches(&untagged));
        assert!(frontend.matches(&ui));
        assert!(!frontend.matches(&ops));
        assert!(dev.is_generalist());
        assert!(dev.matches(&ops));
    }

    #[test]
    fn claim_state_boundary_is_exclusive() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let timeout = chrono::Duration::days(7);
        let mut claim = Claim {
            task: 10,
            title: "x".into(),
            agent: "dev-abc123".into(),
            assignees: vec!["bot".into()],
            claimed_at: None,
            last_heartbeat: now - timeout,
        };
        assert_eq!(claim.state(now, timeout), ClaimState::Active);
        claim.last_heartbeat = now - chrono::Duration::days(8);
        assert_eq!(claim.state(now, timeout), ClaimState::Stale);
    }

    #[test]
    fn agent_identity_formats_role_and_instance() {
        let id = AgentIdentity::new("frontend", "a1b2c3");
        assert_eq!(id.id(), "frontend-a1b2c3");
        assert_eq!(id.to_string(), "frontend-a1b2c3");
        assert_eq!(random_instance().len(), 6);
        assert!(!is_valid_instance("has space"));
    }

    #[test]
    fn agent_identity_parses_hyphenated_roles() {
        let id = AgentIdentity::parse("ui-designer-3fa2c1").unwrap();
        assert_eq!(id.role, "ui-designer");
        assert_eq!(id.instance, "3fa2c1");
        assert!(AgentIdentity::parse("octocat").is_none());
    }

    #[test]
    fn formats_ages() {
        assert_eq!(format_age(chrono::Duration::minutes(12)), "12m");
        assert_eq!(format_age(chrono::Duration::minutes(125)), "2h 5m");
        assert_eq!(format_age(chrono::Duration::hours(50)), "2d 2h");
    }
}
