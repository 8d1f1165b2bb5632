//! The Issue Store seam: everything conductor needs from GitHub Issues.
//!
//! `GhStore` talks to GitHub through the `gh` CLI; `MemoryStore` is an
//! in-process stand-in with the same atomicity guarantees for tests.

pub mod github;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::labels::LabelSpec;

pub use github::GhStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub state: PrState,
    pub head: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    Open,
    Closed,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssigneeFilter {
    Any,
    Unassigned,
    Login(String),
}

/// Filter for listing issues. All labels must be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueQuery {
    pub labels: Vec<String>,
    pub state: StateFilter,
    pub assignee: AssigneeFilter,
    pub limit: usize,
}

impl IssueQuery {
    pub fn labelled(label: &str) -> Self {
        Self {
            labels: vec![label.to_string()],
            state: StateFilter::Open,
            assignee: AssigneeFilter::Any,
            limit: 1000,
        }
    }

    pub fn state(mut self, state: StateFilter) -> Self {
        self.state = state;
        self
    }

    pub fn assignee(mut self, assignee: AssigneeFilter) -> Self {
        self.assignee = assignee;
        self
    }

    /// Client-side check, applied on top of whatever the backend filtered.
    pub fn matches(&self, issue: &Issue) -> bool {
        let state_ok = match self.state {
            StateFilter::Open => issue.state == IssueState::Open,
            StateFilter::Closed => issue.state == IssueState::Closed,
            StateFilter::All => true,
        };
        let assignee_ok = match &self.assignee {
            AssigneeFilter::Any => true,
            AssigneeFilter::Unassigned => issue.assignees.is_empty(),
            AssigneeFilter::Login(login) => issue.assignees.iter().any(|a| a == login),
        };
        state_ok
            && assignee_ok
            && self.labels.iter().all(|l| issue.labels.contains(l))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Result of the single server-side assignment call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Assigned,
    /// Someone else already holds the issue; nothing was changed.
    AlreadyAssigned { assignees: Vec<String> },
}

/// Operations consumed from the issue tracker.
///
/// `assign` is the only concurrency primitive: it must either assign the
/// login to an issue nobody else holds, or report the current holders
/// without assigning.
pub trait IssueStore {
    /// Login of the authenticated user, used to resolve `@me`.
    fn current_login(&self) -> anyhow::Result<String>;

    fn list_issues(&self, query: &IssueQuery) -> anyhow::Result<Vec<Issue>>;

    fn issue(&self, number: u64) -> anyhow::Result<Issue>;

    /// Comments in creation order.
    fn comments(&self, number: u64) -> anyhow::Result<Vec<Comment>>;

    /// When the issue was most recently assigned, if known.
    fn assigned_at(&self, number: u64) -> anyhow::Result<Option<DateTime<Utc>>>;

    fn assign(&self, number: u64, login: &str) -> anyhow::Result<Assignment>;

    fn unassign(&self, number: u64, logins: &[String]) -> anyhow::Result<()>;

    fn add_labels(&self, number: u64, labels: &[String]) -> anyhow::Result<()>;

    fn remove_labels(&self, number: u64, labels: &[String]) -> anyhow::Result<()>;

    fn comment(&self, number: u64, body: &str) -> anyhow::Result<()>;

    fn create_issue(&self, issue: &NewIssue) -> anyhow::Result<u64>;

    fn edit_body(&self, number: u64, body: &str) -> anyhow::Result<()>;

    fn close_issue(&self, number: u64) -> anyhow::Result<()>;

    /// Pull requests that reference the issue with a closing keyword or
    /// were opened from an `agent-*-<number>` branch.
    fn linked_pull_requests(&self, number: u64) -> anyhow::Result<Vec<PullRequest>>;

    fn find_pull_request(&self, head: &str) -> anyhow::Result<Option<PullRequest>>;

    fn create_pull_request(&self, pr: &NewPullRequest) -> anyhow::Result<PullRequest>;

    fn list_labels(&self) -> anyhow::Result<Vec<String>>;

    fn create_label(&self, label: &LabelSpec) -> anyhow::Result<()>;
}

/// True if `body` links `number` with a closing keyword (`Closes #12`,
/// `fixes #12`, `Completes #12`, ...).
pub fn references_issue(body: &str, number: u64) -> bool {
    let pattern = format!(
        r"(?i)\b(close[sd]?|fix(e[sd])?|resolve[sd]?|complete[sd]?)\s*:?\s+#{number}\b"
    );
    regex::Regex::new(&pattern).is_ok_and(|re| re.is_match(body))
}

/// True if `head` is an agent branch for `number`.
pub fn is_agent_branch_for(head: &str, number: u64) -> bool {
    head.starts_with("agent-") && head.ends_with(&format!("-{number}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_keywords_link_issue() {
        assert!(references_issue("Closes #42", 42));
        assert!(references_issue("This fixes #42.", 42));
        assert!(references_issue("Completes #42\n\nAuto-generated", 42));
        assert!(references_issue("resolved: #42", 42));
        assert!(!references_issue("Closes #420", 42));
        assert!(!references_issue("see #42", 42));
    }

    #[test]
    fn agent_branch_detection() {
        assert!(is_agent_branch_for("agent-frontend-42", 42));
        assert!(is_agent_branch_for("agent-ml-engineer-7", 7));
        assert!(!is_agent_branch_for("agent-frontend-142", 42));
        assert!(!is_agent_branch_for("feature-42", 42));
    }

    #[test]
    fn query_matches_client_side() {
        let issue = Issue {
            number: 1,
            title: "t".into(),
            body: String::new(),
            state: IssueState::Open,
            labels: vec!["conductor:task".into()],
            assignees: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
        };
        let q = IssueQuery::labelled("conductor:task").assignee(AssigneeFilter::Unassigned);
        assert!(q.matches(&issue));
        let q = IssueQuery::labelled("conductor:task").state(StateFilter::Closed);
        assert!(!q.matches(&issue));
        let q = IssueQuery::labelled("other");
        assert!(!q.matches(&issue));
    }
}
