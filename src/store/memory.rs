//! In-process Issue Store.
//!
//! Every operation takes one lock, so `assign` is atomic the way GitHub's
//! single assignment call is. The clock is settable so staleness can be
//! simulated without sleeping.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{
    Assignment, Comment, Issue, IssueQuery, IssueState, IssueStore, NewIssue, NewPullRequest,
    PrState, PullRequest, is_agent_branch_for, references_issue,
};
use crate::error::ExitError;
use crate::labels::LabelSpec;

#[derive(Debug, Default)]
struct State {
    now: Option<DateTime<Utc>>,
    next_number: u64,
    next_comment: u64,
    issues: BTreeMap<u64, Issue>,
    comments: BTreeMap<u64, Vec<Comment>>,
    assigned_at: BTreeMap<u64, DateTime<Utc>>,
    pulls: Vec<PullRequest>,
    labels: Vec<String>,
    /// Remaining operations that fail with a transient error.
    fail_next: u32,
    /// Issues whose `add_labels` always fails transiently.
    fail_labels: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct MemoryStore {
    login: String,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
            state: Mutex::new(State {
                next_number: 1,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Pin the clock used for new comments and timestamps.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = Some(now);
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut state = self.lock();
        let now = state.now.unwrap_or_else(Utc::now);
        state.now = Some(now + by);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.lock().now.unwrap_or_else(Utc::now)
    }

    /// Make the next `n` operations fail as if GitHub were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Make every `add_labels` on `number` fail as if GitHub timed out.
    pub fn fail_labels_on(&self, number: u64) {
        self.lock().fail_labels.insert(number);
    }

    /// Insert an issue directly, returning its number.
    pub fn seed(&self, title: &str, labels: &[&str]) -> u64 {
        self.create_issue(&NewIssue {
            title: title.to_string(),
            body: String::new(),
            labels: labels.iter().map(|l| (*l).to_string()).collect(),
        })
        .unwrap_or_default()
    }

    pub fn seed_pull_request(&self, head: &str, body: &str, state: PrState) -> u64 {
        let mut s = self.lock();
        let number = s.next_number;
        s.next_number += 1;
        s.pulls.push(PullRequest {
            number,
            url: format!("https://example.test/pull/{number}"),
            state,
            head: head.to_string(),
            body: body.to_string(),
        });
        number
    }

    pub fn set_state(&self, number: u64, state: IssueState) {
        let mut s = self.lock();
        let now = s.now.unwrap_or_else(Utc::now);
        if let Some(issue) = s.issues.get_mut(&number) {
            issue.state = state;
            issue.closed_at = (state == IssueState::Closed).then_some(now);
        }
    }

    pub fn snapshot(&self, number: u64) -> Option<Issue> {
        self.lock().issues.get(&number).cloned()
    }

    fn guard(&self) -> anyhow::Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ExitError::Transient("memory store unavailable".into()).into());
        }
        Ok(state)
    }
}

impl State {
    fn clock(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn issue_mut(&mut self, number: u64) -> anyhow::Result<&mut Issue> {
        let now = self.clock();
        let issue = self
            .issues
            .get_mut(&number)
            .ok_or_else(|| ExitError::Other(format!("issue #{number} not found")))?;
        issue.updated_at = now;
        Ok(issue)
    }
}

impl IssueStore for MemoryStore {
    fn current_login(&self) -> anyhow::Result<String> {
        Ok(self.login.clone())
    }

    fn list_issues(&self, query: &IssueQuery) -> anyhow::Result<Vec<Issue>> {
        let state = self.guard()?;
        Ok(state
            .issues
            .values()
            .filter(|i| query.matches(i))
            .take(query.limit)
            .cloned()
            .collect())
    }

    fn issue(&self, number: u64) -> anyhow::Result<Issue> {
        let state = self.guard()?;
        state
            .issues
            .get(&number)
            .cloned()
            .ok_or_else(|| ExitError::Other(format!("issue #{number} not found")).into())
    }

    fn comments(&self, number: u64) -> anyhow::Result<Vec<Comment>> {
        let state = self.guard()?;
        Ok(state.comments.get(&number).cloned().unwrap_or_default())
    }

    fn assigned_at(&self, number: u64) -> anyhow::Result<Option<DateTime<Utc>>> {
        let state = self.guard()?;
        Ok(state.assigned_at.get(&number).copied())
    }

    fn assign(&self, number: u64, login: &str) -> anyhow::Result<Assignment> {
        let mut state = self.guard()?;
        let now = state.clock();
        let issue = state.issue_mut(number)?;
        if issue.assignees.iter().any(|a| a != login) {
            return Ok(Assignment::AlreadyAssigned {
                assignees: issue.assignees.clone(),
            });
        }
        if issue.assignees.is_empty() {
            issue.assignees.push(login.to_string());
            state.assigned_at.insert(number, now);
        }
        Ok(Assignment::Assigned)
    }

    fn unassign(&self, number: u64, logins: &[String]) -> anyhow::Result<()> {
        let mut state = self.guard()?;
        let issue = state.issue_mut(number)?;
        issue.assignees.retain(|a| !logins.contains(a));
        Ok(())
    }

    fn add_labels(&self, number: u64, labels: &[String]) -> anyhow::Result<()> {
        let mut state = self.guard()?;
        if state.fail_labels.contains(&number) {
            return Err(ExitError::Transient(format!("adding labels to #{number} timed out")).into());
        }
        let issue = state.issue_mut(number)?;
        for label in labels {
            if !issue.labels.contains(label) {
                issue.labels.push(label.clone());
            }
        }
        Ok(())
    }

    fn remove_labels(&self, number: u64, labels: &[String]) -> anyhow::Result<()> {
        let mut state = self.guard()?;
        let issue = state.issue_mut(number)?;
        issue.labels.retain(|l| !labels.contains(l));
        Ok(())
    }

    fn comment(&self, number: u64, body: &str) -> anyhow::Result<()> {
        let mut state = self.guard()?;
        let now = state.clock();
        state.issue_mut(number)?;
        state.next_comment += 1;
        let comment = Comment {
            id: format!("C_{}", state.next_comment),
            author: self.login.clone(),
            body: body.to_string(),
            created_at: now,
        };
        state.comments.entry(number).or_default().push(comment);
        Ok(())
    }

    fn create_issue(&self, new: &NewIssue) -> anyhow::Result<u64> {
        let mut state = self.guard()?;
        let now = state.clock();
        let number = state.next_number;
        state.next_number += 1;
        state.issues.insert(
            number,
            Issue {
                number,
                title: new.title.clone(),
                body: new.body.clone(),
                state: IssueState::Open,
                labels: new.labels.clone(),
                assignees: Vec::new(),
                created_at: now,
                updated_at: now,
                closed_at: None,
            },
        );
        Ok(number)
    }

    fn edit_body(&self, number: u64, body: &str) -> anyhow::Result<()> {
        let mut state = self.guard()?;
        state.issue_mut(number)?.body = body.to_string();
        Ok(())
    }

    fn close_issue(&self, number: u64) -> anyhow::Result<()> {
        let mut state = self.guard()?;
        let now = state.clock();
        let issue = state.issue_mut(number)?;
        issue.state = IssueState::Closed;
        issue.closed_at = Some(now);
        Ok(())
    }

    fn linked_pull_requests(&self, number: u64) -> anyhow::Result<Vec<PullRequest>> {
        let state = self.guard()?;
        Ok(state
            .pulls
            .iter()
            .filter(|pr| references_issue(&pr.body, number) || is_agent_branch_for(&pr.head, number))
            .cloned()
            .collect())
    }

    fn find_pull_request(&self, head: &str) -> anyhow::Result<Option<PullRequest>> {
        let state = self.guard()?;
        Ok(state.pulls.iter().find(|pr| pr.head == head).cloned())
    }

    fn create_pull_request(&self, new: &NewPullRequest) -> anyhow::Result<PullRequest> {
        let mut state = self.guard()?;
        let number = state.next_number;
        state.next_number += 1;
        let pr = PullRequest {
            number,
            url: format!("https://example.test/pull/{number}"),
            state: PrState::Open,
            head: new.head.clone(),
            body: new.body.clone(),
        };
        state.pulls.push(pr.clone());
        Ok(pr)
    }

    fn list_labels(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.guard()?.labels.clone())
    }

    fn create_label(&self, label: &LabelSpec) -> anyhow::Result<()> {
        let mut state = self.guard()?;
        if !state.labels.contains(&label.name) {
            state.labels.push(label.name.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_is_compare_and_set() {
        let store = MemoryStore::new("alice");
        let n = store.seed("Add dark mode", &["conductor:task"]);
        assert_eq!(store.assign(n, "alice").unwrap(), Assignment::Assigned);
        // Idempotent for the holder
        assert_eq!(store.assign(n, "alice").unwrap(), Assignment::Assigned);
        assert_eq!(
            store.assign(n, "bob").unwrap(),
            Assignment::AlreadyAssigned {
                assignees: vec!["alice".into()]
            }
        );
        assert_eq!(store.snapshot(n).unwrap().assignees, vec!["alice"]);
    }

    #[test]
    fn injected_failures_are_transient() {
        let store = MemoryStore::new("alice");
        store.fail_next(1);
        let err = store.list_issues(&IssueQuery::labelled("x")).unwrap_err();
        assert!(crate::error::is_transient(&err));
        assert!(store.list_issues(&IssueQuery::labelled("x")).is_ok());
    }

    #[test]
    fn comments_use_pinned_clock() {
        let store = MemoryStore::new("alice");
        let t0 = Utc::now() - chrono::Duration::days(3);
        store.set_now(t0);
        let n = store.seed("x", &[]);
        store.comment(n, "hello").unwrap();
        store.advance(chrono::Duration::hours(1));
        store.comment(n, "again").unwrap();
        let comments = store.comments(n).unwrap();
        assert_eq!(comments[0].created_at, t0);
        assert_eq!(comments[1].created_at, t0 + chrono::Duration::hours(1));
    }
}
