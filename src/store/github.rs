//! `IssueStore` backed by the GitHub CLI.
//!
//! Every call goes through `gh` with a timeout and the configured backoff.
//! Failures are classified from stderr (see `error::classify_gh_failure`).

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{
    AssigneeFilter, Assignment, Comment, Issue, IssueQuery, IssueState, IssueStore, NewIssue,
    NewPullRequest, PrState, PullRequest, StateFilter, is_agent_branch_for, references_issue,
};
use crate::config::Config;
use crate::error::{ExitError, classify_gh_failure};
use crate::labels::LabelSpec;
use crate::retry::Backoff;
use crate::subprocess::Tool;

const ISSUE_FIELDS: &str = "number,title,body,state,labels,assignees,createdAt,updatedAt,closedAt";
const PR_FIELDS: &str = "number,url,state,headRefName,body";

/// How many recent pull requests to scan when looking for links.
const PR_SCAN_LIMIT: &str = "200";

/// Allowed drift between the local clock and GitHub's when matching a write
/// that timed out against what the server recorded.
const CLOCK_SKEW_SECS: i64 = 30;

pub struct GhStore {
    repo: Option<String>,
    timeout: Duration,
    retry: Backoff,
    login: OnceLock<String>,
}

impl GhStore {
    pub fn new(config: &Config) -> Self {
        let repo = Some(config.github.repo.trim().to_string()).filter(|r| !r.is_empty());
        Self {
            repo,
            timeout: config.gh_timeout(),
            retry: config.retry_policy(),
            login: OnceLock::new(),
        }
    }

    /// Run `gh` once; returns stdout.
    fn gh_once(&self, args: &[&str]) -> anyhow::Result<String> {
        let mut tool = Tool::new("gh").args(args).timeout(self.timeout);
        if let Some(ref repo) = self.repo {
            tool = tool.env("GH_REPO", repo);
        }
        let output = tool.run()?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_gh_failure(output.exit_code, &output.stderr).into())
        }
    }

    /// Run `gh` with retries; returns stdout.
    fn gh(&self, what: &str, args: &[&str]) -> anyhow::Result<String> {
        self.retry.run(what, || self.gh_once(args))
    }

    fn gh_json<T: serde::de::DeserializeOwned>(&self, what: &str, args: &[&str]) -> anyhow::Result<T> {
        decode(what, &self.gh(what, args)?)
    }

    /// Did a comment with `body` by us land on `number` since `since`?
    fn comment_landed(&self, number: u64, body: &str, since: DateTime<Utc>) -> anyhow::Result<Option<()>> {
        let me = self.current_login()?;
        let n = number.to_string();
        let resp: GhComments = decode(
            "view comments",
            &self.gh_once(&["issue", "view", &n, "--json", "comments"])?,
        )?;
        Ok(find_landed_comment(&resp.comments, &me, body, since).then_some(()))
    }

    /// The number of an issue titled `title` we created since `since`, if any.
    fn issue_landed(&self, title: &str, since: DateTime<Utc>) -> anyhow::Result<Option<u64>> {
        let search = format!("\"{}\" in:title", title.replace('"', " "));
        let issues: Vec<GhIssue> = decode(
            "find created issue",
            &self.gh_once(&[
                "issue", "list", "--author", "@me", "--state", "all", "--search", &search, "--json",
                ISSUE_FIELDS,
            ])?,
        )?;
        Ok(find_landed_issue(&issues, title, since))
    }

    fn resolve_login(&self, login: &str) -> anyhow::Result<String> {
        if login == "@me" {
            self.current_login()
        } else {
            Ok(login.to_string())
        }
    }

    fn all_pull_requests(&self) -> anyhow::Result<Vec<PullRequest>> {
        let prs: Vec<GhPullRequest> = self.gh_json(
            "list pull requests",
            &["pr", "list", "--state", "all", "--limit", PR_SCAN_LIMIT, "--json", PR_FIELDS],
        )?;
        Ok(prs.into_iter().map(GhPullRequest::into_pull_request).collect())
    }
}

// --- gh JSON shapes ---

#[derive(Debug, Deserialize)]
struct GhName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhLogin {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    state: String,
    #[serde(default)]
    labels: Vec<GhName>,
    #[serde(default)]
    assignees: Vec<GhLogin>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
}

impl GhIssue {
    fn into_issue(self) -> Issue {
        let state = if self.state.eq_ignore_ascii_case("open") {
            IssueState::Open
        } else {
            IssueState::Closed
        };
        Issue {
            number: self.number,
            title: self.title,
            body: self.body,
            state,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            assignees: self.assignees.into_iter().map(|a| a.login).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at.filter(|_| state == IssueState::Closed),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhComments {
    #[serde(default)]
    comments: Vec<GhComment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhComment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    author: Option<GhLogin>,
    #[serde(default)]
    body: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: u64,
    #[serde(default)]
    url: String,
    state: String,
    #[serde(default)]
    head_ref_name: String,
    #[serde(default)]
    body: String,
}

impl GhPullRequest {
    fn into_pull_request(self) -> PullRequest {
        let state = match self.state.to_ascii_uppercase().as_str() {
            "MERGED" => PrState::Merged,
            "CLOSED" => PrState::Closed,
            _ => PrState::Open,
        };
        PullRequest {
            number: self.number,
            url: self.url,
            state,
            head: self.head_ref_name,
            body: self.body,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, stdout: &str) -> anyhow::Result<T> {
    serde_json::from_str(stdout)
        .map_err(|e| ExitError::Other(format!("unexpected gh output for {what}: {e}")).into())
}

fn find_landed_comment(comments: &[GhComment], me: &str, body: &str, since: DateTime<Utc>) -> bool {
    comments.iter().any(|c| {
        c.author.as_ref().is_some_and(|a| a.login == me)
            && c.body.trim() == body.trim()
            && c.created_at >= since
    })
}

fn find_landed_issue(issues: &[GhIssue], title: &str, since: DateTime<Utc>) -> Option<u64> {
    issues
        .iter()
        .filter(|i| i.title.trim() == title.trim() && i.created_at >= since)
        .map(|i| i.number)
        .max()
}

/// Parse the trailing number out of an issue/PR URL printed by `gh ... create`.
fn number_from_url(url: &str) -> Option<u64> {
    url.trim().rsplit('/').next()?.parse().ok()
}

impl IssueStore for GhStore {
    fn current_login(&self) -> anyhow::Result<String> {
        if let Some(login) = self.login.get() {
            return Ok(login.clone());
        }
        let login = self.gh("resolve login", &["api", "user", "--jq", ".login"])?;
        let login = login.trim().to_string();
        if login.is_empty() {
            return Err(ExitError::Config("gh api user returned no login".into()).into());
        }
        Ok(self.login.get_or_init(|| login).clone())
    }

    fn list_issues(&self, query: &IssueQuery) -> anyhow::Result<Vec<Issue>> {
        let state = match query.state {
            StateFilter::Open => "open",
            StateFilter::Closed => "closed",
            StateFilter::All => "all",
        };
        let limit = query.limit.to_string();
        let mut args = vec![
            "issue",
            "list",
            "--state",
            state,
            "--limit",
            limit.as_str(),
            "--json",
            ISSUE_FIELDS,
        ];
        for label in &query.labels {
            args.push("--label");
            args.push(label.as_str());
        }
        match &query.assignee {
            AssigneeFilter::Any => {}
            AssigneeFilter::Unassigned => {
                args.push("--search");
                args.push("no:assignee");
            }
            AssigneeFilter::Login(login) => {
                args.push("--assignee");
                args.push(login.as_str());
            }
        }

        let issues: Vec<GhIssue> = self.gh_json("list issues", &args)?;
        Ok(issues
            .into_iter()
            .map(GhIssue::into_issue)
            .filter(|i| query.matches(i))
            .collect())
    }

    fn issue(&self, number: u64) -> anyhow::Result<Issue> {
        let n = number.to_string();
        let issue: GhIssue = self.gh_json("view issue", &["issue", "view", &n, "--json", ISSUE_FIELDS])?;
        Ok(issue.into_issue())
    }

    fn comments(&self, number: u64) -> anyhow::Result<Vec<Comment>> {
        let n = number.to_string();
        let resp: GhComments = self.gh_json("view comments", &["issue", "view", &n, "--json", "comments"])?;
        Ok(resp
            .comments
            .into_iter()
            .map(|c| Comment {
                id: c.id,
                author: c.author.map(|a| a.login).unwrap_or_default(),
                body: c.body,
                created_at: c.created_at,
            })
            .collect())
    }

    fn assigned_at(&self, number: u64) -> anyhow::Result<Option<DateTime<Utc>>> {
        let path = format!("repos/{{owner}}/{{repo}}/issues/{number}/events");
        let stdout = self.gh(
            "issue events",
            &[
                "api",
                &path,
                "--paginate",
                "--jq",
                r#".[] | select(.event == "assigned") | .created_at"#,
            ],
        )?;
        Ok(stdout
            .lines()
            .filter_map(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
            .map(|t| t.with_timezone(&Utc))
            .max())
    }

    fn assign(&self, number: u64, login: &str) -> anyhow::Result<Assignment> {
        let me = self.resolve_login(login)?;
        let before = self.issue(number)?;
        let others: Vec<String> = before.assignees.iter().filter(|a| **a != me).cloned().collect();
        if !others.is_empty() {
            return Ok(Assignment::AlreadyAssigned { assignees: others });
        }
        if before.assignees.contains(&me) {
            return Ok(Assignment::Assigned);
        }

        let n = number.to_string();
        self.gh("assign issue", &["issue", "edit", &n, "--add-assignee", &me])?;

        // gh adds assignees rather than replacing them, so a concurrent
        // assignment shows up as a second login. Back out if we see one.
        let after = self.issue(number)?;
        let others: Vec<String> = after.assignees.iter().filter(|a| **a != me).cloned().collect();
        if !others.is_empty() {
            tracing::info!(task = number, ?others, "concurrent assignment detected, backing out");
            self.gh("unassign issue", &["issue", "edit", &n, "--remove-assignee", &me])?;
            return Ok(Assignment::AlreadyAssigned { assignees: others });
        }
        Ok(Assignment::Assigned)
    }

    fn unassign(&self, number: u64, logins: &[String]) -> anyhow::Result<()> {
        if logins.is_empty() {
            return Ok(());
        }
        let n = number.to_string();
        let joined = logins.join(",");
        self.gh("unassign issue", &["issue", "edit", &n, "--remove-assignee", &joined])?;
        Ok(())
    }

    fn add_labels(&self, number: u64, labels: &[String]) -> anyhow::Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let n = number.to_string();
        let joined = labels.join(",");
        self.gh("add labels", &["issue", "edit", &n, "--add-label", &joined])?;
        Ok(())
    }

    fn remove_labels(&self, number: u64, labels: &[String]) -> anyhow::Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let n = number.to_string();
        let joined = labels.join(",");
        self.gh("remove labels", &["issue", "edit", &n, "--remove-label", &joined])?;
        Ok(())
    }

    fn comment(&self, number: u64, body: &str) -> anyhow::Result<()> {
        let n = number.to_string();
        let since = Utc::now() - chrono::Duration::seconds(CLOCK_SKEW_SECS);
        self.retry.run_write(
            "comment on issue",
            || self.gh_once(&["issue", "comment", &n, "--body", body]).map(drop),
            || self.comment_landed(number, body, since),
        )
    }

    fn create_issue(&self, issue: &NewIssue) -> anyhow::Result<u64> {
        let mut args = vec![
            "issue",
            "create",
            "--title",
            issue.title.as_str(),
            "--body",
            issue.body.as_str(),
        ];
        let joined = issue.labels.join(",");
        if !issue.labels.is_empty() {
            args.push("--label");
            args.push(joined.as_str());
        }
        let since = Utc::now() - chrono::Duration::seconds(CLOCK_SKEW_SECS);
        self.retry.run_write(
            "create issue",
            || {
                let stdout = self.gh_once(&args)?;
                number_from_url(&stdout).ok_or_else(|| {
                    ExitError::Other(format!("could not parse issue number from {:?}", stdout.trim())).into()
                })
            },
            || self.issue_landed(&issue.title, since),
        )
    }

    fn edit_body(&self, number: u64, body: &str) -> anyhow::Result<()> {
        let n = number.to_string();
        self.gh("edit issue body", &["issue", "edit", &n, "--body", body])?;
        Ok(())
    }

    fn close_issue(&self, number: u64) -> anyhow::Result<()> {
        let n = number.to_string();
        self.gh("close issue", &["issue", "close", &n])?;
        Ok(())
    }

    fn linked_pull_requests(&self, number: u64) -> anyhow::Result<Vec<PullRequest>> {
        Ok(self
            .all_pull_requests()?
            .into_iter()
            .filter(|pr| references_issue(&pr.body, number) || is_agent_branch_for(&pr.head, number))
            .collect())
    }

    fn find_pull_request(&self, head: &str) -> anyhow::Result<Option<PullRequest>> {
        let prs: Vec<GhPullRequest> = self.gh_json(
            "find pull request",
            &["pr", "list", "--head", head, "--state", "all", "--limit", "1", "--json", PR_FIELDS],
        )?;
        Ok(prs.into_iter().next().map(GhPullRequest::into_pull_request))
    }

    fn create_pull_request(&self, pr: &NewPullRequest) -> anyhow::Result<PullRequest> {
        let mut args = vec![
            "pr",
            "create",
            "--head",
            pr.head.as_str(),
            "--base",
            pr.base.as_str(),
            "--title",
            pr.title.as_str(),
            "--body",
            pr.body.as_str(),
        ];
        let joined = pr.labels.join(",");
        if !pr.labels.is_empty() {
            args.push("--label");
            args.push(joined.as_str());
        }
        let url = self.retry.run_write(
            "create pull request",
            || {
                let stdout = self.gh_once(&args)?;
                Ok(stdout.lines().last().unwrap_or_default().trim().to_string())
            },
            || {
                let open: Vec<GhPullRequest> = decode(
                    "find pull request",
                    &self.gh_once(&[
                        "pr", "list", "--head", &pr.head, "--state", "open", "--limit", "1", "--json",
                        PR_FIELDS,
                    ])?,
                )?;
                Ok(open.into_iter().next().map(|p| p.url))
            },
        )?;
        let created: GhPullRequest =
            self.gh_json("view pull request", &["pr", "view", &url, "--json", PR_FIELDS])?;
        Ok(created.into_pull_request())
    }

    fn list_labels(&self) -> anyhow::Result<Vec<String>> {
        let labels: Vec<GhName> =
            self.gh_json("list labels", &["label", "list", "--limit", "500", "--json", "name"])?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    fn create_label(&self, label: &LabelSpec) -> anyhow::Result<()> {
        self.gh(
            "create label",
            &[
                "label",
                "create",
                &label.name,
                "--color",
                &label.color,
                "--description",
                &label.description,
                "--force",
            ],
        )?;
        Ok(())
    }
}
