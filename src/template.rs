//! Template rendering for issue comments, the task context file, the status
//! record and pull request bodies.

use minijinja::{Environment, context};
use serde::Serialize;

use crate::activity::{Marker, MarkerKind};

const CLAIM_TEMPLATE: &str = include_str!("templates/claim.md.jinja");
const HEARTBEAT_TEMPLATE: &str = include_str!("templates/heartbeat.md.jinja");
const RELEASE_TEMPLATE: &str = include_str!("templates/release.md.jinja");
const COMPLETE_TEMPLATE: &str = include_str!("templates/complete.md.jinja");
const TASK_CONTEXT_TEMPLATE: &str = include_str!("templates/task-context.md.jinja");
const STATUS_TEMPLATE: &str = include_str!("templates/status.md.jinja");
const PULL_REQUEST_TEMPLATE: &str = include_str!("templates/pull-request.md.jinja");

fn environment() -> anyhow::Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("claim", CLAIM_TEMPLATE)?;
    env.add_template("heartbeat", HEARTBEAT_TEMPLATE)?;
    env.add_template("release", RELEASE_TEMPLATE)?;
    env.add_template("complete", COMPLETE_TEMPLATE)?;
    env.add_template("task-context", TASK_CONTEXT_TEMPLATE)?;
    env.add_template("status", STATUS_TEMPLATE)?;
    env.add_template("pull-request", PULL_REQUEST_TEMPLATE)?;
    Ok(env)
}

fn render(name: &str, ctx: impl Serialize) -> anyhow::Result<String> {
    let env = environment()?;
    let rendered = env.get_template(name)?.render(ctx)?;
    Ok(rendered)
}

/// Extra details shown in the human-readable line of a marker comment.
#[derive(Debug, Default, Serialize)]
pub struct CommentDetails<'a> {
    pub message: Option<&'a str>,
    pub branch: Option<&'a str>,
    pub pr_url: Option<&'a str>,
    /// Idle time shown when a stale claim is reclaimed.
    pub idle: Option<String>,
}

/// Render a lifecycle comment: one human line followed by the marker.
pub fn render_comment(marker: &Marker, details: &CommentDetails<'_>) -> anyhow::Result<String> {
    let name = match marker.kind {
        MarkerKind::Claim => "claim",
        MarkerKind::Heartbeat => "heartbeat",
        MarkerKind::Release => "release",
        MarkerKind::Complete => "complete",
    };
    render(
        name,
        context! {
            agent => marker.agent,
            reason => marker.reason,
            marker => marker.to_string(),
            message => details.message,
            branch => details.branch,
            pr_url => details.pr_url,
            idle => details.idle,
        },
    )
}

/// Contents of the context file written into a fresh worktree.
#[derive(Debug, Serialize)]
pub struct TaskContext {
    pub task: u64,
    pub title: String,
    pub body: String,
    pub role: String,
    pub agent: String,
    pub branch: String,
    pub base: String,
    pub started_at: String,
}

pub fn render_task_context(ctx: &TaskContext) -> anyhow::Result<String> {
    let mut out = render("task-context", ctx)?;
    out.push('\n');
    Ok(out)
}

/// One row of the status record's active-claims table.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub task: u64,
    pub title: String,
    pub agent: String,
    pub idle: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub active_agents: usize,
    pub queued: usize,
    pub completed: usize,
    pub stale: usize,
    pub reclaimed: usize,
    pub claims: Vec<StatusRow>,
    pub updated_at: String,
}

pub fn render_status(record: &StatusRecord) -> anyhow::Result<String> {
    render("status", record)
}

pub fn render_pull_request(task: u64, title: &str, agent: &str, branch: &str) -> anyhow::Result<String> {
    render(
        "pull-request",
        context! { task, title, agent, branch },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_comment_ends_with_parseable_marker() {
        let marker = Marker::new(MarkerKind::Claim, "frontend-3fa2c1");
        let body = render_comment(
            &marker,
            &CommentDetails {
                branch: Some("agent-frontend-42"),
                ..CommentDetails::default()
            },
        )
        .unwrap();
        assert!(body.contains("**frontend-3fa2c1**"));
        assert!(body.contains("`agent-frontend-42`"));
        assert_eq!(Marker::parse(&body), Some(marker));
    }

    #[test]
    fn stale_release_mentions_idle_time() {
        let marker = Marker::new(MarkerKind::Release, "dev-aaaaaa").with_reason("stale");
        let body = render_comment(
            &marker,
            &CommentDetails {
                idle: Some("8d 0h".into()),
                ..CommentDetails::default()
            },
        )
        .unwrap();
        assert!(body.contains("reclaimed after 8d 0h"));
        assert!(body.contains("reason=stale"));
    }

    #[test]
    fn heartbeat_with_and_without_message() {
        let marker = Marker::new(MarkerKind::Heartbeat, "dev-aaaaaa");
        let plain = render_comment(&marker, &CommentDetails::default()).unwrap();
        assert!(plain.starts_with("Still working (dev-aaaaaa)."));
        let with = render_comment(
            &marker,
            &CommentDetails {
                message: Some("tests green"),
                ..CommentDetails::default()
            },
        )
        .unwrap();
        assert!(with.starts_with("Still working (dev-aaaaaa): tests green"));
    }

    #[test]
    fn task_context_includes_body_and_branch() {
        let out = render_task_context(&TaskContext {
            task: 42,
            title: "Add dark mode".into(),
            body: "Support a dark theme.".into(),
            role: "frontend".into(),
            agent: "frontend-3fa2c1".into(),
            branch: "agent-frontend-42".into(),
            base: "origin/main".into(),
            started_at: "2026-03-01 10:00 UTC".into(),
        })
        .unwrap();
        assert!(out.starts_with("# Task #42: Add dark mode"));
        assert!(out.contains("Support a dark theme."));
        assert!(out.contains("git push -u origin agent-frontend-42"));
    }

    #[test]
    fn status_record_lists_claims() {
        let out = render_status(&StatusRecord {
            active_agents: 1,
            queued: 3,
            completed: 7,
            stale: 0,
            reclaimed: 0,
            claims: vec![StatusRow {
                task: 42,
                title: "Add dark mode".into(),
                agent: "frontend-3fa2c1".into(),
                idle: "12m".into(),
                state: "active".into(),
            }],
            updated_at: "2026-03-01 10:00 UTC".into(),
        })
        .unwrap();
        assert!(out.contains("| Queued tasks | 3 |"));
        assert!(out.contains("| #42 | Add dark mode | frontend-3fa2c1 | 12m ago | active |"));
    }

    #[test]
    fn pull_request_body_links_issue() {
        let out = render_pull_request(42, "Add dark mode", "frontend-3fa2c1", "agent-frontend-42").unwrap();
        assert!(crate::store::references_issue(&out, 42));
    }
}
