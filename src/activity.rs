//! Claim, heartbeat, release and completion markers.
//!
//! Agents record lifecycle events as issue comments ending in an HTML
//! comment such as `<!-- conductor:heartbeat agent=frontend-3fa2c1 -->`.
//! A [`Claim`] is rebuilt from these plus the issue's assignees.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::model::Claim;
use crate::store::{Comment, Issue};

static MARKER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"<!--\s*conductor:(claim|heartbeat|release|complete)\s+agent=([A-Za-z0-9_.@-]+)(?:\s+reason=([A-Za-z0-9_.-]+))?\s*-->").ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Claim,
    Heartbeat,
    Release,
    Complete,
}

impl MarkerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MarkerKind::Claim => "claim",
            MarkerKind::Heartbeat => "heartbeat",
            MarkerKind::Release => "release",
            MarkerKind::Complete => "complete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "claim" => Some(MarkerKind::Claim),
            "heartbeat" => Some(MarkerKind::Heartbeat),
            "release" => Some(MarkerKind::Release),
            "complete" => Some(MarkerKind::Complete),
            _ => None,
        }
    }

    /// Release and complete both end a claim window.
    const fn ends_claim(self) -> bool {
        matches!(self, MarkerKind::Release | MarkerKind::Complete)
    }

    const fn is_liveness(self) -> bool {
        matches!(self, MarkerKind::Claim | MarkerKind::Heartbeat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub agent: String,
    pub reason: Option<String>,
}

impl Marker {
    pub fn new(kind: MarkerKind, agent: &str) -> Self {
        Self {
            kind,
            agent: agent.to_string(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// First marker found in a comment body.
    pub fn parse(body: &str) -> Option<Self> {
        let caps = MARKER_RE.as_ref()?.captures(body)?;
        Some(Self {
            kind: MarkerKind::parse(caps.get(1)?.as_str())?,
            agent: caps.get(2)?.as_str().to_string(),
            reason: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<!-- conductor:{} agent={}", self.kind.as_str(), self.agent)?;
        if let Some(ref reason) = self.reason {
            write!(f, " reason={reason}")?;
        }
        f.write_str(" -->")
    }
}

/// A marker together with when it was posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub marker: Marker,
    pub at: DateTime<Utc>,
}

/// Marker events in posting order. Ties keep comment order.
pub fn events(comments: &[Comment]) -> Vec<Event> {
    let mut events: Vec<Event> = comments
        .iter()
        .filter_map(|c| {
            Marker::parse(&c.body).map(|marker| Event {
                marker,
                at: c.created_at,
            })
        })
        .collect();
    events.sort_by_key(|e| e.at);
    events
}

/// Events since the most recent release/complete marker.
pub fn current_window(events: &[Event]) -> &[Event] {
    let start = events
        .iter()
        .rposition(|e| e.marker.kind.ends_claim())
        .map_or(0, |i| i + 1);
    &events[start..]
}

/// Agent id of the earliest claim marker in the current window.
pub fn holder(events: &[Event]) -> Option<&str> {
    current_window(events)
        .iter()
        .find(|e| e.marker.kind == MarkerKind::Claim)
        .map(|e| e.marker.agent.as_str())
}

/// Rebuild the claim on an issue, if it has one.
///
/// No assignee means no claim, whatever the comments say.
pub fn reconstruct(
    issue: &Issue,
    comments: &[Comment],
    assigned_at: Option<DateTime<Utc>>,
) -> Option<Claim> {
    if issue.assignees.is_empty() {
        return None;
    }
    let events = events(comments);
    let window = current_window(&events);
    let claim_event = window.iter().find(|e| e.marker.kind == MarkerKind::Claim);

    let agent = match claim_event {
        Some(e) => e.marker.agent.clone(),
        None => issue.assignees.join(","),
    };
    let last_marker = claim_event.and_then(|_| {
        window
            .iter()
            .filter(|e| e.marker.kind.is_liveness() && e.marker.agent == agent)
            .map(|e| e.at)
            .max()
    });
    let last_heartbeat = last_marker.or(assigned_at).unwrap_or(issue.updated_at);

    Some(Claim {
        task: issue.number,
        title: issue.title.clone(),
        agent,
        assignees: issue.assignees.clone(),
        claimed_at: claim_event.map(|e| e.at).or(assigned_at),
        last_heartbeat,
    })
}
