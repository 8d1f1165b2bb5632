//! Typed label facets.
//!
//! Issues carry a flat set of label strings. Internally a task's labels are a
//! `TaskLabels` value; conversion happens only at the Issue Store boundary.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Small,
    Medium,
    Large,
}

/// Declared in ascending urgency so `Ord` ranks `High` greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Effort {
    pub const fn as_str(self) -> &'static str {
        match self {
            Effort::Small => "small",
            Effort::Medium => "medium",
            Effort::Large => "large",
        }
    }
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl FromStr for Effort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Effort::Small),
            "medium" => Ok(Effort::Medium),
            "large" => Ok(Effort::Large),
            other => Err(format!("unknown effort {other:?}")),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority {other:?}")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the workflow labels under a configurable prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelScheme {
    prefix: String,
}

impl LabelScheme {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn name(&self, facet: &str) -> String {
        format!("{}:{facet}", self.prefix)
    }

    pub fn task(&self) -> String {
        self.name("task")
    }

    pub fn in_progress(&self) -> String {
        self.name("in-progress")
    }

    pub fn blocked(&self) -> String {
        self.name("blocked")
    }

    pub fn archived(&self) -> String {
        self.name("archived")
    }

    pub fn status(&self) -> String {
        self.name("status")
    }

    pub fn alert(&self) -> String {
        self.name("alert")
    }

    /// Every label conductor relies on, with the colors from the original
    /// label set. Skill labels come from the configured roles.
    pub fn specs<'a>(&self, skills: impl IntoIterator<Item = &'a str>) -> Vec<LabelSpec> {
        let mut specs = vec![
            LabelSpec::new(self.task(), "0e8a16", "Tasks for AI agents"),
            LabelSpec::new(self.status(), "1d76db", "System status tracking"),
            LabelSpec::new(self.in_progress(), "fbca04", "Task being worked on"),
            LabelSpec::new(self.blocked(), "d93f0b", "Task is blocked"),
            LabelSpec::new(self.archived(), "c5def5", "Completed and archived"),
            LabelSpec::new(self.alert(), "e11d21", "System health alert"),
            LabelSpec::new("effort:small".into(), "76d7c4", "Small effort task"),
            LabelSpec::new("effort:medium".into(), "f39c12", "Medium effort task"),
            LabelSpec::new("effort:large".into(), "e74c3c", "Large effort task"),
            LabelSpec::new("priority:low".into(), "c5def5", "Low priority"),
            LabelSpec::new("priority:medium".into(), "fbca04", "Medium priority"),
            LabelSpec::new("priority:high".into(), "e11d21", "High priority"),
        ];
        let skills: BTreeSet<&str> = skills.into_iter().collect();
        for skill in skills {
            specs.push(LabelSpec::new(
                format!("skill:{skill}"),
                "7057ff",
                &format!("Requires {skill} skills"),
            ));
        }
        specs
    }
}

/// A label definition to create on the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelSpec {
    pub name: String,
    pub color: String,
    pub description: String,
}

impl LabelSpec {
    fn new(name: String, color: &str, description: &str) -> Self {
        Self {
            name,
            color: color.to_string(),
            description: description.to_string(),
        }
    }
}

/// Structured view of an issue's labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskLabels {
    pub is_task: bool,
    pub in_progress: bool,
    pub blocked: bool,
    pub archived: bool,
    pub status: bool,
    pub effort: Option<Effort>,
    pub priority: Option<Priority>,
    pub skills: BTreeSet<String>,
    /// Labels conductor does not interpret; kept for the round trip.
    pub other: BTreeSet<String>,
}

impl TaskLabels {
    pub fn parse<S: AsRef<str>>(scheme: &LabelScheme, labels: &[S]) -> Self {
        let mut parsed = Self::default();
        for label in labels {
            let label = label.as_ref();
            if label == scheme.task() {
                parsed.is_task = true;
            } else if label == scheme.in_progress() {
                parsed.in_progress = true;
            } else if label == scheme.blocked() {
                parsed.blocked = true;
            } else if label == scheme.archived() {
                parsed.archived = true;
            } else if label == scheme.status() {
                parsed.status = true;
            } else if let Some(effort) = label.strip_prefix("effort:").and_then(|v| v.parse().ok()) {
                parsed.effort = Some(effort);
            } else if let Some(priority) = label.strip_prefix("priority:").and_then(|v| v.parse().ok()) {
                parsed.priority = Some(priority);
            } else if let Some(skill) = label.strip_prefix("skill:").filter(|s| !s.is_empty()) {
                parsed.skills.insert(skill.to_string());
            } else {
                parsed.other.insert(label.to_string());
            }
        }
        parsed
    }

    /// Render back to the flat label set, in a stable order.
    pub fn to_labels(&self, scheme: &LabelScheme) -> Vec<String> {
        let mut labels = Vec::new();
        if self.is_task {
            labels.push(scheme.task());
        }
        if self.in_progress {
            labels.push(scheme.in_progress());
        }
        if self.blocked {
            labels.push(scheme.blocked());
        }
        if self.archived {
            labels.push(scheme.archived());
        }
        if self.status {
            labels.push(scheme.status());
        }
        if let Some(effort) = self.effort {
            labels.push(format!("effort:{}", effort.as_str()));
        }
        if let Some(priority) = self.priority {
            labels.push(format!("priority:{}", priority.as_str()));
        }
        labels.extend(self.skills.iter().map(|s| format!("skill:{s}")));
        labels.extend(self.other.iter().cloned());
        labels
    }

    /// Unlabelled tasks rank as medium priority.
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or(Priority::Medium)
    }
}
