use std::collections::BTreeSet;

use clap::{Args, Subcommand};
use serde::Serialize;

use super::labels::ensure_labels;
use super::{OutputFormat, Session, print_json};
use crate::duplicates::{DuplicateChecker, DuplicateMatch, Verdict};
use crate::error::ExitError;
use crate::labels::{Effort, LabelScheme, LabelSpec, Priority, TaskLabels};
use crate::store::{IssueStore, NewIssue};

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Create a task issue after checking for duplicates
    Create(TaskCreateArgs),
}

impl TaskCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            TaskCommand::Create(args) => args.execute(),
        }
    }
}

#[derive(Debug, Args)]
pub struct TaskCreateArgs {
    #[arg(long)]
    pub title: String,
    #[arg(long, default_value = "")]
    pub body: String,
    #[arg(long, value_enum)]
    pub effort: Option<Effort>,
    #[arg(long, value_enum)]
    pub priority: Option<Priority>,
    /// Skill tag (repeatable), e.g. --skill frontend
    #[arg(long = "skill")]
    pub skills: Vec<String>,
    /// Create even when a likely duplicate exists
    #[arg(long)]
    pub force: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct CreateReport {
    number: u64,
    labels: Vec<String>,
    similar: Vec<DuplicateMatch>,
}

impl TaskCreateArgs {
    fn skills(&self) -> BTreeSet<String> {
        self.skills
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn labels(&self, scheme: &LabelScheme) -> Vec<String> {
        TaskLabels {
            is_task: true,
            effort: self.effort,
            priority: self.priority,
            skills: self.skills(),
            ..TaskLabels::default()
        }
        .to_labels(scheme)
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        if self.title.trim().is_empty() {
            return Err(ExitError::Other("--title must not be empty".into()).into());
        }
        let session = Session::load()?;

        let checker = DuplicateChecker::new(&session.config.duplicates);
        let similar = checker.check_store(&session.store, &session.scheme, &self.title)?;
        if let Some(likely) = similar.iter().find(|m| m.verdict == Verdict::Likely) {
            if !self.force {
                return Err(ExitError::Other(format!(
                    "likely duplicate of #{} {:?} (score {:.2}); pass --force to create anyway",
                    likely.number, likely.title, likely.similarity.score
                ))
                .into());
            }
            tracing::warn!(duplicate = likely.number, "creating task despite likely duplicate");
        }
        for m in similar.iter().filter(|m| m.verdict == Verdict::Possible) {
            eprintln!("note: possibly related to #{} {} ({:.2})", m.number, m.title, m.similarity.score);
        }

        let labels = self.labels(&session.scheme);
        let skills = self.skills();
        let wanted: Vec<LabelSpec> = session
            .scheme
            .specs(skills.iter().map(String::as_str))
            .into_iter()
            .filter(|spec| labels.contains(&spec.name))
            .collect();
        ensure_labels(&session.store, &wanted)?;

        let number = session.store.create_issue(&NewIssue {
            title: self.title.trim().to_string(),
            body: self.body.clone(),
            labels: labels.clone(),
        })?;
        tracing::info!(task = number, "created task");

        let report = CreateReport { number, labels, similar };
        match format {
            OutputFormat::Pretty => println!("Created task #{} {}", report.number, self.title.trim()),
            OutputFormat::Text => println!("{}", report.number),
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_include_task_and_facets() {
        let args = TaskCreateArgs {
            title: "Add dark mode".into(),
            body: String::new(),
            effort: Some(Effort::Small),
            priority: Some(Priority::High),
            skills: vec!["Frontend".into(), " ".into()],
            force: false,
            format: None,
        };
        let labels = args.labels(&LabelScheme::new("conductor"));
        assert_eq!(
            labels,
            vec!["conductor:task", "effort:small", "priority:high", "skill:frontend"]
        );
    }
}
