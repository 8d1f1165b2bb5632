use std::collections::BTreeSet;

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, print_json};
use crate::labels::{Effort, Priority};
use crate::model::{Role, Task};

#[derive(Debug, Args)]
pub struct TasksArgs {
    /// Only tasks this role would pick up (default: every claimable task)
    pub role: Option<String>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub number: u64,
    pub title: String,
    pub priority: Priority,
    pub effort: Option<Effort>,
    pub skills: BTreeSet<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            number: task.number,
            title: task.title.clone(),
            priority: task.labels.effective_priority(),
            effort: task.labels.effort,
            skills: task.labels.skills.clone(),
        }
    }
}

impl TaskSummary {
    pub fn line(&self) -> String {
        let mut line = format!("#{:<5} [{}] {}", self.number, self.priority, self.title);
        if let Some(effort) = self.effort {
            line.push_str(&format!("  ({})", effort.as_str()));
        }
        if !self.skills.is_empty() {
            let skills: Vec<&str> = self.skills.iter().map(String::as_str).collect();
            line.push_str(&format!("  skills: {}", skills.join(", ")));
        }
        line
    }
}

/// A role that takes any task.
pub fn any_role() -> Role {
    Role {
        name: "any".into(),
        skills: BTreeSet::new(),
    }
}

impl TasksArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let role = match &self.role {
            Some(name) => Role::resolve(&session.config, name)?,
            None => any_role(),
        };
        let tasks: Vec<TaskSummary> = session
            .claims()?
            .list_claimable(&role)?
            .map(|t| TaskSummary::from(&t))
            .collect();

        match format {
            OutputFormat::Pretty => {
                if tasks.is_empty() {
                    println!("No claimable tasks for role {role}.");
                    return Ok(());
                }
                println!("Claimable tasks for role {role} ({}):\n", tasks.len());
                for task in &tasks {
                    println!("  {}", task.line());
                }
            }
            OutputFormat::Text => {
                for task in &tasks {
                    println!("task  number={}  priority={}  title={}", task.number, task.priority, task.title);
                }
            }
            OutputFormat::Json => print_json(&tasks)?,
        }
        Ok(())
    }
}
