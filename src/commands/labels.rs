use std::collections::BTreeSet;

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, print_json};
use crate::config::Config;
use crate::labels::{LabelScheme, LabelSpec};
use crate::store::IssueStore;

#[derive(Debug, Args)]
pub struct LabelsArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct LabelsReport {
    created: Vec<String>,
    existing: usize,
}

/// Every label the configured roles and workflow need.
pub fn wanted_labels(scheme: &LabelScheme, config: &Config) -> Vec<LabelSpec> {
    scheme.specs(
        config
            .roles
            .values()
            .flat_map(|role| role.skills.iter().map(String::as_str)),
    )
}

/// Create whichever of `specs` the repository lacks. Returns the names created.
pub fn ensure_labels<S: IssueStore + ?Sized>(store: &S, specs: &[LabelSpec]) -> anyhow::Result<Vec<String>> {
    let existing: BTreeSet<String> = store.list_labels()?.into_iter().collect();
    let mut created = Vec::new();
    for spec in specs.iter().filter(|s| !existing.contains(&s.name)) {
        store.create_label(spec)?;
        tracing::info!(label = %spec.name, "created label");
        created.push(spec.name.clone());
    }
    Ok(created)
}

impl LabelsArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let specs = wanted_labels(&session.scheme, &session.config);
        let created = ensure_labels(&session.store, &specs)?;
        let report = LabelsReport {
            existing: specs.len() - created.len(),
            created,
        };

        match format {
            OutputFormat::Pretty => {
                if report.created.is_empty() {
                    println!("All {} labels already exist.", report.existing);
                } else {
                    println!("Created {} label(s):", report.created.len());
                    for name in &report.created {
                        println!("  + {name}");
                    }
                }
            }
            OutputFormat::Text => {
                for name in &report.created {
                    println!("created  label={name}");
                }
                println!("labels  created={}  existing={}", report.created.len(), report.existing);
            }
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn creates_only_missing_labels() {
        let store = MemoryStore::new("bot");
        let config = Config::default();
        let specs = wanted_labels(&LabelScheme::new("conductor"), &config);

        let first = ensure_labels(&store, &specs).unwrap();
        assert_eq!(first.len(), specs.len());
        assert!(first.contains(&"skill:frontend".to_string()));

        assert!(ensure_labels(&store, &specs).unwrap().is_empty());
    }
}
