use clap::Args;

use super::{OutputFormat, Session, print_json};
use crate::duplicates::DuplicateChecker;

#[derive(Debug, Args)]
pub struct DupesArgs {
    /// Proposed task title
    pub title: String,
    /// Show at most this many matches
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl DupesArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let checker = DuplicateChecker::new(&session.config.duplicates);
        let mut matches = checker.check_store(&session.store, &session.scheme, &self.title)?;
        matches.truncate(self.limit);

        match format {
            OutputFormat::Pretty => {
                if matches.is_empty() {
                    println!("No similar tasks found.");
                    return Ok(());
                }
                println!("Similar tasks for {:?}:\n", self.title);
                for m in &matches {
                    println!(
                        "  #{:<5} {:>4.0}%  {:<8} {:<6} {}",
                        m.number,
                        m.similarity.score * 100.0,
                        format!("{:?}", m.verdict).to_lowercase(),
                        format!("{:?}", m.state).to_lowercase(),
                        m.title
                    );
                }
            }
            OutputFormat::Text => {
                for m in &matches {
                    println!(
                        "match  number={}  score={:.3}  verdict={:?}  title={}",
                        m.number, m.similarity.score, m.verdict, m.title
                    );
                }
            }
            OutputFormat::Json => print_json(&matches)?,
        }
        Ok(())
    }
}
