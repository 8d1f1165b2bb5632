use std::fs;

use clap::Args;

use super::Session;
use super::labels::{ensure_labels, wanted_labels};
use crate::config::{CONFIG_TOML, Config};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Overwrite an existing .conductor.toml
    #[arg(long)]
    pub force: bool,
    /// Only write the config file; do not create labels on GitHub
    #[arg(long)]
    pub no_labels: bool,
}

impl InitArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let session = Session::load()?;
        let path = session.root().join(CONFIG_TOML);
        if path.exists() && !self.force {
            return Err(ExitError::Other(format!(
                "{} already exists; pass --force to overwrite",
                path.display()
            ))
            .into());
        }

        let config = Config::default();
        fs::write(&path, config.to_toml()?)?;
        tracing::info!(path = %path.display(), "wrote config");
        println!("Wrote {}", path.display());

        if self.no_labels {
            return Ok(());
        }
        let created = ensure_labels(&session.store, &wanted_labels(&session.scheme, &config))?;
        if created.is_empty() {
            println!("Labels already present.");
        } else {
            println!("Created {} label(s).", created.len());
        }
        Ok(())
    }
}
