use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, Target, acting_agent, print_json};
use crate::config::HeartbeatConfig;
use crate::error::{ExitError, is_transient};
use crate::model::AgentIdentity;

#[derive(Debug, Args)]
pub struct ProgressArgs {
    /// Short note included in the heartbeat comment
    #[arg(short, long)]
    pub message: Option<String>,
    /// Task number (defaults to the current worktree's task)
    #[arg(long)]
    pub task: Option<u64>,
    /// Keep posting a heartbeat every MINUTES until interrupted
    /// (defaults to heartbeat.interval_minutes)
    #[arg(long, value_name = "MINUTES", num_args = 0..=1)]
    #[allow(clippy::option_option)]
    pub every: Option<Option<u64>>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct HeartbeatReport {
    task: u64,
    agent: String,
    last_heartbeat: chrono::DateTime<chrono::Utc>,
}

impl ProgressArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let target = session.target(self.task)?;
        let claims = session.claims()?;
        let claim = claims.current_claim(target.task)?.ok_or_else(|| ExitError::NoClaim {
            task: target.task,
            reason: "no assignee".into(),
        })?;
        let agent = acting_agent(&target, &claim);

        let Some(minutes) = self.interval(&session.config.heartbeat) else {
            return self.beat(&session, &target, &agent, format);
        };
        if minutes == 0 {
            return Err(ExitError::Other("--every must be at least 1 minute".into()).into());
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let _ = ctrlc::set_handler(move || {
            flag.store(false, Ordering::SeqCst);
        });

        let interval = Duration::from_secs(minutes.saturating_mul(60));
        while running.load(Ordering::SeqCst) {
            match self.beat(&session, &target, &agent, format) {
                Ok(()) => {}
                Err(e) if is_transient(&e) => {
                    tracing::warn!(task = target.task, error = %e, "heartbeat failed, will retry next interval");
                }
                Err(e) => return Err(e),
            }
            let next = Instant::now() + interval;
            while running.load(Ordering::SeqCst) && Instant::now() < next {
                std::thread::sleep(Duration::from_millis(500));
            }
        }
        eprintln!("stopped heartbeats for #{}", target.task);
        Ok(())
    }

    /// Loop cadence in minutes, or `None` for a single heartbeat.
    fn interval(&self, heartbeat: &HeartbeatConfig) -> Option<u64> {
        self.every.map(|minutes| minutes.unwrap_or(heartbeat.interval_minutes))
    }

    fn beat(&self, session: &Session, target: &Target, agent: &AgentIdentity, format: OutputFormat) -> anyhow::Result<()> {
        let claim = session
            .claims()?
            .heartbeat(target.task, agent, self.message.as_deref())?;
        let report = HeartbeatReport {
            task: claim.task,
            agent: agent.id(),
            last_heartbeat: claim.last_heartbeat,
        };
        match format {
            OutputFormat::Pretty => println!(
                "Heartbeat posted on #{} as {} at {}",
                report.task,
                report.agent,
                report.last_heartbeat.format("%H:%M:%S UTC")
            ),
            OutputFormat::Text => println!(
                "heartbeat  task={}  agent={}  at={}",
                report.task,
                report.agent,
                report.last_heartbeat.to_rfc3339()
            ),
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        args: ProgressArgs,
    }

    fn interval(argv: &[&str]) -> Option<u64> {
        let cli = Cli::try_parse_from(std::iter::once("progress").chain(argv.iter().copied())).unwrap();
        let heartbeat = HeartbeatConfig {
            interval_minutes: 25,
            ..HeartbeatConfig::default()
        };
        cli.args.interval(&heartbeat)
    }

    #[test]
    fn every_without_value_uses_configured_interval() {
        assert_eq!(interval(&["--every"]), Some(25));
        assert_eq!(interval(&["--every", "-m", "still going"]), Some(25));
    }

    #[test]
    fn every_with_value_overrides_config() {
        assert_eq!(interval(&["--every", "3"]), Some(3));
        assert_eq!(interval(&["--every=7"]), Some(7));
    }

    #[test]
    fn no_every_means_one_heartbeat() {
        assert_eq!(interval(&[]), None);
        assert_eq!(interval(&["--task", "12"]), None);
    }
}
