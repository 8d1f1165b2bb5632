use chrono::Utc;
use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Session, print_json};
use crate::model::ClaimState;
use crate::monitor::{HealthMonitor, ScanReport};

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Classify claims without reclaiming anything
    #[arg(long)]
    pub dry_run: bool,
    /// Skip updating the status issue
    #[arg(long)]
    pub no_status: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct MonitorReport {
    #[serde(flatten)]
    scan: ScanReport,
    status_issue: Option<u64>,
}

impl MonitorArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let session = Session::load()?;
        let monitor = HealthMonitor::new(&session.store, &session.config);

        let scan = monitor.scan(Utc::now(), self.dry_run)?;
        let status_issue = if self.dry_run || self.no_status {
            None
        } else {
            let record = monitor.status_record(&scan)?;
            Some(monitor.update_status_record(&record)?)
        };
        let report = MonitorReport { scan, status_issue };

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => {
                for c in &report.scan.claims {
                    println!(
                        "claim  task={}  agent={}  idle={}  state={}",
                        c.task,
                        c.agent,
                        c.idle,
                        c.state.as_str()
                    );
                }
                for e in &report.scan.errors {
                    println!("error  task={}  message={}", e.task, e.error);
                }
                println!(
                    "summary  active={}  stale={}  reclaimed={}  errors={}",
                    report.scan.count(ClaimState::Active),
                    report.scan.stale(),
                    report.scan.count(ClaimState::Reclaimed),
                    report.scan.errors.len()
                );
            }
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }
}

fn print_pretty(report: &MonitorReport) {
    let scan = &report.scan;
    if scan.dry_run {
        println!("(dry run: nothing was changed)\n");
    }
    if scan.claims.is_empty() {
        println!("No claimed tasks.");
    }
    for c in &scan.claims {
        let mark = match c.state {
            ClaimState::Active => "ok",
            ClaimState::Stale => "STALE",
            ClaimState::Reclaimed => "reclaimed",
        };
        println!("  #{:<5} {:<20} idle {:<8} {mark}", c.task, c.agent, c.idle);
    }
    for e in &scan.errors {
        println!("  #{:<5} failed: {}", e.task, e.error);
    }
    println!(
        "\n{} active, {} stale, {} reclaimed",
        scan.count(ClaimState::Active),
        scan.stale(),
        scan.count(ClaimState::Reclaimed)
    );
    if let Some(number) = report.status_issue {
        println!("Status record: #{number}");
    }
}
