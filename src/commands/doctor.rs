use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use super::labels::wanted_labels;
use super::{OutputFormat, print_json};
use crate::config::{Config, find_config};
use crate::error::ExitError;
use crate::labels::LabelScheme;
use crate::store::{GhStore, IssueStore};
use crate::subprocess::Tool;
use crate::worktree::locate_repo;

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
    pub issues: Vec<String>,
}

impl DoctorReport {
    fn record(&mut self, name: &str, result: Result<String, String>) -> bool {
        let ok = result.is_ok();
        let detail = result.unwrap_or_else(|e| e);
        if !ok {
            self.issues.push(format!("{name}: {detail}"));
        }
        self.checks.push(Check {
            name: name.to_string(),
            ok,
            detail,
        });
        ok
    }
}

fn tool_version(binary: &str) -> Result<String, String> {
    match Tool::new(binary).arg("--version").run() {
        Ok(output) if output.success() => Ok(output.stdout.lines().next().unwrap_or_default().trim().to_string()),
        Ok(output) => Err(output.stderr.trim().to_string()),
        Err(e) => Err(format!("{e:#}")),
    }
}

fn gh_auth() -> Result<String, String> {
    match Tool::new("gh").args(&["auth", "status"]).run() {
        Ok(output) if output.success() => Ok("authenticated".into()),
        Ok(_) => Err("not logged in; run `gh auth login`".into()),
        Err(e) => Err(format!("{e:#}")),
    }
}

fn load_config(root: &Path) -> Result<(Config, String), String> {
    let source = find_config(root).map_or_else(|| "defaults (no config file)".to_string(), |p| p.display().to_string());
    Config::discover(root)
        .map(|config| (config, source))
        .map_err(|e| format!("{e:#}"))
}

fn missing_labels(store: &GhStore, config: &Config) -> Result<String, String> {
    let existing: BTreeSet<String> = store
        .list_labels()
        .map_err(|e| format!("{e:#}"))?
        .into_iter()
        .collect();
    let scheme = LabelScheme::new(&config.labels.prefix);
    let missing: Vec<String> = wanted_labels(&scheme, config)
        .into_iter()
        .map(|spec| spec.name)
        .filter(|name| !existing.contains(name))
        .collect();
    if missing.is_empty() {
        Ok("all present".into())
    } else {
        Err(format!("missing {}; run `conductor labels`", missing.join(", ")))
    }
}

impl DoctorArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let cwd = std::env::current_dir().context("could not determine current directory")?;
        let mut report = DoctorReport {
            checks: Vec::new(),
            issues: Vec::new(),
        };

        report.record("git", tool_version("git"));
        let gh_present = report.record("gh", tool_version("gh"));
        let gh_ready = gh_present && report.record("gh auth", gh_auth());

        let root = match locate_repo(&cwd) {
            Ok((root, _)) => {
                report.record("repository", Ok(root.display().to_string()));
                root
            }
            Err(e) => {
                report.record("repository", Err(format!("{e:#}")));
                cwd
            }
        };

        let config = match load_config(&root) {
            Ok((config, source)) => {
                report.record("config", Ok(source));
                Some(config)
            }
            Err(e) => {
                report.record("config", Err(e));
                None
            }
        };

        if let (Some(config), true) = (&config, gh_ready) {
            let store = GhStore::new(config);
            report.record("labels", missing_labels(&store, config));
        }

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => print_json(&report)?,
        }

        if !report.issues.is_empty() {
            return Err(ExitError::Config(format!("{} check(s) failed", report.issues.len())).into());
        }
        Ok(())
    }
}

fn print_pretty(report: &DoctorReport) {
    println!("=== Conductor Doctor ===\n");
    for check in &report.checks {
        let mark = if check.ok { "✓" } else { "✗" };
        println!("  {mark} {:<11} {}", check.name, check.detail);
    }
    if report.issues.is_empty() {
        println!("\n✓ No issues found");
    } else {
        println!("\nIssues ({}):", report.issues.len());
        for issue in &report.issues {
            println!("  • {issue}");
        }
    }
}

fn print_text(report: &DoctorReport) {
    for check in &report.checks {
        let status = if check.ok { "ok" } else { "fail" };
        println!("check  {}  {status}  {}", check.name, check.detail);
    }
    println!("issues  count={}", report.issues.len());
}
