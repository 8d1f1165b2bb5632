use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".conductor.toml";
pub const CONFIG_NESTED: &str = ".conductor/config.toml";

/// Find the config file path, preferring `.conductor.toml` over
/// `.conductor/config.toml`. Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("CONDUCTOR_CONFIG") {
        let path = PathBuf::from(explicit);
        return path.exists().then_some(path);
    }
    [CONFIG_TOML, CONFIG_NESTED]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Top-level `.conductor.toml` config. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
    #[serde(default)]
    pub claim: ClaimConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub complete: CompleteConfig,
    #[serde(default)]
    pub duplicates: DuplicatesConfig,
    #[serde(default = "default_roles")]
    pub roles: BTreeMap<String, RoleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: GithubConfig::default(),
            labels: LabelsConfig::default(),
            claim: ClaimConfig::default(),
            retry: RetryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            worktree: WorktreeConfig::default(),
            complete: CompleteConfig::default(),
            duplicates: DuplicatesConfig::default(),
            roles: default_roles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GithubConfig {
    /// `owner/name`; empty uses gh's default for the working directory.
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_assignee")]
    pub assignee: String,
    #[serde(default = "default_gh_timeout")]
    pub gh_timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            repo: String::new(),
            assignee: default_assignee(),
            gh_timeout_secs: default_gh_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LabelsConfig {
    #[serde(default = "default_label_prefix")]
    pub prefix: String,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            prefix: default_label_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClaimConfig {
    #[serde(default = "default_claim_attempts")]
    pub max_attempts: u32,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_claim_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_secs: default_initial_delay(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HeartbeatConfig {
    /// A claim with no heartbeat for longer than this is stale.
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u64,
    /// Cadence of `conductor progress --every` when no value is given.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_hours: default_timeout_hours(),
            interval_minutes: default_interval_minutes(),
        }
    }
}

impl HeartbeatConfig {
    pub fn timeout(&self) -> chrono::Duration {
        i64::try_from(self.timeout_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// `days` as a duration, saturating instead of overflowing.
pub fn days(days: u64) -> chrono::Duration {
    i64::try_from(days)
        .ok()
        .and_then(chrono::Duration::try_days)
        .unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorktreeConfig {
    #[serde(default = "default_worktree_dir")]
    pub dir: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_true")]
    pub fetch: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_context_file")]
    pub context_file: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            dir: default_worktree_dir(),
            base_branch: default_base_branch(),
            remote: default_remote(),
            fetch: true,
            retention_days: default_retention_days(),
            context_file: default_context_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CompleteConfig {
    #[serde(default = "default_true")]
    pub close_issue: bool,
    /// Label added to completion PRs; empty for none.
    #[serde(default = "default_pr_label")]
    pub pr_label: String,
}

impl Default for CompleteConfig {
    fn default() -> Self {
        Self {
            close_issue: true,
            pr_label: default_pr_label(),
        }
    }
}

/// Thresholds and vocabulary for the duplicate checker. The threshold
/// values are tuning knobs, not calibrated constants.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DuplicatesConfig {
    #[serde(default = "default_likely_threshold")]
    pub likely_threshold: f64,
    #[serde(default = "default_possible_threshold")]
    pub possible_threshold: f64,
    #[serde(default = "default_title_weight")]
    pub title_weight: f64,
    /// Groups of interchangeable words; each maps to its first member.
    #[serde(default = "default_synonyms")]
    pub synonyms: Vec<Vec<String>>,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            likely_threshold: default_likely_threshold(),
            possible_threshold: default_possible_threshold(),
            title_weight: default_title_weight(),
            synonyms: default_synonyms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RoleConfig {
    /// Skill tags this role works on. Empty means generalist.
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

// Default value functions for serde
fn default_assignee() -> String { "@me".into() }
fn default_gh_timeout() -> u64 { 60 }
fn default_label_prefix() -> String { "conductor".into() }
fn default_claim_attempts() -> u32 { 5 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_delay() -> u64 { 5 }
fn default_multiplier() -> u32 { 2 }
fn default_timeout_hours() -> u64 { 7 * 24 }
fn default_interval_minutes() -> u64 { 10 }
fn default_worktree_dir() -> String { "worktrees".into() }
fn default_base_branch() -> String { "main".into() }
fn default_remote() -> String { "origin".into() }
fn default_retention_days() -> u64 { 7 }
fn default_context_file() -> String { "TASK_CONTEXT.md".into() }
fn default_pr_label() -> String { "conductor:pr".into() }
fn default_likely_threshold() -> f64 { 0.8 }
fn default_possible_threshold() -> f64 { 0.6 }
fn default_title_weight() -> f64 { 0.7 }
fn default_true() -> bool { true }

fn default_synonyms() -> Vec<Vec<String>> {
    [
        &["add", "implement", "create", "build", "introduce", "support"][..],
        &["auth", "authentication", "login", "signin", "logon", "authenticate", "sso"],
        &["fix", "repair", "resolve", "correct", "bug"],
        &["remove", "delete", "drop", "deprecate"],
        &["update", "upgrade", "bump", "refresh"],
        &["docs", "documentation", "readme", "doc"],
        &["test", "tests", "testing", "spec", "coverage"],
        &["ui", "interface", "frontend", "screen", "page"],
        &["user", "users", "account", "accounts"],
        &["config", "configuration", "settings", "options"],
        &["refactor", "cleanup", "restructure", "simplify"],
        &["speed", "performance", "perf", "optimize", "faster"],
    ]
    .iter()
    .map(|group| group.iter().map(|w| (*w).to_string()).collect())
    .collect()
}

/// Role names end up in branch names (`agent-<role>-<task>`), so they are
/// held to `[a-z0-9][a-z0-9-]*`.
fn is_role_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn role(skills: &[&str], aliases: &[&str]) -> RoleConfig {
    RoleConfig {
        skills: skills.iter().map(|s| (*s).to_string()).collect(),
        aliases: aliases.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn default_roles() -> BTreeMap<String, RoleConfig> {
    BTreeMap::from([
        ("dev".to_string(), role(&[], &["developer", "general"])),
        ("frontend".to_string(), role(&["frontend", "ui", "client"], &["fe", "front"])),
        ("backend".to_string(), role(&["backend", "api", "server"], &["be", "back"])),
        ("devops".to_string(), role(&["devops", "infrastructure"], &["ops"])),
        ("security".to_string(), role(&["security", "vulnerability"], &["sec"])),
        ("ml-engineer".to_string(), role(&["ml", "ai"], &["ml", "ai"])),
        ("ui-designer".to_string(), role(&["ui", "design"], &["design"])),
        ("mobile".to_string(), role(&["mobile", "ios", "android"], &[])),
        ("data".to_string(), role(&["data", "etl", "analytics"], &[])),
    ])
}

impl Config {
    /// Load config from `dir`, falling back to defaults when no file exists.
    pub fn discover(dir: &Path) -> anyhow::Result<Self> {
        match find_config(dir) {
            Some(path) => Self::load(&path),
            None => {
                tracing::debug!(dir = %dir.display(), "no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid .conductor.toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let d = &self.duplicates;
        for (name, value) in [
            ("likely_threshold", d.likely_threshold),
            ("possible_threshold", d.possible_threshold),
            ("title_weight", d.title_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ExitError::Config(format!(
                    "duplicates.{name} must be between 0 and 1, got {value}"
                ))
                .into());
            }
        }
        if d.possible_threshold > d.likely_threshold {
            return Err(ExitError::Config(
                "duplicates.possible_threshold must not exceed likely_threshold".into(),
            )
            .into());
        }
        if self.labels.prefix.trim().is_empty() || self.labels.prefix.contains(':') {
            return Err(ExitError::Config(format!(
                "labels.prefix must be non-empty and contain no ':', got {:?}",
                self.labels.prefix
            ))
            .into());
        }
        if self.roles.is_empty() {
            return Err(ExitError::Config("at least one role must be configured".into()).into());
        }
        for (name, role) in &self.roles {
            for id in std::iter::once(name).chain(&role.aliases) {
                if !is_role_name(id) {
                    return Err(ExitError::Config(format!(
                        "role name {id:?} must be lowercase letters, digits and '-', starting with a letter or digit"
                    ))
                    .into());
                }
            }
        }
        if self.claim.max_attempts == 0 {
            return Err(ExitError::Config("claim.max_attempts must be at least 1".into()).into());
        }
        Ok(())
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        // Use toml_edit to add comments before section headers
        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# Conductor configuration\n# Tasks are GitHub issues; claims are assignments plus marker comments.\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(|item| item.as_table_mut()) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "github", "\n# Repository and identity used for gh calls\n");
        set_table_comment(&mut doc, "labels", "\n# Label namespace (<prefix>:task, <prefix>:in-progress, ...)\n");
        set_table_comment(&mut doc, "retry", "\n# Backoff for transient GitHub failures (5s, 10s, 20s by default)\n");
        set_table_comment(&mut doc, "heartbeat", "\n# Claims without a heartbeat for timeout_hours are reclaimed by `conductor monitor`\n");
        set_table_comment(&mut doc, "worktree", "\n# One worktree per claim at <dir>/agent-<role>-<task>\n");
        set_table_comment(&mut doc, "duplicates", "\n# Duplicate-title heuristic; thresholds are advisory\n");
        set_table_comment(&mut doc, "roles", "\n# Roles and the skill:<name> labels they pick up (empty skills = any task)\n");

        Ok(doc.to_string())
    }

    pub fn retry_policy(&self) -> crate::retry::Backoff {
        crate::retry::Backoff {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_secs(self.retry.initial_delay_secs),
            multiplier: self.retry.multiplier.max(1),
        }
    }

    pub fn gh_timeout(&self) -> Duration {
        Duration::from_secs(self.github.gh_timeout_secs)
    }
}
