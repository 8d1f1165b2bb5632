//! Worktree Manager: one git worktree and branch per claimed task.
//!
//! Paths and branch names are derived from `(role, task)` alone, so two
//! agents can never end up in the same directory even if claim bookkeeping
//! goes wrong.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::Config;
use crate::error::ExitError;
use crate::subprocess::Tool;
use crate::template::{TaskContext, render_task_context};

static AGENT_BRANCH_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^agent-([a-z0-9][a-z0-9-]*?)-(\d+)$").ok());

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Split `agent-<role>-<task>` into its role and task number.
pub fn parse_branch(name: &str) -> Option<(String, u64)> {
    let caps = AGENT_BRANCH_RE.as_ref()?.captures(name)?;
    let task = caps.get(2)?.as_str().parse().ok()?;
    Some((caps.get(1)?.as_str().to_string(), task))
}

pub fn branch_name(role: &str, task: u64) -> String {
    format!("agent-{role}-{task}")
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub bare: bool,
    pub prunable: bool,
}

/// A worktree that belongs to an agent claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentWorktree {
    pub role: String,
    pub task: u64,
    pub path: PathBuf,
    pub branch: String,
}

pub fn parse_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
                prunable: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
        } else if line == "bare" {
            entry.bare = true;
        } else if line.starts_with("prunable") {
            entry.prunable = true;
        }
    }
    entries.extend(current);
    entries
}

/// Paths from `git status --porcelain`, minus the context file.
fn dirty_paths<'s>(status: &'s str, context_file: &str) -> Vec<&'s str> {
    status
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| l[3..].trim_matches('"'))
        .filter(|p| *p != context_file)
        .collect()
}

/// Main checkout root and shared git dir for the repository containing
/// `cwd`. Works from inside any linked worktree.
pub fn locate_repo(cwd: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let output = Tool::new("git")
        .args(&["rev-parse", "--path-format=absolute", "--git-common-dir"])
        .current_dir(cwd)
        .timeout(GIT_TIMEOUT)
        .run()?;
    if !output.success() {
        return Err(ExitError::Config(format!("{} is not inside a git repository", cwd.display())).into());
    }
    let common_dir = PathBuf::from(output.stdout.trim());
    let repo_root = if common_dir.file_name().is_some_and(|n| n == ".git") {
        common_dir.parent().map_or_else(|| common_dir.clone(), Path::to_path_buf)
    } else {
        common_dir.clone()
    };
    Ok((repo_root, common_dir))
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    common_dir: PathBuf,
    dir: PathBuf,
    base_branch: String,
    remote: String,
    fetch: bool,
    context_file: String,
}

impl WorktreeManager {
    /// Manager for the repository that contains `cwd`.
    pub fn discover(cwd: &Path, config: &Config) -> anyhow::Result<Self> {
        let (repo_root, common_dir) = locate_repo(cwd)?;
        Ok(Self::new(&repo_root, &common_dir, config))
    }

    pub fn new(repo_root: &Path, common_dir: &Path, config: &Config) -> Self {
        let wt = &config.worktree;
        Self {
            repo_root: repo_root.to_path_buf(),
            common_dir: common_dir.to_path_buf(),
            dir: repo_root.join(&wt.dir),
            base_branch: wt.base_branch.clone(),
            remote: wt.remote.clone(),
            fetch: wt.fetch,
            context_file: wt.context_file.clone(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn path_for(&self, role: &str, task: u64) -> PathBuf {
        self.dir.join(branch_name(role, task))
    }

    fn git_in(&self, dir: &Path, args: &[&str]) -> anyhow::Result<String> {
        let output = Tool::new("git")
            .args(args)
            .current_dir(dir)
            .timeout(GIT_TIMEOUT)
            .run_ok()?;
        Ok(output.stdout)
    }

    fn git(&self, args: &[&str]) -> anyhow::Result<String> {
        self.git_in(&self.repo_root, args)
    }

    fn ref_exists(&self, full_ref: &str) -> anyhow::Result<bool> {
        let output = Tool::new("git")
            .args(&["rev-parse", "--verify", "--quiet", full_ref])
            .current_dir(&self.repo_root)
            .timeout(GIT_TIMEOUT)
            .run()?;
        Ok(output.success())
    }

    pub fn branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    /// `<remote>/<base>` when that ref exists, else the local base branch.
    pub fn base_ref(&self, fetch: bool) -> anyhow::Result<String> {
        if fetch && self.fetch {
            if let Err(e) = self.git(&["fetch", &self.remote, &self.base_branch]) {
                tracing::warn!(remote = %self.remote, error = %e, "fetch failed, using local refs");
            }
        }
        let remote_ref = format!("{}/{}", self.remote, self.base_branch);
        if self.ref_exists(&format!("refs/remotes/{remote_ref}"))? {
            Ok(remote_ref)
        } else {
            Ok(self.base_branch.clone())
        }
    }

    /// What already occupies the slot for `(role, task)`, if anything.
    pub fn collision(&self, role: &str, task: u64) -> anyhow::Result<Option<String>> {
        let path = self.path_for(role, task);
        if path.exists() {
            return Ok(Some(path.display().to_string()));
        }
        let branch = branch_name(role, task);
        if self.branch_exists(&branch)? {
            return Ok(Some(format!("branch {branch}")));
        }
        Ok(None)
    }

    /// True when `create` would refuse `(role, task)`. A failed check counts
    /// as free and `create` reports the real error.
    pub fn collides(&self, role: &str, task: u64) -> bool {
        self.collision(role, task).map_or_else(
            |e| {
                tracing::debug!(task, error = %e, "collision check failed");
                false
            },
            |found| found.is_some(),
        )
    }

    /// Create the worktree and branch for `(role, task)`.
    pub fn create(&self, role: &str, task: u64, fetch: bool) -> anyhow::Result<(AgentWorktree, String)> {
        if let Some(path) = self.collision(role, task)? {
            return Err(ExitError::WorktreeCollision { path }.into());
        }
        let path = self.path_for(role, task);
        let branch = branch_name(role, task);

        let base = self.base_ref(fetch)?;
        std::fs::create_dir_all(&self.dir)?;
        self.ensure_excluded()?;

        let path_str = path.to_string_lossy();
        self.git(&["worktree", "add", "-b", &branch, &path_str, &base])?;
        tracing::info!(path = %path.display(), %branch, %base, "created worktree");

        Ok((
            AgentWorktree {
                role: role.to_string(),
                task,
                path,
                branch,
            },
            base,
        ))
    }

    /// Keep the worktree directory and context file out of `git status`.
    fn ensure_excluded(&self) -> anyhow::Result<()> {
        let info = self.common_dir.join("info");
        std::fs::create_dir_all(&info)?;
        let exclude = info.join("exclude");
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();

        let dir_rule = self
            .dir
            .strip_prefix(&self.repo_root)
            .map(|rel| format!("/{}/", rel.display()))
            .ok();
        let context_rule = format!("/{}", self.context_file);

        let mut additions = String::new();
        for rule in dir_rule.iter().chain(std::iter::once(&context_rule)) {
            if !existing.lines().any(|l| l.trim() == rule) {
                additions.push_str(rule);
                additions.push('\n');
            }
        }
        if !additions.is_empty() {
            let mut content = existing;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&additions);
            std::fs::write(&exclude, content)?;
        }
        Ok(())
    }

    pub fn write_context(&self, worktree: &AgentWorktree, ctx: &TaskContext) -> anyhow::Result<PathBuf> {
        let path = worktree.path.join(&self.context_file);
        std::fs::write(&path, render_task_context(ctx)?)?;
        Ok(path)
    }

    /// Uncommitted changes, ignoring the context file.
    pub fn is_dirty(&self, path: &Path) -> anyhow::Result<bool> {
        let status = self.git_in(path, &["status", "--porcelain"])?;
        Ok(!dirty_paths(&status, &self.context_file).is_empty())
    }

    /// True when the branch exists on the remote and has no local commits
    /// beyond it.
    pub fn is_pushed(&self, path: &Path, branch: &str) -> anyhow::Result<bool> {
        let remote_ref = format!("refs/remotes/{}/{branch}", self.remote);
        if !self.ref_exists(&remote_ref)? {
            return Ok(false);
        }
        let ahead = self.git_in(path, &["rev-list", "--count", &format!("{remote_ref}..HEAD")])?;
        Ok(ahead.trim() == "0")
    }

    /// Remove a worktree. Without `force`, refuses when it has changes.
    pub fn remove(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        if !path.exists() {
            self.prune()?;
            return Ok(());
        }
        if !force && self.is_dirty(path)? {
            return Err(ExitError::DirtyWorktree {
                path: path.display().to_string(),
            }
            .into());
        }
        let path_str = path.to_string_lossy();
        // The context file is untracked, so git wants --force for it.
        self.git(&["worktree", "remove", "--force", &path_str])?;
        tracing::info!(path = %path.display(), "removed worktree");
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> anyhow::Result<()> {
        if self.branch_exists(branch)? {
            self.git(&["branch", "-D", branch])?;
            tracing::info!(%branch, "deleted branch");
        }
        Ok(())
    }

    pub fn prune(&self) -> anyhow::Result<()> {
        self.git(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn list(&self) -> anyhow::Result<Vec<WorktreeEntry>> {
        let output = self.git(&["worktree", "list", "--porcelain"])?;
        Ok(parse_porcelain(&output))
    }

    /// Worktrees under the configured directory named like agent branches.
    pub fn agent_worktrees(&self) -> anyhow::Result<Vec<AgentWorktree>> {
        let dir = canonical(&self.dir);
        Ok(self
            .list()?
            .into_iter()
            .filter_map(|entry| {
                let name = entry.path.file_name()?.to_str()?;
                let (role, task) = parse_branch(name)?;
                if canonical(entry.path.parent()?) != dir {
                    return None;
                }
                Some(AgentWorktree {
                    role,
                    task,
                    branch: entry.branch.unwrap_or_else(|| name.to_string()),
                    path: entry.path,
                })
            })
            .collect())
    }

    /// The agent worktree `cwd` is in, if any.
    pub fn current(&self, cwd: &Path) -> anyhow::Result<Option<AgentWorktree>> {
        let Ok(top) = self.git_in(cwd, &["rev-parse", "--show-toplevel"]) else {
            return Ok(None);
        };
        let branch = self.git_in(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let branch = branch.trim();
        Ok(parse_branch(branch).map(|(role, task)| AgentWorktree {
            role,
            task,
            path: PathBuf::from(top.trim()),
            branch: branch.to_string(),
        }))
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Newest modification time under `path`, skipping `.git`.
pub fn last_activity(path: &Path) -> Option<DateTime<Utc>> {
    fn walk(dir: &Path, newest: &mut Option<SystemTime>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name() == ".git" {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if let Ok(modified) = meta.modified() {
                *newest = (*newest).max(Some(modified));
            }
            if meta.is_dir() {
                walk(&entry.path(), newest);
            }
        }
    }

    let mut newest = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    walk(path, &mut newest);
    newest.map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_branches() {
        assert_eq!(parse_branch("agent-frontend-42"), Some(("frontend".into(), 42)));
        assert_eq!(parse_branch("agent-ml-engineer-7"), Some(("ml-engineer".into(), 7)));
        assert_eq!(parse_branch("agent-42"), None);
        assert_eq!(parse_branch("feature/agent-dev-1"), None);
        assert_eq!(parse_branch("main"), None);
    }

    #[test]
    fn derives_deterministic_paths() {
        let config = Config::default();
        let mgr = WorktreeManager::new(Path::new("/repo"), Path::new("/repo/.git"), &config);
        assert_eq!(mgr.path_for("frontend", 42), PathBuf::from("/repo/worktrees/agent-frontend-42"));
        assert_eq!(branch_name("frontend", 42), "agent-frontend-42");
    }

    #[test]
    fn parses_worktree_porcelain() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /repo/worktrees/agent-dev-3\nHEAD def\nbranch refs/heads/agent-dev-3\n\n\
                   worktree /repo/worktrees/agent-dev-9\nHEAD 123\ndetached\nprunable gitdir file points to non-existent location\n";
        let entries = parse_porcelain(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("agent-dev-3"));
        assert!(entries[2].branch.is_none());
        assert!(entries[2].prunable);
    }

    #[test]
    fn context_file_does_not_count_as_dirty() {
        let status = "?? TASK_CONTEXT.md\n";
        assert!(dirty_paths(status, "TASK_CONTEXT.md").is_empty());
        let status = "?? TASK_CONTEXT.md\n M src/lib.rs\n";
        assert_eq!(dirty_paths(status, "TASK_CONTEXT.md"), vec!["src/lib.rs"]);
    }

    #[test]
    fn last_activity_skips_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let seen = last_activity(dir.path()).unwrap();
        assert!(Utc::now() - seen < chrono::Duration::minutes(5));
        assert!(last_activity(&dir.path().join("missing")).is_none());
    }
}
