//! Worktree and sweep behaviour against a real git repository.

use std::path::Path;
use std::process::Command;

use chrono::Utc;
use conductor::claims::{ClaimManager, ClaimOutcome};
use conductor::cleanup::{CleanupJob, SweepAction};
use conductor::config::Config;
use conductor::error::ExitError;
use conductor::model::{AgentIdentity, ClaimState};
use conductor::monitor::HealthMonitor;
use conductor::store::MemoryStore;
use conductor::worktree::WorktreeManager;

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

/// A repository with one commit on `main`.
fn repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
    git(dir.path(), &["add", "README.md"]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);
    dir
}

fn exit_error(err: &anyhow::Error) -> &ExitError {
    err.downcast_ref::<ExitError>().unwrap()
}

#[test]
fn creates_one_worktree_per_task_and_refuses_collisions() {
    if !git_available() {
        return;
    }
    let repo = repo();
    let config = Config::default();
    let manager = WorktreeManager::discover(repo.path(), &config).unwrap();

    let (wt, base) = manager.create("frontend", 42, false).unwrap();
    assert_eq!(base, "main");
    assert_eq!(wt.branch, "agent-frontend-42");
    assert!(wt.path.ends_with("worktrees/agent-frontend-42"));
    assert!(wt.path.join("README.md").exists());

    assert!(manager.collides("frontend", 42));
    assert!(!manager.collides("frontend", 43));
    let err = manager.create("frontend", 42, false).unwrap_err();
    assert!(matches!(exit_error(&err), ExitError::WorktreeCollision { .. }));

    // Another role gets its own directory for the same task
    let (other, _) = manager.create("backend", 42, false).unwrap();
    assert_ne!(other.path, wt.path);

    let listed = manager.agent_worktrees().unwrap();
    assert_eq!(listed.len(), 2);
    let here = manager.current(&wt.path).unwrap().unwrap();
    assert_eq!((here.role.as_str(), here.task), ("frontend", 42));
    assert!(manager.current(repo.path()).unwrap().is_none());

    // The main checkout stays clean
    let status = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(repo.path())
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());
}

#[test]
fn dirty_worktree_needs_force() {
    if !git_available() {
        return;
    }
    let repo = repo();
    let config = Config::default();
    let manager = WorktreeManager::discover(repo.path(), &config).unwrap();
    let (wt, _) = manager.create("dev", 7, false).unwrap();

    std::fs::write(wt.path.join(&config.worktree.context_file), "context").unwrap();
    assert!(!manager.is_dirty(&wt.path).unwrap());

    std::fs::write(wt.path.join("README.md"), "changed\n").unwrap();
    assert!(manager.is_dirty(&wt.path).unwrap());

    let err = manager.remove(&wt.path, false).unwrap_err();
    assert!(matches!(exit_error(&err), ExitError::DirtyWorktree { .. }));
    assert!(wt.path.exists());

    manager.remove(&wt.path, true).unwrap();
    assert!(!wt.path.exists());
    manager.delete_branch(&wt.branch).unwrap();
    assert!(!manager.branch_exists(&wt.branch).unwrap());
}

#[test]
fn sweep_removes_unclaimed_idle_worktrees() {
    if !git_available() {
        return;
    }
    let repo = repo();
    let config = Config::default();
    let manager = WorktreeManager::discover(repo.path(), &config).unwrap();
    let (wt, _) = manager.create("dev", 3, false).unwrap();

    let store = MemoryStore::new("bot");
    let job = CleanupJob::new(&store, &manager, &config);
    let later = Utc::now() + chrono::Duration::hours(1);

    let preview = job.sweep_worktrees(0, true, later).unwrap();
    assert_eq!(preview.items.len(), 1);
    assert_eq!(preview.items[0].action, SweepAction::Remove);
    assert!(preview.removed.is_empty());
    assert!(wt.path.exists());

    // Within the retention window nothing goes
    let kept = job.sweep_worktrees(7, false, later).unwrap();
    assert_eq!(kept.items[0].action, SweepAction::Keep);
    assert!(wt.path.exists());

    let swept = job.sweep_worktrees(0, false, later).unwrap();
    assert_eq!(swept.removed.len(), 1);
    assert!(swept.errors.is_empty());
    assert!(!wt.path.exists());
    assert!(!manager.branch_exists("agent-dev-3").unwrap());
}

#[test]
fn reclaimed_task_loses_its_worktree_while_active_one_keeps_it() {
    if !git_available() {
        return;
    }
    let repo = repo();
    let config = Config::default();
    let manager = WorktreeManager::discover(repo.path(), &config).unwrap();
    let store = MemoryStore::new("bot");
    store.set_now(Utc::now());
    let quiet = store.seed("Fix login redirect", &["conductor:task"]);
    let busy = store.seed("Add dark mode", &["conductor:task"]);

    let claims = ClaimManager::new(&store, &config, "bot");
    let first = AgentIdentity::new("dev", "aaaaaa");
    let second = AgentIdentity::new("dev", "bbbbbb");
    for (task, agent) in [(quiet, &first), (busy, &second)] {
        let outcome = claims.claim(task, agent, Some(&format!("agent-dev-{task}"))).unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)), "{outcome:?}");
    }
    let (quiet_wt, _) = manager.create("dev", quiet, false).unwrap();
    let (busy_wt, _) = manager.create("dev", busy, false).unwrap();

    store.advance(chrono::Duration::days(8));
    claims.heartbeat(busy, &second, Some("still going")).unwrap();

    let scan = HealthMonitor::new(&store, &config).scan(store.now(), false).unwrap();
    assert!(scan.errors.is_empty(), "{:?}", scan.errors);
    let states: Vec<_> = scan.claims.iter().map(|c| (c.task, c.state)).collect();
    assert!(states.contains(&(quiet, ClaimState::Reclaimed)), "{states:?}");
    assert!(states.contains(&(busy, ClaimState::Active)), "{states:?}");
    assert!(store.snapshot(quiet).unwrap().assignees.is_empty());

    let job = CleanupJob::new(&store, &manager, &config);
    let swept = job.sweep_worktrees(7, false, store.now()).unwrap();
    assert!(swept.errors.is_empty(), "{:?}", swept.errors);
    assert_eq!(swept.removed.len(), 1);
    assert!(swept.removed[0].ends_with(format!("agent-dev-{quiet}")));

    assert!(!quiet_wt.path.exists());
    assert!(!manager.branch_exists(&quiet_wt.branch).unwrap());
    assert!(busy_wt.path.exists());
    assert!(manager.branch_exists(&busy_wt.branch).unwrap());
    assert!(!manager.collides("dev", quiet));
}
