use assert_cmd::Command;
use predicates::prelude::*;

fn conductor(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("conductor").unwrap();
    cmd.current_dir(dir)
        .env_remove("CONDUCTOR_ROLE")
        .env_remove("CONDUCTOR_AGENT_ID")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT");
    cmd
}

#[test]
fn help_lists_agent_commands() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("progress"))
        .stdout(predicate::str::contains("complete"))
        .stdout(predicate::str::contains("monitor"));
}

#[test]
fn schema_describes_config_sections() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("duplicates"))
        .stdout(predicate::str::contains("heartbeat"));
}

#[test]
fn init_writes_commented_config_once() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .args(["init", "--no-labels"])
        .assert()
        .success();

    let written = std::fs::read_to_string(dir.path().join(".conductor.toml")).unwrap();
    assert!(written.starts_with("# Conductor configuration"));
    assert!(written.contains("[heartbeat]"));
    assert!(written.contains("timeout_hours = 168"));

    conductor(dir.path())
        .args(["init", "--no-labels"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("already exists"));

    conductor(dir.path())
        .args(["init", "--no-labels", "--force"])
        .assert()
        .success();
}

#[test]
fn unknown_role_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .args(["start", "astronaut"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("unknown role"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn missing_role_without_terminal_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .arg("start")
        .write_stdin("")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("CONDUCTOR_ROLE"));
}

#[test]
fn invalid_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(".conductor.toml"),
        "[duplicates]\nlikely_threshold = 2.0\n",
    )
    .unwrap();
    conductor(dir.path())
        .arg("tasks")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("likely_threshold"));
}

#[test]
fn progress_outside_worktree_needs_a_task() {
    let dir = tempfile::tempdir().unwrap();
    conductor(dir.path())
        .arg("progress")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("not inside an agent worktree"));
}
