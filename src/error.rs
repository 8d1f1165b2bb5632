use std::process::ExitCode;

/// Errors that cause conductor to exit with a specific code.
///
/// Exit codes: 0 success, 1 nothing to do, 2 transient (retry later),
/// 3 fatal configuration, 4 local state that needs an operator.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("no claimable tasks for role {role}")]
    NoTasks { role: String },

    #[error("{0}")]
    NothingToDo(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("lost the claim race for task #{task}")]
    ClaimConflict { task: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("worktree already exists: {path}")]
    WorktreeCollision { path: String },

    #[error("worktree has uncommitted changes: {path}")]
    DirtyWorktree { path: String },

    #[error("not inside an agent worktree")]
    NotInWorktree,

    #[error("task #{task} is not claimed: {reason}")]
    NoClaim { task: u64, reason: String },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::NoTasks { .. } | ExitError::NothingToDo(_) => ExitCode::from(1),
            ExitError::Transient(_) | ExitError::ClaimConflict { .. } | ExitError::Timeout { .. } => {
                ExitCode::from(2)
            }
            ExitError::Config(_) | ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. }
            | ExitError::WorktreeCollision { .. }
            | ExitError::DirtyWorktree { .. }
            | ExitError::NotInWorktree
            | ExitError::NoClaim { .. }
            | ExitError::Other(_) => ExitCode::from(4),
        }
    }

    /// One-line remediation printed after the error message.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ExitError::NoTasks { .. } => {
                Some("no tasks available; create one with `conductor task create`")
            }
            ExitError::NothingToDo(_) => None,
            ExitError::Transient(_) | ExitError::Timeout { .. } => Some("retry in a few minutes"),
            ExitError::ClaimConflict { .. } => Some("another agent won the race; run `conductor start` again"),
            ExitError::Config(_) => Some("check .conductor.toml and re-authenticate with `gh auth login`"),
            ExitError::ToolNotFound { .. } => Some("install the GitHub CLI (https://cli.github.com) and git"),
            ExitError::ToolFailed { .. } | ExitError::Other(_) => None,
            ExitError::WorktreeCollision { .. } => {
                Some("remove the leftover worktree with `conductor cleanup` or `git worktree remove`")
            }
            ExitError::DirtyWorktree { .. } => Some("commit and push your changes, or pass --force to discard them"),
            ExitError::NotInWorktree => Some("cd into your worktree or pass --task <number>"),
            ExitError::NoClaim { .. } => Some("the claim was released or reclaimed; run `conductor start` again"),
        }
    }

    /// True when a later attempt may succeed without operator action.
    pub const fn is_transient(&self) -> bool {
        matches!(self, ExitError::Transient(_) | ExitError::Timeout { .. })
    }
}

/// Returns true if the error chain carries a transient `ExitError`.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ExitError>()
        .is_some_and(ExitError::is_transient)
}

/// Sort a failed `gh` call into transient, auth/config, or plain tool failure.
pub fn classify_gh_failure(code: i32, stderr: &str) -> ExitError {
    let lower = stderr.to_lowercase();
    let transient_markers = [
        "rate limit",
        "secondary rate",
        "http 500",
        "http 502",
        "http 503",
        "http 504",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "could not resolve host",
        "tls handshake",
        "unexpected eof",
    ];
    let auth_markers = ["gh auth login", "authentication", "http 401", "not logged in", "bad credentials"];

    if auth_markers.iter().any(|m| lower.contains(m)) {
        ExitError::Config(format!("GitHub CLI is not authenticated: {}", stderr.trim()))
    } else if transient_markers.iter().any(|m| lower.contains(m)) {
        ExitError::Transient(stderr.trim().to_string())
    } else {
        ExitError::ToolFailed {
            tool: "gh".to_string(),
            code,
            message: stderr.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_taxonomy() {
        assert_eq!(
            ExitError::NoTasks { role: "dev".into() }.exit_code(),
            ExitCode::from(1)
        );
        assert_eq!(ExitError::Transient("x".into()).exit_code(), ExitCode::from(2));
        assert_eq!(ExitError::ClaimConflict { task: 1 }.exit_code(), ExitCode::from(2));
        assert_eq!(ExitError::Config("x".into()).exit_code(), ExitCode::from(3));
        assert_eq!(
            ExitError::DirtyWorktree { path: "w".into() }.exit_code(),
            ExitCode::from(4)
        );
    }

    #[test]
    fn classify_rate_limit_as_transient() {
        let err = classify_gh_failure(1, "API rate limit exceeded for user");
        assert!(err.is_transient());
        let err = classify_gh_failure(1, "HTTP 502: Bad Gateway (https://api.github.com/graphql)");
        assert!(err.is_transient());
    }

    #[test]
    fn classify_auth_as_config() {
        let err = classify_gh_failure(4, "To get started with GitHub CLI, please run:  gh auth login");
        assert!(matches!(err, ExitError::Config(_)));
    }

    #[test]
    fn classify_other_as_tool_failed() {
        let err = classify_gh_failure(1, "could not add label: 'skill:x' not found");
        assert!(matches!(err, ExitError::ToolFailed { code: 1, .. }));
    }

    #[test]
    fn transient_detection_through_anyhow() {
        let err: anyhow::Error = ExitError::Transient("boom".into()).into();
        assert!(is_transient(&err));
        let err = anyhow::anyhow!("plain");
        assert!(!is_transient(&err));
    }

    #[test]
    fn every_failure_kind_with_operator_action_has_hint() {
        assert!(ExitError::Config("x".into()).hint().is_some());
        assert!(ExitError::NotInWorktree.hint().is_some());
        assert!(ExitError::NoTasks { role: "dev".into() }.hint().unwrap().contains("create one"));
    }
}
