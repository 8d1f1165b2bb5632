//! Conductor - task claiming, worktree isolation and stale-claim reaping
//! for agents sharing a GitHub issue tracker.

pub mod activity;
pub mod claims;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod labels;
pub mod model;
pub mod monitor;
pub mod retry;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod worktree;
