//! Completion detection for Claude Code sessions.
//!
//! Watches transcript files under `~/.claude/projects`, decides when a
//! session has finished (idle transcript and no owning assistant process),
//! and reports each finished session exactly once per idle episode.

pub mod cli;
pub mod config;
pub mod liveness;
pub mod log_entry;
pub mod project_path;
pub mod publisher;
pub mod registry;
pub mod tracker;
pub mod transcript;
pub mod watcher;
