use clap::Parser;
use std::path::PathBuf;

/// Detect finished Claude Code sessions and emit one event per completion
#[derive(Parser, Debug, Default)]
#[command(
    name = "cc-sidecar",
    version,
    about = "Detect finished Claude Code sessions and emit one event per completion"
)]
pub struct Cli {
    /// Path to config file.
    /// Default: ~/.config/cc-sidecar/config.toml
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding Claude Code transcripts (watched recursively).
    /// Default: ~/.claude/projects
    #[arg(long)]
    pub watch_dir: Option<PathBuf>,

    /// How long a transcript must be silent before its session can
    /// complete, e.g. "10s", "500ms", "2m"
    #[arg(long)]
    pub idle_threshold: Option<String>,

    /// How often tracked transcripts are checked, e.g. "15s"
    #[arg(long)]
    pub poll_interval: Option<String>,

    /// Append events to this file instead of writing them to stdout
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Directory of <session-id>.json task mappings used to enrich events
    #[arg(long)]
    pub registry_dir: Option<PathBuf>,

    /// Log debug detail to stderr
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}
