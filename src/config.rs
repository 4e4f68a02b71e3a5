use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::cli::Cli;
use crate::liveness::DEFAULT_ASSISTANT_BINARY;
use crate::project_path::claude_projects_base;
use crate::publisher::DEFAULT_SOURCE;
use crate::tracker::TrackerConfig;

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

pub const ENV_WATCH_DIR: &str = "CC_SIDECAR_WATCH_DIR";
pub const ENV_IDLE_THRESHOLD: &str = "CC_SIDECAR_IDLE_THRESHOLD";
pub const ENV_POLL_INTERVAL: &str = "CC_SIDECAR_POLL_INTERVAL";
pub const ENV_OUTPUT: &str = "CC_SIDECAR_OUTPUT";
pub const ENV_REGISTRY_DIR: &str = "CC_SIDECAR_REGISTRY_DIR";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key} {value:?}: {reason}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("cannot determine home directory; pass --watch-dir")]
    NoWatchDir,
}

// ---------------------------------------------------------------------------
// TOML-deserializable config (intermediate representation)
// ---------------------------------------------------------------------------

/// A duration as written in the file: `"10s"` or a bare number of seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_text(self) -> String {
        match self {
            RawDuration::Seconds(n) => n.to_string(),
            RawDuration::Text(s) => s,
        }
    }
}

/// Raw config as parsed from the TOML file.
/// All fields are optional so that missing keys fall through to defaults.
/// Unknown keys are silently ignored by serde.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    watch_dir: Option<String>,
    idle_threshold: Option<RawDuration>,
    poll_interval: Option<RawDuration>,
    eviction_grace: Option<RawDuration>,
    liveness: FileLivenessConfig,
    publish: FilePublishConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileLivenessConfig {
    binary: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FilePublishConfig {
    output: Option<String>,
    source: Option<String>,
    registry_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Effective (merged) config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub watch_dir: PathBuf,
    pub tracker: TrackerConfig,
    pub liveness: LivenessConfig,
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessConfig {
    pub binary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishConfig {
    /// `None` writes to stdout.
    pub output: Option<PathBuf>,
    pub source: String,
    /// `None` disables task enrichment.
    pub registry_dir: Option<PathBuf>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_ASSISTANT_BINARY.to_string(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            output: None,
            source: DEFAULT_SOURCE.to_string(),
            registry_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse `"500ms"`, `"10s"`, `"5m"`, `"1h"` or a bare number of seconds.
/// Zero is rejected.
pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err("expected a number followed by ms, s, m or h");
    }

    let n: u64 = digits.parse().map_err(|_| "number out of range")?;
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.checked_mul(60).ok_or("number out of range")?),
        "h" => Duration::from_secs(n.checked_mul(3600).ok_or("number out of range")?),
        _ => return Err("unknown unit (use ms, s, m or h)"),
    };

    if duration.is_zero() {
        return Err("must be greater than zero");
    }
    Ok(duration)
}

fn parse_duration_field(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|reason| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Returns the default config file path: `~/.config/cc-sidecar/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cc-sidecar").join("config.toml"))
}

/// Expand a leading `~/` against `home`. Other paths are returned as-is.
pub fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => home.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load the config file from the given path.
/// Returns the parsed `FileConfig`, or `None` if the file does not exist
/// or cannot be parsed.
fn load_file_config(path: &Path) -> Option<FileConfig> {
    if !path.exists() {
        return None;
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<FileConfig>(&contents) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse config file");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read config file");
            None
        }
    }
}

/// Build the effective `AppConfig` from defaults, config file, process
/// environment and CLI args.
pub fn build_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    build_config_with(cli, |key| std::env::var(key).ok(), dirs::home_dir().as_deref())
}

/// Like [`build_config`], with injectable environment lookup and home
/// directory.
///
/// Precedence (highest wins):
/// 1. CLI flags (if explicitly provided)
/// 2. Environment variables
/// 3. Config file values
/// 4. Hardcoded defaults
pub fn build_config_with<E>(cli: &Cli, env: E, home: Option<&Path>) -> Result<AppConfig, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    // Step 1: Load the config file
    let config_path = cli.config.clone().or_else(default_config_path);
    let file_cfg = match config_path {
        Some(ref path) => {
            let loaded = load_file_config(path);
            if loaded.is_none() && cli.config.is_some() && !path.exists() {
                warn!(path = %path.display(), "config file not found");
            }
            loaded.unwrap_or_default()
        }
        None => FileConfig::default(),
    };

    // Step 2: Overlay raw values, lowest precedence first
    let mut watch_dir = file_cfg.watch_dir.map(|p| expand_home(&p, home));
    let mut idle_threshold = file_cfg.idle_threshold.map(RawDuration::into_text);
    let mut poll_interval = file_cfg.poll_interval.map(RawDuration::into_text);
    let eviction_grace = file_cfg.eviction_grace.map(RawDuration::into_text);
    let mut output = file_cfg.publish.output.map(|p| expand_home(&p, home));
    let mut registry_dir = file_cfg.publish.registry_dir.map(|p| expand_home(&p, home));

    let env_nonempty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
    if let Some(v) = env_nonempty(ENV_WATCH_DIR) {
        watch_dir = Some(expand_home(&v, home));
    }
    if let Some(v) = env_nonempty(ENV_IDLE_THRESHOLD) {
        idle_threshold = Some(v);
    }
    if let Some(v) = env_nonempty(ENV_POLL_INTERVAL) {
        poll_interval = Some(v);
    }
    if let Some(v) = env_nonempty(ENV_OUTPUT) {
        output = Some(expand_home(&v, home));
    }
    if let Some(v) = env_nonempty(ENV_REGISTRY_DIR) {
        registry_dir = Some(expand_home(&v, home));
    }

    if cli.watch_dir.is_some() {
        watch_dir = cli.watch_dir.clone();
    }
    if cli.idle_threshold.is_some() {
        idle_threshold = cli.idle_threshold.clone();
    }
    if cli.poll_interval.is_some() {
        poll_interval = cli.poll_interval.clone();
    }
    if cli.output.is_some() {
        output = cli.output.clone();
    }
    if cli.registry_dir.is_some() {
        registry_dir = cli.registry_dir.clone();
    }

    // Step 3: Validate and fill defaults
    let mut tracker = TrackerConfig::default();
    if let Some(ref v) = idle_threshold {
        tracker.idle_threshold = parse_duration_field("idle_threshold", v)?;
    }
    if let Some(ref v) = poll_interval {
        tracker.poll_interval = parse_duration_field("poll_interval", v)?;
    }
    if let Some(ref v) = eviction_grace {
        tracker.eviction_grace = parse_duration_field("eviction_grace", v)?;
    }

    let watch_dir = match watch_dir {
        Some(dir) => dir,
        None => home
            .map(|h| h.join(".claude").join("projects"))
            .or_else(claude_projects_base)
            .ok_or(ConfigError::NoWatchDir)?,
    };

    let mut liveness = LivenessConfig::default();
    if let Some(binary) = file_cfg.liveness.binary.filter(|b| !b.is_empty()) {
        liveness.binary = binary;
    }

    let mut publish = PublishConfig {
        output,
        registry_dir,
        ..PublishConfig::default()
    };
    if let Some(source) = file_cfg.publish.source.filter(|s| !s.is_empty()) {
        publish.source = source;
    }

    Ok(AppConfig {
        watch_dir,
        tracker,
        liveness,
        publish,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
