//! Liveness checks: is a Claude Code process still working on a transcript?
//!
//! The tracker asks a [`LivenessOracle`] before declaring an idle session
//! finished. The default oracle, [`ProcessTableOracle`], scans the OS
//! process table. Tests swap in a closure returning a fixed answer.

use std::ffi::OsStr;
use std::path::Path;

use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::trace;

use crate::project_path::project_dir_from_transcript;

/// Default name of the assistant binary to look for.
pub const DEFAULT_ASSISTANT_BINARY: &str = "claude";

// ---------------------------------------------------------------------------
// Oracle trait
// ---------------------------------------------------------------------------

/// Answers whether an owning process for a transcript is still running.
///
/// Implementations must be side-effect free and cheap enough to call while
/// the tracker holds its bookkeeping lock (a local process-table scan, never
/// network I/O).
pub trait LivenessOracle: Send + Sync {
    fn is_live(&self, transcript_path: &Path) -> bool;
}

impl<F> LivenessOracle for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_live(&self, transcript_path: &Path) -> bool {
        self(transcript_path)
    }
}

// ---------------------------------------------------------------------------
// Process-table oracle
// ---------------------------------------------------------------------------

/// Scans running processes for the assistant binary.
///
/// A process counts as the assistant when its name, or the base name of any
/// command-line argument, is the binary name or starts with `<binary>-`.
/// When the transcript path encodes an existing project directory, only an
/// assistant process whose working directory is that directory keeps the
/// session alive. Otherwise any assistant process does.
#[derive(Debug, Clone)]
pub struct ProcessTableOracle {
    binary: String,
}

impl ProcessTableOracle {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn is_assistant_process(&self, name: &str, cmd: &[String]) -> bool {
        is_assistant_command(&self.binary, name)
            || cmd.iter().any(|arg| {
                Path::new(arg)
                    .file_name()
                    .and_then(OsStr::to_str)
                    .is_some_and(|base| is_assistant_command(&self.binary, base))
            })
    }
}

impl Default for ProcessTableOracle {
    fn default() -> Self {
        Self::new(DEFAULT_ASSISTANT_BINARY)
    }
}

impl LivenessOracle for ProcessTableOracle {
    fn is_live(&self, transcript_path: &Path) -> bool {
        let project_dir = project_dir_from_transcript(transcript_path);

        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );

        for (pid, process) in sys.processes() {
            if !self.is_assistant_process(process.name(), process.cmd()) {
                continue;
            }

            let Some(dir) = project_dir.as_deref() else {
                trace!(pid = %pid, path = %transcript_path.display(), "assistant process running");
                return true;
            };

            if process.cwd() == Some(dir) {
                trace!(pid = %pid, cwd = %dir.display(), "assistant process owns project");
                return true;
            }
        }

        false
    }
}

/// `true` if `base` names the assistant binary: exactly `binary`, or
/// `binary` followed by `-` and a suffix (e.g. `claude-code`).
pub fn is_assistant_command(binary: &str, base: &str) -> bool {
    match base.strip_prefix(binary) {
        Some("") => true,
        Some(rest) => rest.starts_with('-'),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
