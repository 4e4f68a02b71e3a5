//! Session to task lookup.
//!
//! Sessions started on behalf of a task carry an owning task identifier that
//! downstream consumers need in the completion event. The mapping lives in
//! a small key-value store keyed by session id. Ad-hoc sessions have no
//! entry, which is the normal case and not an error.

use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The task that owns a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskMapping {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub owner_uuid: String,
}

/// Looks up the task mapping for a session id.
pub trait TaskRegistry: Send + Sync {
    fn lookup(&self, session_id: &str) -> Option<TaskMapping>;
}

/// Registry with no entries. Used when no store is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegistry;

impl TaskRegistry for NoRegistry {
    fn lookup(&self, _session_id: &str) -> Option<TaskMapping> {
        None
    }
}

/// Directory-backed registry: the value for key `<id>` is the JSON file
/// `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct DirRegistry {
    dir: PathBuf,
}

impl DirRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, session_id: &str) -> Option<PathBuf> {
        if !is_safe_key(session_id) {
            return None;
        }
        Some(self.dir.join(format!("{}.json", session_id)))
    }
}

impl TaskRegistry for DirRegistry {
    fn lookup(&self, session_id: &str) -> Option<TaskMapping> {
        let Some(path) = self.key_path(session_id) else {
            warn!(session_id, "refusing registry lookup for unsafe session id");
            return None;
        };

        let contents = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(session_id, "no task mapping for session");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read task mapping");
                return None;
            }
        };

        match serde_json::from_slice::<TaskMapping>(&contents) {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed task mapping");
                None
            }
        }
    }
}

/// A session id is usable as a file name only if it cannot leave the
/// registry directory.
fn is_safe_key(session_id: &str) -> bool {
    !session_id.is_empty()
        && !session_id.contains(['/', '\\', '\0'])
        && !session_id.contains("..")
}
