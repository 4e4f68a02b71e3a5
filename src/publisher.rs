//! Completion events.
//!
//! Each completed session is wrapped in an event envelope, enriched with
//! its owning task from the [`TaskRegistry`], and written as one JSON line
//! to the output sink (stdout or an append-only file).

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::registry::{NoRegistry, TaskRegistry};
use crate::transcript::CompletedSession;

/// Default value of the envelope `source` field.
pub const DEFAULT_SOURCE: &str = "cc-sidecar";

/// Agent type reported for every session.
const AGENT_TYPE: &str = "claude-code";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("could not open output {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write event: {0}")]
    Io(#[from] io::Error),
    #[error("could not serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "cc.session.completed")]
    Completed,
    #[serde(rename = "cc.session.failed")]
    Failed,
}

impl EventType {
    pub fn for_session(session: &CompletedSession) -> Self {
        if session.succeeded() {
            EventType::Completed
        } else {
            EventType::Failed
        }
    }
}

/// Payload of a completion event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionData {
    pub session_id: String,
    pub task_id: String,
    pub owner_uuid: String,
    pub agent_type: &'static str,
    pub transcript_path: String,
    pub files_changed: Vec<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub working_dir: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    pub timestamp: String,
    pub data: SessionData,
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Writes completion events to a line-oriented sink.
pub struct Publisher {
    sink: Mutex<Box<dyn Write + Send>>,
    source: String,
    registry: Box<dyn TaskRegistry>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(sink: Box<dyn Write + Send>, source: impl Into<String>) -> Self {
        Self {
            sink: Mutex::new(sink),
            source: source.into(),
            registry: Box::new(NoRegistry),
        }
    }

    /// Publisher writing to stdout.
    pub fn stdout(source: impl Into<String>) -> Self {
        Self::new(Box::new(io::stdout()), source)
    }

    /// Publisher appending to `path`, creating the file if needed.
    pub fn append_to(path: &Path, source: impl Into<String>) -> Result<Self, PublishError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| PublishError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(Box::new(file), source))
    }

    /// Enrich events with task mappings from `registry`.
    pub fn with_registry(mut self, registry: impl TaskRegistry + 'static) -> Self {
        self.registry = Box::new(registry);
        self
    }

    /// Build the event for `session`, looking up its owning task.
    pub fn event_for(&self, session: &CompletedSession) -> Event {
        let mapping = self.registry.lookup(&session.session_id).unwrap_or_default();
        let now = Utc::now();

        Event {
            id: Uuid::new_v4().to_string(),
            event_type: EventType::for_session(session),
            source: self.source.clone(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: SessionData {
                session_id: session.session_id.clone(),
                task_id: mapping.task_id,
                owner_uuid: mapping.owner_uuid,
                agent_type: AGENT_TYPE,
                transcript_path: session.transcript_path.to_string_lossy().into_owned(),
                files_changed: session.files_changed.iter().cloned().collect(),
                exit_code: session.exit_code,
                duration_ms: session.duration_ms,
                working_dir: session.working_dir.clone().unwrap_or_default(),
                timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        }
    }

    /// Write one event line for `session` and flush it.
    pub fn publish(&self, session: &CompletedSession) -> Result<Event, PublishError> {
        let event = self.event_for(session);
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.write_all(&line)?;
        sink.flush()?;
        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
