//! Transcript parsing for finished Claude Code sessions.
//!
//! A transcript is an append-only JSONL file. [`parse_transcript`] scans it
//! once, front to back, and folds every readable line into a
//! [`CompletedSession`]: the session id, the working directory, the wall-clock
//! span between the earliest and latest timestamps, the files the assistant
//! wrote or edited, and a success/failure heuristic.
//!
//! Parsing is best-effort. Malformed lines are skipped, a read error or an
//! oversized line ends the scan early, and whatever was gathered up to that
//! point is still reported.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::log_entry::{parse_jsonl_line, EntryType, LogEntry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest transcript line we are willing to buffer (10 MB).
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// File extension of transcript files, without the dot.
pub const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Length of a canonical hyphenated identifier (8-4-4-4-12).
const SESSION_ID_LEN: usize = 36;

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

// ---------------------------------------------------------------------------
// CompletedSession
// ---------------------------------------------------------------------------

/// Facts extracted from the transcript of a session that has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedSession {
    /// Never empty.
    pub session_id: String,
    pub transcript_path: PathBuf,
    /// Paths passed to `Write`/`Edit` tool calls, deduplicated.
    pub files_changed: BTreeSet<String>,
    /// First `cwd` recorded in the transcript, if any line carried one.
    pub working_dir: Option<String>,
    /// Milliseconds between the earliest and latest parsed timestamps.
    pub duration_ms: u64,
    /// `0` if the assistant said anything at all, `1` otherwise.
    ///
    /// Transcripts carry no exit status. A session without a single
    /// assistant message most likely crashed or never started, so that is
    /// the only case reported as a failure.
    pub exit_code: i32,
}

impl CompletedSession {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// Single-pass accumulator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TranscriptScan {
    session_id: Option<String>,
    working_dir: Option<String>,
    earliest: Option<DateTime<FixedOffset>>,
    latest: Option<DateTime<FixedOffset>>,
    has_assistant: bool,
    files_changed: BTreeSet<String>,
}

impl TranscriptScan {
    fn observe(&mut self, entry: LogEntry) {
        if self.session_id.is_none() {
            self.session_id = entry.session_id.filter(|id| !id.is_empty());
        }
        if self.working_dir.is_none() {
            self.working_dir = entry.cwd.filter(|cwd| !cwd.is_empty());
        }

        if let Some(ts) = entry
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        {
            if self.earliest.map_or(true, |e| ts < e) {
                self.earliest = Some(ts);
            }
            if self.latest.map_or(true, |l| ts > l) {
                self.latest = Some(ts);
            }
        }

        if entry.entry_type == EntryType::Assistant {
            self.has_assistant = true;
        }

        if let Some(message) = entry.message.as_ref().filter(|m| m.is_assistant()) {
            self.files_changed
                .extend(message.written_paths().map(str::to_owned));
        }
    }

    fn duration_ms(&self) -> u64 {
        match (self.earliest, self.latest) {
            (Some(first), Some(last)) => {
                u64::try_from((last - first).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn finish(self, path: &Path) -> Option<CompletedSession> {
        let duration_ms = self.duration_ms();
        let session_id = match self.session_id {
            Some(id) => id,
            None => session_id_from_path(path)?,
        };

        Some(CompletedSession {
            session_id,
            transcript_path: path.to_path_buf(),
            files_changed: self.files_changed,
            working_dir: self.working_dir,
            duration_ms,
            exit_code: if self.has_assistant { 0 } else { 1 },
        })
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a transcript file into a [`CompletedSession`].
///
/// Returns `None` when the file cannot be opened or when no session id can
/// be found in the content or derived from the file name.
pub fn parse_transcript(path: &Path) -> Option<CompletedSession> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open transcript");
            return None;
        }
    };

    let mut reader = BufReader::new(file);
    let mut scan = TranscriptScan::default();
    let mut buf = Vec::new();
    let mut skipped = 0usize;

    loop {
        buf.clear();
        // One byte past the cap so an oversized line is detectable.
        let limit = MAX_LINE_BYTES as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "error reading transcript, keeping partial results"
                );
                break;
            }
        }

        let line = trim_line_end(&buf);
        if line.len() > MAX_LINE_BYTES {
            warn!(
                path = %path.display(),
                max_bytes = MAX_LINE_BYTES,
                "transcript line too long, keeping partial results"
            );
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match parse_jsonl_line(line) {
            Ok(entry) => scan.observe(entry),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!(path = %path.display(), skipped, "skipped malformed transcript lines");
    }

    let session = scan.finish(path);
    if session.is_none() {
        warn!(path = %path.display(), "could not determine session id");
    }
    session
}

/// Derive a session id from a transcript file name.
///
/// The `.jsonl` suffix is stripped. If the last 36 characters of what is
/// left form a canonical hyphenated hex identifier, those are returned;
/// otherwise the whole remaining name is returned as is. `None` only when
/// the name is empty.
pub fn session_id_from_path(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_string_lossy();
    let suffix = format!(".{}", TRANSCRIPT_EXTENSION);
    let base = file_name
        .strip_suffix(suffix.as_str())
        .unwrap_or(&file_name);
    if base.is_empty() {
        return None;
    }

    if let Some(tail) = base
        .len()
        .checked_sub(SESSION_ID_LEN)
        .and_then(|start| base.get(start..))
    {
        if is_session_id(tail) {
            return Some(tail.to_string());
        }
    }

    Some(base.to_string())
}

/// `true` if `s` is a canonical 8-4-4-4-12 hex identifier.
pub fn is_session_id(s: &str) -> bool {
    SESSION_ID_RE.is_match(s)
}

fn trim_line_end(buf: &[u8]) -> &[u8] {
    let mut line = buf;
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
