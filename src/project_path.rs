//! Mapping between transcript paths and project working directories.
//!
//! Claude Code stores transcripts at
//! `~/.claude/projects/<slug>/<session-id>.jsonl`, where `<slug>` is the
//! absolute working directory with every `/` replaced by `-`
//! (`/home/mike/Warren` becomes `-home-mike-Warren`). This module reverses
//! that encoding so a transcript can be matched against the working
//! directory of a running process.

use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Name of the directory that holds one sub-directory per project slug.
const PROJECTS_DIR_NAME: &str = "projects";

/// Character that stands in for a path separator inside a slug.
const SLUG_SEPARATOR: char = '-';

// ---------------------------------------------------------------------------
// Base directory
// ---------------------------------------------------------------------------

/// Return `~/.claude/projects/`, or `None` if the home directory is unknown.
pub fn claude_projects_base() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join(PROJECTS_DIR_NAME))
}

// ---------------------------------------------------------------------------
// Slug decoding
// ---------------------------------------------------------------------------

/// Decode a project slug back into an absolute path.
///
/// The encoding is lossy for directory names that themselves contain `-`;
/// callers must check that the result exists.
pub fn decode_slug(slug: &str) -> PathBuf {
    PathBuf::from(slug.replace(SLUG_SEPARATOR, "/"))
}

/// Recover the project working directory from a transcript path.
///
/// Returns `None` when the transcript is not laid out as
/// `.../projects/<slug>/<file>`, when the slug is empty, or when the
/// decoded directory does not exist. `None` tells the caller it cannot
/// match on directory and should fall back to a coarser check.
pub fn project_dir_from_transcript(transcript_path: &Path) -> Option<PathBuf> {
    let slug_dir = transcript_path.parent()?;
    let projects_dir = slug_dir.parent()?;
    if projects_dir.file_name()? != PROJECTS_DIR_NAME {
        return None;
    }

    let slug = slug_dir.file_name()?.to_str()?;
    if slug.is_empty() {
        return None;
    }

    let candidate = decode_slug(slug);
    if candidate.is_dir() {
        Some(candidate)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
