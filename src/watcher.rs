//! Filesystem watching for Claude Code transcripts.
//!
//! Uses the `notify` crate to watch the projects directory recursively and
//! reports every write or creation of a `.jsonl` file to a [`Toucher`]
//! (normally the session tracker). The watcher does no reading of its own;
//! it only tells the tracker that a transcript is still being written.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transcript::TRANSCRIPT_EXTENSION;

/// How often the bridge loop checks the stop flag while no events arrive.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Toucher
// ---------------------------------------------------------------------------

/// Receives one call per observed write to a transcript file.
pub trait Toucher: Send + Sync {
    fn touch(&self, path: &Path);
}

// ---------------------------------------------------------------------------
// WatcherError
// ---------------------------------------------------------------------------

/// Errors that can occur when setting up the file watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("watch directory not found: {}", .0.display())]
    WatchDirNotFound(PathBuf),
}

// ---------------------------------------------------------------------------
// WatcherHandle
// ---------------------------------------------------------------------------

/// Handle for cleanly shutting down the file watcher.
///
/// Without it the `spawn_blocking` thread would keep waiting on the notify
/// channel and hold the tokio runtime open.
#[derive(Debug)]
pub struct WatcherHandle {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signal the watcher loop to stop and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "watcher loop ended abnormally");
        }
    }
}

// ---------------------------------------------------------------------------
// Event filtering
// ---------------------------------------------------------------------------

/// Returns `true` if the path has a `.jsonl` extension.
pub fn is_watched_jsonl(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(TRANSCRIPT_EXTENSION)
}

/// Returns `true` for event kinds that mean the file content changed.
///
/// Metadata-only changes (permissions, timestamps), renames and reads are
/// ignored.
fn is_write_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

/// Validate that a path, after resolving symlinks, is still within the
/// watched directory. Returns `Some(canonical)` if valid, `None` otherwise.
fn validate_path_within_dir(path: &Path, watched_dir: &Path) -> Option<PathBuf> {
    match path.canonicalize() {
        Ok(canonical) if canonical.starts_with(watched_dir) => Some(canonical),
        Ok(canonical) => {
            warn!(
                path = %path.display(),
                resolved = %canonical.display(),
                "ignoring transcript outside watched directory"
            );
            None
        }
        Err(e) => {
            // Deleted between the event and validation.
            debug!(path = %path.display(), error = %e, "could not canonicalize");
            None
        }
    }
}

/// Forward the transcript paths of a single notify event to `toucher`.
fn process_notify_event(event: &Event, toucher: &dyn Toucher, watched_dir: &Path) {
    if !is_write_event(&event.kind) {
        return;
    }

    for path in &event.paths {
        if !is_watched_jsonl(path) {
            continue;
        }
        if let Some(validated) = validate_path_within_dir(path, watched_dir) {
            toucher.touch(&validated);
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher entry point
// ---------------------------------------------------------------------------

/// Start watching `watch_dir` recursively for transcript writes.
///
/// Sets up a `notify::RecommendedWatcher` and bridges its synchronous
/// channel on a blocking task that calls `toucher.touch` for each accepted
/// path. Project directories created later are covered by recursive mode.
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `WatcherError::WatchDirNotFound` if the directory does not exist,
/// or `WatcherError::Notify` if the watcher cannot be created.
pub fn start_watching(
    watch_dir: PathBuf,
    toucher: Arc<dyn Toucher>,
) -> Result<WatcherHandle, WatcherError> {
    if !watch_dir.is_dir() {
        return Err(WatcherError::WatchDirNotFound(watch_dir));
    }

    // Canonicalize the watched directory for consistent symlink comparison.
    let canonical_dir = watch_dir
        .canonicalize()
        .map_err(|_| WatcherError::WatchDirNotFound(watch_dir.clone()))?;

    let (notify_tx, notify_rx) = std::sync::mpsc::channel::<Result<Event, notify::Error>>();

    let mut watcher = notify::RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let _ = notify_tx.send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(&canonical_dir, RecursiveMode::Recursive)?;
    debug!(dir = %canonical_dir.display(), "watching for transcript writes");

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::task::spawn_blocking(move || {
        // Keep the watcher alive for the lifetime of this task
        let _watcher = watcher;

        loop {
            match notify_rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(Ok(event)) => process_notify_event(&event, toucher.as_ref(), &canonical_dir),
                Ok(Err(e)) => warn!(error = %e, "filesystem watcher error"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if shutdown_flag.load(Ordering::SeqCst) {
                break;
            }
        }
        debug!("watcher loop stopped");
    });

    Ok(WatcherHandle { shutdown, handle })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
