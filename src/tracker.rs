//! Session completion detection.
//!
//! The [`Tracker`] keeps one small record per transcript file that has been
//! written recently. A periodic sweep decides which of them belong to
//! sessions that have finished: the file must have been silent for at least
//! the idle threshold *and* the [`LivenessOracle`] must report that no
//! assistant process still owns it. Each finished session is parsed and
//! handed to the completion callback once per idle episode.
//!
//! Concurrency model:
//! - a single mutex guards the path -> record map, held only while the map is
//!   read or mutated;
//! - transcripts are parsed and callbacks run after the lock is released, so
//!   slow consumers never block [`Tracker::touch`];
//! - a record is marked reported before the lock is released, so the next
//!   sweep cannot queue the same episode twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::liveness::{LivenessOracle, ProcessTableOracle};
use crate::transcript::{parse_transcript, CompletedSession};
use crate::watcher::Toucher;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long a file must be silent before it can complete.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(10);

/// How often the sweep runs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// How long a reported file stays tracked before its record is dropped.
pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing parameters of the tracker. All durations must be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub idle_threshold: Duration,
    pub poll_interval: Duration,
    pub eviction_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            eviction_grace: DEFAULT_EVICTION_GRACE,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-file record
// ---------------------------------------------------------------------------

/// Bookkeeping for one transcript path (the map key).
#[derive(Debug, Clone, Copy)]
struct TrackedFile {
    last_write: Instant,
    /// `Some` once completion was emitted for the current idle episode.
    reported_at: Option<Instant>,
}

impl TrackedFile {
    fn new(now: Instant) -> Self {
        Self {
            last_write: now,
            reported_at: None,
        }
    }

    fn is_reported(&self) -> bool {
        self.reported_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

type CompletionCallback = Box<dyn Fn(CompletedSession) + Send + Sync>;

/// Detects finished sessions and reports each idle episode once.
pub struct Tracker {
    files: Mutex<HashMap<PathBuf, TrackedFile>>,
    config: TrackerConfig,
    liveness: Box<dyn LivenessOracle>,
    on_complete: CompletionCallback,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("config", &self.config)
            .field("tracked", &self.tracked_count())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Create a tracker that checks liveness against the process table.
    pub fn new<F>(config: TrackerConfig, on_complete: F) -> Self
    where
        F: Fn(CompletedSession) + Send + Sync + 'static,
    {
        Self::with_oracle(config, ProcessTableOracle::default(), on_complete)
    }

    /// Create a tracker with a custom liveness oracle.
    pub fn with_oracle<O, F>(config: TrackerConfig, liveness: O, on_complete: F) -> Self
    where
        O: LivenessOracle + 'static,
        F: Fn(CompletedSession) + Send + Sync + 'static,
    {
        Self {
            files: Mutex::new(HashMap::new()),
            config,
            liveness: Box::new(liveness),
            on_complete: Box::new(on_complete),
        }
    }

    /// Record a write to `path`, starting a new idle episode if the file
    /// had already been reported.
    pub fn touch(&self, path: &Path) {
        self.touch_at(path, Instant::now());
    }

    /// Number of paths currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.lock_files().len()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.lock_files().contains_key(path)
    }

    /// Run one sweep now. Returns the number of completions delivered.
    ///
    /// Blocks on transcript I/O and on the completion callback.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Spawn the periodic sweep loop on the current tokio runtime.
    ///
    /// The first sweep runs one `poll_interval` after start. Each sweep runs
    /// on the blocking pool since it reads files and the process table.
    pub fn start(self: &Arc<Self>) -> TrackerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let tracker = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let period = tracker.config.poll_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    // Err means every handle was dropped; stop either way.
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let sweeper = Arc::clone(&tracker);
                        if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                            warn!(error = %e, "tracker sweep failed");
                        }
                    }
                }
            }
            debug!("tracker sweep loop stopped");
        });

        TrackerHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }

    // -- internals -------------------------------------------------------------

    fn lock_files(&self) -> MutexGuard<'_, HashMap<PathBuf, TrackedFile>> {
        // Records are plain values; a panicking holder cannot leave one torn.
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch_at(&self, path: &Path, now: Instant) {
        let mut files = self.lock_files();
        match files.get_mut(path) {
            Some(tf) => {
                if tf.is_reported() {
                    debug!(path = %path.display(), "activity resumed on reported transcript");
                }
                tf.last_write = now;
                tf.reported_at = None;
            }
            None => {
                files.insert(path.to_path_buf(), TrackedFile::new(now));
                info!(path = %path.display(), "tracking new transcript");
            }
        }
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let ready = self.collect_ready(now);

        let mut delivered = 0;
        for path in ready {
            match parse_transcript(&path) {
                Some(session) => {
                    info!(
                        path = %path.display(),
                        session_id = %session.session_id,
                        exit_code = session.exit_code,
                        "session complete"
                    );
                    (self.on_complete)(session);
                    delivered += 1;
                }
                None => {
                    warn!(path = %path.display(), "finished transcript produced no session");
                }
            }
        }
        delivered
    }

    /// Evict stale records and mark finished ones reported, under the lock.
    fn collect_ready(&self, now: Instant) -> Vec<PathBuf> {
        let TrackerConfig {
            idle_threshold,
            eviction_grace,
            ..
        } = self.config;

        let mut ready = Vec::new();
        let mut files = self.lock_files();

        files.retain(|path, tf| {
            if let Some(reported_at) = tf.reported_at {
                if now.saturating_duration_since(reported_at) >= eviction_grace {
                    debug!(path = %path.display(), "evicting reported transcript");
                    return false;
                }
                return true;
            }

            let idle = now.saturating_duration_since(tf.last_write);
            if idle < idle_threshold {
                return true;
            }

            if self.liveness.is_live(path) {
                return true;
            }

            info!(
                path = %path.display(),
                idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                "session idle with no assistant process"
            );
            tf.reported_at = Some(now);
            ready.push(path.clone());
            true
        });

        ready
    }
}

impl Toucher for Tracker {
    fn touch(&self, path: &Path) {
        Tracker::touch(self, path);
    }
}

// ---------------------------------------------------------------------------
// TrackerHandle
// ---------------------------------------------------------------------------

/// Handle to a running sweep loop.
///
/// Stopping never interrupts a sweep in progress: its parsing and callbacks
/// finish, then the loop exits.
#[derive(Debug)]
pub struct TrackerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TrackerHandle {
    /// Ask the loop to exit. Safe to call any number of times.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "tracker sweep loop ended abnormally");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use tempfile::TempDir;

    const IDLE: Duration = Duration::from_secs(10);
    const GRACE: Duration = Duration::from_secs(300);

    fn test_config() -> TrackerConfig {
        TrackerConfig {
            idle_threshold: IDLE,
            poll_interval: Duration::from_secs(15),
            eviction_grace: GRACE,
        }
    }

    type Completions = Arc<Mutex<Vec<CompletedSession>>>;

    /// Tracker whose oracle always answers `live`, plus the recorded completions.
    fn tracker_with(config: TrackerConfig, live: bool) -> (Tracker, Completions) {
        let completed: Completions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        let tracker = Tracker::with_oracle(
            config,
            move |_: &Path| live,
            move |s| sink.lock().unwrap().push(s),
        );
        (tracker, completed)
    }

    fn write_transcript(dir: &Path, id: &str) -> PathBuf {
        let path = dir.join(format!("{}.jsonl", id));
        std::fs::write(
            &path,
            format!(
                "{{\"type\":\"assistant\",\"sessionId\":\"{}\",\"timestamp\":\"2026-02-14T10:00:00Z\"}}\n",
                id
            ),
        )
        .unwrap();
        path
    }

    fn count(c: &Completions) -> usize {
        c.lock().unwrap().len()
    }

    // -- Idle detection -------------------------------------------------------

    #[test]
    fn test_no_completion_before_idle_threshold() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        let (tracker, completed) = tracker_with(test_config(), false);

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        assert_eq!(tracker.sweep_at(t0), 0);
        assert_eq!(tracker.sweep_at(t0 + IDLE - Duration::from_millis(1)), 0);
        assert_eq!(count(&completed), 0);
    }

    #[test]
    fn test_exactly_one_completion_per_episode() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "11111111-2222-3333-4444-555555555555");
        let (tracker, completed) = tracker_with(test_config(), false);

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        assert_eq!(tracker.sweep_at(t0 + IDLE), 1);
        assert_eq!(tracker.sweep_at(t0 + IDLE + Duration::from_secs(15)), 0);
        assert_eq!(tracker.sweep_at(t0 + IDLE + Duration::from_secs(30)), 0);

        let done = completed.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].session_id, "11111111-2222-3333-4444-555555555555");
        assert_eq!(done[0].transcript_path, path);
    }

    #[test]
    fn test_live_process_blocks_completion_forever() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "33333333-4444-5555-6666-777777777777");
        let (tracker, completed) = tracker_with(test_config(), true);

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        for hours in [1, 10, 100] {
            tracker.sweep_at(t0 + Duration::from_secs(hours * 3600));
        }
        assert_eq!(count(&completed), 0);
        assert!(tracker.is_tracked(&path));
    }

    #[test]
    fn test_oracle_not_consulted_while_active() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "active");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let tracker = Tracker::with_oracle(
            test_config(),
            move |_: &Path| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            },
            |_| {},
        );

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        tracker.sweep_at(t0 + Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tracker.sweep_at(t0 + IDLE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_touch_resets_idle_timer() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "reset");
        let (tracker, completed) = tracker_with(test_config(), false);

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        tracker.touch_at(&path, t0 + Duration::from_secs(8));
        assert_eq!(tracker.sweep_at(t0 + IDLE), 0);
        assert_eq!(tracker.sweep_at(t0 + Duration::from_secs(18)), 1);
        assert_eq!(count(&completed), 1);
    }

    // -- Episodes and eviction --------------------------------------------------

    #[test]
    fn test_touch_after_report_allows_one_more_completion() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "22222222-3333-4444-5555-666666666666");
        let (tracker, completed) = tracker_with(test_config(), false);

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        assert_eq!(tracker.sweep_at(t0 + IDLE), 1);

        let t1 = t0 + Duration::from_secs(60);
        tracker.touch_at(&path, t1);
        assert_eq!(tracker.sweep_at(t1 + Duration::from_secs(1)), 0);
        assert_eq!(tracker.sweep_at(t1 + IDLE), 1);
        assert_eq!(tracker.sweep_at(t1 + IDLE + Duration::from_secs(15)), 0);
        assert_eq!(count(&completed), 2);
    }

    #[test]
    fn test_reported_file_evicted_after_grace() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "evict");
        let (tracker, _completed) = tracker_with(test_config(), false);

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        tracker.sweep_at(t0 + IDLE);
        assert!(tracker.is_tracked(&path));

        tracker.sweep_at(t0 + IDLE + GRACE - Duration::from_secs(1));
        assert!(tracker.is_tracked(&path));

        tracker.sweep_at(t0 + IDLE + GRACE);
        assert!(!tracker.is_tracked(&path));
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn test_failed_parse_still_reported_and_evicted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vanished.jsonl");
        let (tracker, completed) = tracker_with(test_config(), false);

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        assert_eq!(tracker.sweep_at(t0 + IDLE), 0);
        // No retry for the same episode.
        std::fs::write(&path, r#"{"type":"assistant","sessionId":"late"}"#).unwrap();
        assert_eq!(tracker.sweep_at(t0 + IDLE + Duration::from_secs(15)), 0);

        tracker.sweep_at(t0 + IDLE + GRACE);
        assert!(!tracker.is_tracked(&path));
        assert_eq!(count(&completed), 0);
    }

    #[test]
    fn test_paths_are_independent() {
        let tmp = TempDir::new().unwrap();
        let a = write_transcript(tmp.path(), "path-a");
        let b = write_transcript(tmp.path(), "path-b");
        let (tracker, completed) = tracker_with(test_config(), false);

        let t0 = Instant::now();
        tracker.touch_at(&a, t0);
        tracker.touch_at(&b, t0 + Duration::from_secs(5));

        assert_eq!(tracker.sweep_at(t0 + IDLE), 1);
        assert_eq!(tracker.sweep_at(t0 + IDLE + Duration::from_secs(5)), 1);

        let mut ids: Vec<String> = completed
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.session_id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["path-a", "path-b"]);
    }

    // -- Locking ----------------------------------------------------------------

    #[test]
    fn test_callback_runs_outside_lock() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "reentrant");

        let cell: Arc<OnceLock<Arc<Tracker>>> = Arc::new(OnceLock::new());
        let inner = Arc::clone(&cell);
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);

        let tracker = Arc::new(Tracker::with_oracle(
            test_config(),
            |_: &Path| false,
            move |s: CompletedSession| {
                // Would deadlock if the map lock were still held.
                let tracker = inner.get().unwrap();
                tracker.touch(&s.transcript_path);
                flag.store(tracker.is_tracked(&s.transcript_path), Ordering::SeqCst);
            },
        ));
        cell.set(Arc::clone(&tracker)).unwrap();

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        assert_eq!(tracker.sweep_at(t0 + IDLE), 1);
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_touches() {
        let tmp = TempDir::new().unwrap();
        let (tracker, _completed) = tracker_with(test_config(), false);
        let tracker = Arc::new(tracker);

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                let dir = tmp.path().to_path_buf();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        tracker.touch(&dir.join(format!("t{}-{}.jsonl", i, j % 10)));
                        if j % 7 == 0 {
                            tracker.sweep();
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(tracker.tracked_count(), 80);
    }

    // -- Sweep loop -------------------------------------------------------------

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            idle_threshold: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
            eviction_grace: GRACE,
        }
    }

    #[tokio::test]
    async fn test_loop_reports_idle_session_once() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "44444444-5555-6666-7777-888888888888");
        let (tracker, completed) = tracker_with(fast_config(), false);
        let tracker = Arc::new(tracker);

        let handle = tracker.start();
        tracker.touch(&path);
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        assert_eq!(count(&completed), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_reporting_after_stop() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "stopped");
        let (tracker, completed) = tracker_with(fast_config(), false);
        let tracker = Arc::new(tracker);

        let handle = tracker.start();
        handle.stop();
        handle.stop();
        tracker.touch(&path);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(handle.is_finished());
        assert_eq!(count(&completed), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_loop_exits_promptly_with_long_interval() {
        let config = TrackerConfig {
            poll_interval: Duration::from_secs(3600),
            ..test_config()
        };
        let (tracker, _completed) = tracker_with(config, false);
        let handle = Arc::new(tracker).start();

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("sweep loop did not stop");
    }

    #[test]
    fn test_new_uses_process_table_oracle() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "default-oracle");
        let completed: Completions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        let tracker = Tracker::new(test_config(), move |s| sink.lock().unwrap().push(s));

        let t0 = Instant::now();
        tracker.touch_at(&path, t0);
        assert!(tracker.is_tracked(&path));
        // Outside a projects layout any running assistant keeps the session
        // open, so only the absence of one guarantees a completion.
        let delivered = tracker.sweep_at(t0 + IDLE);
        assert_eq!(delivered, count(&completed));
        assert!(delivered <= 1);
    }

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.idle_threshold, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.eviction_grace, Duration::from_secs(300));
    }
}
