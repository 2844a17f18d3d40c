//! File watcher for mirroring the content directory
//!
//! Watches the user's content directory and re-runs the sync closure (a
//! privileged recursive copy into the served root) whenever something in it
//! changes. The copy is idempotent, so bursts that trigger a redundant sync
//! are harmless; a short quiet window coalesces most of them anyway.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Quiet window for coalescing change bursts into one sync.
const COALESCE_WINDOW: Duration = Duration::from_millis(300);

/// How often the background thread checks the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Error types for watcher operations
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("File watching unavailable: {0}")]
    Backend(#[from] notify::Error),

    #[error("Watcher is already active")]
    AlreadyWatching,
}

/// Invoked on a background thread whenever watched content changes.
pub type SyncFn = Box<dyn Fn() + Send + 'static>;

/// Mirrors content-directory changes into the served root.
///
/// Two implementations exist behind this trait: the notify-backed watcher
/// and a no-op used when the OS notification facility is unavailable.
/// Which one a service gets is decided once, at construction.
pub trait SiteWatcher: Send {
    /// Subscribe to recursive change notifications on `source`.
    fn watch(&mut self, source: &Path, sync: SyncFn) -> Result<(), WatchError>;

    /// Cancel the subscription and block until the background thread has
    /// fully stopped. Skipping this leaks the thread.
    fn unwatch(&mut self);

    fn is_active(&self) -> bool;
}

/// Pick the watcher implementation for this system.
pub fn detect() -> Box<dyn SiteWatcher> {
    match notify::recommended_watcher(|_event: Result<Event, notify::Error>| {}) {
        Ok(_) => Box::new(NotifyWatcher::new()),
        Err(err) => {
            warn!(%err, "filesystem notifications unavailable, content sync on change disabled");
            Box::new(NoopWatcher)
        }
    }
}

struct ActiveWatch {
    // Held to keep the subscription alive; dropped on unwatch.
    _watcher: RecommendedWatcher,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// notify-backed watcher.
pub struct NotifyWatcher {
    active: Option<ActiveWatch>,
}

impl NotifyWatcher {
    pub fn new() -> Self {
        Self { active: None }
    }
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn touches_files(event: &Event) -> bool {
    // Directory-only events (creation of subdirs, attribute churn) don't
    // change served content by themselves.
    event.paths.iter().any(|path| !path.is_dir())
}

impl SiteWatcher for NotifyWatcher {
    fn watch(&mut self, source: &Path, sync: SyncFn) -> Result<(), WatchError> {
        if self.active.is_some() {
            return Err(WatchError::AlreadyWatching);
        }

        let (tx, rx) = mpsc::channel::<Event>();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                match result {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(err) => debug!(%err, "watch event error"),
                }
            })?;
        watcher.watch(source, RecursiveMode::Recursive)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => {
                        if !touches_files(&event) {
                            continue;
                        }
                        // Let the burst settle before syncing once.
                        while rx.recv_timeout(COALESCE_WINDOW).is_ok() {}
                        debug!("site content changed, syncing");
                        sync();
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        info!(source = %source.display(), "file watcher started");
        self.active = Some(ActiveWatch {
            _watcher: watcher,
            stop,
            thread,
        });
        Ok(())
    }

    fn unwatch(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop.store(true, Ordering::Relaxed);
            // Dropping the subscription closes the event channel too.
            drop(active._watcher);
            let _ = active.thread.join();
            info!("file watcher stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for NotifyWatcher {
    fn drop(&mut self) {
        self.unwatch();
    }
}

/// Watcher used when filesystem notifications are unavailable; the service
/// still starts, content is simply synced only at start.
pub struct NoopWatcher;

impl SiteWatcher for NoopWatcher {
    fn watch(&mut self, _source: &Path, _sync: SyncFn) -> Result<(), WatchError> {
        Ok(())
    }

    fn unwatch(&mut self) {}

    fn is_active(&self) -> bool {
        false
    }
}
