//! Tor bootstrap monitoring
//!
//! The daemon reports bootstrap progress only as unstructured log lines
//! ("Bootstrapped 45% (requesting_descriptors): Asking for more relay
//! descriptors"). This module narrows that stream to a small contract: a
//! progress callback that fires at most once per distinct increasing
//! percentage, a completion event at 100%, and a bounded wait window. The
//! onion address itself comes from the hostname artifact the daemon writes,
//! never from the stream.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::PrivilegedRunner;
use crate::platform::{DaemonInvocation, PlatformProvider};

/// How long the daemon gets to reach 100%.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause after 100% before reading the hostname artifact; the daemon writes
/// it shortly after the final bootstrap line.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Error lines kept for diagnostics.
const MAX_ERROR_LINES: usize = 8;

/// Error lines surfaced in failure messages.
pub const SURFACED_ERROR_LINES: usize = 3;

/// Error types for daemon launching
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Daemon could not be launched: {0}")]
    Launch(#[from] std::io::Error),
}

/// Lifecycle of one daemon bootstrap attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPhase {
    NotStarted,
    Launching,
    Bootstrapping(u8),
    /// Bootstrap finished; the address may still be unreadable for a moment.
    Ready(Option<String>),
    Failed(String),
    TimedOut,
}

impl Default for BootstrapPhase {
    fn default() -> Self {
        BootstrapPhase::NotStarted
    }
}

/// Callback receiving `(percent, status_text)` on a worker thread.
pub type ProgressCallback = Box<dyn FnMut(u8, &str) + Send>;

/// Extract `(percent, status)` from a daemon output line.
///
/// Matches `Bootstrapped N%` with an optional `(tag)` and `: status` suffix.
/// Percentages above 100 are treated as noise.
pub fn parse_bootstrap_line(line: &str) -> Option<(u8, String)> {
    const MARKER: &str = "Bootstrapped ";

    let start = line.find(MARKER)? + MARKER.len();
    let rest = &line[start..];

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let percent: u32 = rest[..digits_end].parse().ok()?;
    if percent > 100 {
        return None;
    }

    let after = &rest[digits_end..];
    if !after.starts_with('%') {
        return None;
    }

    let status = after
        .find(": ")
        .map(|idx| after[idx + 2..].trim().to_string())
        .filter(|status| !status.is_empty())
        .unwrap_or_else(|| "Connecting...".to_string());

    Some((percent as u8, status))
}

fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("[err]") || lower.contains("error")
}

/// Pure, line-driven progress state. Mutated only by the monitor thread;
/// tests drive it with literal line sequences.
#[derive(Debug, Default)]
pub struct BootstrapTracker {
    percent: u8,
    last_status: String,
    errors: Vec<String>,
    done: bool,
}

impl BootstrapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Feed one output line.
    ///
    /// Returns `Some((percent, status))` exactly when the percentage
    /// strictly increased; the caller forwards that to the progress
    /// callback, which therefore never sees a repeated or decreasing value.
    pub fn observe(&mut self, line: &str) -> Option<(u8, String)> {
        if is_error_line(line) && self.errors.len() < MAX_ERROR_LINES {
            self.errors.push(line.trim().to_string());
        }

        let (percent, status) = parse_bootstrap_line(line)?;
        if percent <= self.percent {
            // Repeated or regressed percentages are dropped, not surfaced.
            return None;
        }

        self.percent = percent;
        self.last_status = status.clone();
        if percent >= 100 {
            self.done = true;
        }
        Some((percent, status))
    }
}

/// Live view of bootstrap progress, readable while a start is in flight.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    inner: Arc<Mutex<SnapshotInner>>,
}

#[derive(Debug, Default)]
struct SnapshotInner {
    phase: BootstrapPhase,
    percent: u8,
    status: String,
}

impl ProgressSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.lock().phase.clone()
    }

    pub fn percent(&self) -> u8 {
        self.lock().percent
    }

    pub fn status(&self) -> String {
        self.lock().status.clone()
    }

    pub(crate) fn set_phase(&self, phase: BootstrapPhase) {
        self.lock().phase = phase;
    }

    pub(crate) fn bootstrapping(&self, percent: u8, status: &str) {
        let mut inner = self.lock();
        inner.phase = BootstrapPhase::Bootstrapping(percent);
        inner.percent = percent;
        inner.status = status.to_string();
    }

    pub(crate) fn reset(&self) {
        let mut inner = self.lock();
        *inner = SnapshotInner::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SnapshotInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A launched daemon and the channel its merged output arrives on.
pub struct DaemonHandle {
    child: Child,
    lines: Option<Receiver<String>>,
}

impl DaemonHandle {
    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Give up the handle, keeping the process. The reader threads keep
    /// draining the daemon's pipes until it exits.
    pub fn into_child(self) -> Child {
        self.child
    }
}

/// Outcome of waiting for bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapWait {
    /// 100% observed.
    Complete { percent: u8 },
    /// The window elapsed before 100%.
    TimedOut { percent: u8, errors: Vec<String> },
    /// The daemon's output closed before 100%.
    Exited { percent: u8, errors: Vec<String> },
}

/// Launches the daemon and waits out its bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapMonitor {
    timeout: Duration,
}

impl Default for BootstrapMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapMonitor {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Spawn the daemon with stdout and stderr merged into one line channel.
    ///
    /// `credential` is written once to the child's stdin when the invocation
    /// goes through sudo.
    pub fn launch(
        &self,
        invocation: &DaemonInvocation,
        credential: Option<&str>,
    ) -> Result<DaemonHandle, BootstrapError> {
        info!(daemon = %invocation, "launching daemon");

        let mut command = invocation.to_command();
        command
            .stdin(if credential.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;

        if let Some(secret) = credential {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = writeln!(stdin, "{secret}");
            }
        }

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            let _ = spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            let _ = spawn_line_reader(stderr, tx);
        }

        Ok(DaemonHandle {
            child,
            lines: Some(rx),
        })
    }

    /// Block until bootstrap completes, the daemon's output closes, or the
    /// window elapses.
    ///
    /// The line stream is consumed on a dedicated worker thread so the
    /// progress callback is delivered incrementally off the caller's thread;
    /// callbacks must not assume the caller's context.
    pub fn wait(
        &self,
        handle: &mut DaemonHandle,
        progress: Option<ProgressCallback>,
        snapshot: &ProgressSnapshot,
    ) -> BootstrapWait {
        let Some(lines) = handle.lines.take() else {
            return BootstrapWait::Exited {
                percent: snapshot.percent(),
                errors: Vec::new(),
            };
        };

        let timeout = self.timeout;
        let snapshot = snapshot.clone();
        let (done_tx, done_rx) = mpsc::channel();

        let worker = thread::spawn(move || {
            let mut tracker = BootstrapTracker::new();
            let mut progress = progress;
            let started = Instant::now();

            let outcome = loop {
                let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                    break BootstrapWait::TimedOut {
                        percent: tracker.percent(),
                        errors: tracker.errors().to_vec(),
                    };
                };

                match lines.recv_timeout(remaining) {
                    Ok(line) => {
                        debug!(%line, "daemon output");
                        if let Some((percent, status)) = tracker.observe(&line) {
                            snapshot.bootstrapping(percent, &status);
                            if let Some(callback) = progress.as_mut() {
                                callback(percent, &status);
                            }
                            info!(percent, %status, "bootstrap progress");
                            if tracker.is_done() {
                                break BootstrapWait::Complete { percent };
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        break BootstrapWait::TimedOut {
                            percent: tracker.percent(),
                            errors: tracker.errors().to_vec(),
                        };
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        break BootstrapWait::Exited {
                            percent: tracker.percent(),
                            errors: tracker.errors().to_vec(),
                        };
                    }
                }
            };

            let _ = done_tx.send(outcome);
        });

        let outcome = done_rx.recv().unwrap_or(BootstrapWait::Exited {
            percent: 0,
            errors: Vec::new(),
        });
        let _ = worker.join();
        outcome
    }
}

/// Forward lines into the channel, and keep draining after the receiver is
/// gone so the daemon never blocks on a full pipe. Exits at EOF.
fn spawn_line_reader<R: Read + Send + 'static>(
    source: R,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    let _ = tx.send(line);
                }
                Err(_) => break,
            }
        }
    })
}

/// Read the generated onion address artifact.
///
/// Direct read first; the file is normally owned by the daemon user, so
/// fall back to a privileged read. `None` is not fatal; the caller retries
/// shortly.
pub fn read_onion_address(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
    hidden_service_dir: &Path,
) -> Option<String> {
    let hostname = hidden_service_dir.join("hostname");

    if let Ok(contents) = fs::read_to_string(&hostname) {
        let address = contents.trim();
        if !address.is_empty() {
            return Some(address.to_string());
        }
    }

    let command = platform.elevate(&format!("cat '{}'", hostname.display()));
    match runner.run(&command, Duration::from_secs(10)) {
        Ok(result) if result.success() => {
            let address = result.stdout.trim().to_string();
            if address.is_empty() {
                None
            } else {
                Some(address)
            }
        }
        Ok(result) => {
            debug!(stderr = %result.stderr.trim(), "onion address not readable yet");
            None
        }
        Err(err) => {
            warn!(%err, "privileged hostname read failed");
            None
        }
    }
}
