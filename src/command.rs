//! Privileged shell command execution
//!
//! Commands run through `sh -c`. A command containing `sudo -S` needs the
//! elevation credential: the runner writes it once to the child's stdin and
//! never logs or persists it. Failures are reported verbatim; the caller
//! decides whether to retry with a fresh credential.

use std::fmt;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Default timeout for privileged commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Longer window for package installation.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Marker identifying commands that read the credential from stdin.
const SUDO_MARKER: &str = "sudo -S";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error types for command execution
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to run command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command requires elevated privileges and no credential is available")]
    ElevationRequired,

    #[error("Elevation credential was rejected: {0}")]
    ElevationFailed(String),
}

/// Outcome of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, or `fallback` when the command produced none.
    pub fn stderr_or(&self, fallback: &str) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            fallback.to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Shared, in-memory elevation credential.
///
/// Handles clone cheaply and all point at the same secret. The secret is
/// held only in memory and cleared when the owning runner is dropped.
#[derive(Clone, Default)]
pub struct ElevationCredential {
    secret: Arc<Mutex<Option<String>>>,
}

impl ElevationCredential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the secret, replacing any previous one.
    pub fn set(&self, secret: impl Into<String>) {
        *lock_secret(&self.secret) = Some(secret.into());
    }

    /// Drop the secret.
    pub fn clear(&self) {
        *lock_secret(&self.secret) = None;
    }

    pub fn is_set(&self) -> bool {
        lock_secret(&self.secret).is_some()
    }

    pub(crate) fn get(&self) -> Option<String> {
        lock_secret(&self.secret).clone()
    }
}

// Never derive Debug: the secret must not end up in logs.
impl fmt::Debug for ElevationCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_set() { "set" } else { "unset" };
        write!(f, "ElevationCredential({state})")
    }
}

fn lock_secret(secret: &Mutex<Option<String>>) -> std::sync::MutexGuard<'_, Option<String>> {
    secret.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Executes shell commands, supplying the elevation credential when needed.
#[derive(Debug, Clone)]
pub struct PrivilegedRunner {
    credential: ElevationCredential,
    elevated: bool,
}

impl PrivilegedRunner {
    /// `elevated` reflects whether the current process already runs
    /// privileged; elevated processes never need the credential.
    pub fn new(credential: ElevationCredential, elevated: bool) -> Self {
        Self {
            credential,
            elevated,
        }
    }

    pub fn credential(&self) -> &ElevationCredential {
        &self.credential
    }

    /// Run `command` through the shell, enforcing `timeout`.
    pub fn run(&self, command: &str, timeout: Duration) -> Result<CommandResult, CommandError> {
        let needs_credential = command.contains(SUDO_MARKER) && !self.elevated;
        let secret = if needs_credential {
            Some(self.credential.get().ok_or(CommandError::ElevationRequired)?)
        } else {
            None
        };

        debug!(%command, "running shell command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(if secret.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(secret) = secret.as_deref() {
            if let Some(mut stdin) = child.stdin.take() {
                // One write, then the pipe closes; sudo must not re-prompt.
                let _ = writeln!(stdin, "{secret}");
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_to_string(stdout_pipe));
        let stderr_reader = thread::spawn(move || read_to_string(stderr_pipe));

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Timeout(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        let result = CommandResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
            elapsed: started.elapsed(),
        };

        if needs_credential && !result.success() && credential_rejected(&result.stderr) {
            return Err(CommandError::ElevationFailed(
                result.stderr.trim().to_string(),
            ));
        }

        Ok(result)
    }
}

fn read_to_string<R: Read>(pipe: Option<R>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buffer);
    }
    buffer
}

fn credential_rejected(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("incorrect password") || lower.contains("try again")
}
