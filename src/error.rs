//! Error taxonomy for lifecycle operations
//!
//! Validation and dependency errors are raised before anything mutates;
//! mutating-step failures carry the step name and the captured stderr so
//! callers never see a bare exit code.

use thiserror::Error;

use crate::command::CommandError;
use crate::config::ConfigError;
use crate::watcher::WatchError;

/// Errors surfaced by the lifecycle orchestrator.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Caller-correctable input problems (bad directory, bad port).
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A required package is absent; recoverable via the install operation.
    #[error("Missing dependency: {0} is not installed")]
    MissingDependency(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    /// A command ran and exited non-zero; stderr attached verbatim.
    #[error("{step} failed: {stderr}")]
    CommandFailed { step: String, stderr: String },

    #[error("Failed to start the proxy: {0}")]
    ProxyStartFailed(String),

    /// The daemon never reached 100% inside the wait window.
    #[error("{}", timed_out_message(.percent, .errors))]
    BootstrapTimedOut { percent: u8, errors: Vec<String> },

    /// The daemon could not be launched or died before finishing.
    #[error("Daemon bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Ownership or mode of a sensitive directory could not be confirmed.
    #[error("Permission setup failed on {path}: {detail}")]
    PermissionSetupFailed { path: String, detail: String },

    /// Stop is best-effort; individual failures are collected, not
    /// short-circuited.
    #[error("Stop completed with errors: {0}")]
    StopFailed(String),

    #[error("Template rendering failed: {0}")]
    Render(#[from] minijinja::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for lifecycle operations
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Timeouts are worth telling apart from hard failures: the caller may
    /// extend the wait instead of abandoning the attempt.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ServiceError::BootstrapTimedOut { .. }
                | ServiceError::Command(CommandError::Timeout(_))
        )
    }

    /// Errors the caller can clear by supplying a (new) credential.
    pub fn needs_credential(&self) -> bool {
        matches!(
            self,
            ServiceError::Command(CommandError::ElevationRequired)
                | ServiceError::Command(CommandError::ElevationFailed(_))
        )
    }
}

fn timed_out_message(percent: &u8, errors: &[String]) -> String {
    if errors.is_empty() {
        format!("Bootstrap timed out at {percent}%. Check your network connection.")
    } else {
        format!(
            "Bootstrap timed out at {percent}%. Errors: {}",
            errors.join(" | ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timed_out_message_without_errors() {
        let err = ServiceError::BootstrapTimedOut {
            percent: 45,
            errors: vec![],
        };
        let message = err.to_string();
        assert!(message.contains("45%"));
        assert!(message.contains("network connection"));
    }

    #[test]
    fn test_timed_out_message_with_errors() {
        let err = ServiceError::BootstrapTimedOut {
            percent: 10,
            errors: vec!["[err] no route".to_string(), "[err] dns".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("10%"));
        assert!(message.contains("no route | [err] dns"));
    }

    #[test]
    fn test_command_failed_names_step() {
        let err = ServiceError::CommandFailed {
            step: "install proxy config".to_string(),
            stderr: "mv: cannot move".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "install proxy config failed: mv: cannot move"
        );
    }

    #[test]
    fn test_is_timeout() {
        assert!(ServiceError::BootstrapTimedOut {
            percent: 0,
            errors: vec![]
        }
        .is_timeout());
        assert!(
            ServiceError::Command(CommandError::Timeout(Duration::from_secs(1))).is_timeout()
        );
        assert!(!ServiceError::InvalidConfiguration("x".into()).is_timeout());
    }

    #[test]
    fn test_needs_credential() {
        assert!(ServiceError::Command(CommandError::ElevationRequired).needs_credential());
        assert!(
            ServiceError::Command(CommandError::ElevationFailed("no".into())).needs_credential()
        );
        assert!(!ServiceError::MissingDependency("tor".into()).needs_credential());
    }
}
