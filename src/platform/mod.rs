//! Platform capability queries
//!
//! This module answers "how do I do X on this system": install commands,
//! service management commands, filesystem paths for the daemon and proxy,
//! and whether the current process already runs privileged. The lifecycle
//! orchestrator only talks to the [`PlatformProvider`] trait; the concrete
//! answers live in [`host::HostPlatform`] and, for tests, [`mock::MockPlatform`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

pub mod host;
pub mod mock;

pub use host::HostPlatform;
pub use mock::MockPlatform;

/// Packages the orchestrator knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Package {
    /// The anonymity daemon.
    Tor,
    /// The reverse proxy.
    Nginx,
}

impl Package {
    /// Package and binary name.
    pub fn name(&self) -> &'static str {
        match self {
            Package::Tor => "tor",
            Package::Nginx => "nginx",
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Actions a managed service supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    /// Configuration check (e.g. `nginx -t`).
    Test,
}

/// Filesystem locations the orchestrator writes to or reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPaths {
    /// The daemon's main configuration file (torrc).
    pub daemon_config: PathBuf,
    /// The daemon's data directory; hidden services live below it.
    pub daemon_data_dir: PathBuf,
    /// Where proxy virtual-host files are written.
    pub sites_available: PathBuf,
    /// Where enabled sites are symlinked, on platforms that split the two.
    pub sites_enabled: Option<PathBuf>,
    /// The document root the proxy serves.
    pub served_root: PathBuf,
}

/// How to launch the daemon in the foreground for bootstrap monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// True when the invocation goes through `sudo -S` and needs the
    /// elevation credential written to its stdin.
    pub needs_elevation: bool,
}

impl DaemonInvocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            needs_elevation: false,
        }
    }

    pub fn with_elevation(mut self) -> Self {
        self.needs_elevation = true;
        self
    }

    /// Build a spawnable command from this invocation.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for DaemonInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Capability queries for the current platform.
pub trait PlatformProvider: Send + Sync {
    /// Shell command installing `package`, if installation is automated here.
    fn install_command(&self, package: Package) -> Option<String>;

    /// Shell command applying `action` to `package`'s system service.
    fn service_command(&self, package: Package, action: ServiceAction) -> Option<String>;

    /// Filesystem locations, when this platform is supported at all.
    fn paths(&self) -> Option<PlatformPaths>;

    /// Whether the current process already holds elevated privileges.
    fn has_elevated_privileges(&self) -> bool;

    /// Whether `package` is present on this system.
    fn is_installed(&self, package: Package) -> bool;

    /// Foreground daemon invocation used for bootstrap monitoring.
    fn daemon_invocation(&self, config_path: &Path) -> DaemonInvocation;

    /// Pre-launch configuration check command, where the daemon supports one.
    fn daemon_verify_command(&self, config_path: &Path) -> Option<String>;

    /// User and group that must own the hidden service directory.
    fn daemon_user(&self) -> Option<(String, String)>;

    /// User the proxy worker runs as, for served-root ownership.
    fn proxy_user(&self) -> Option<String>;

    /// Wrap a shell command with elevation when this process is unprivileged.
    fn elevate(&self, command: &str) -> String {
        if self.has_elevated_privileges() {
            command.to_string()
        } else {
            format!("sudo -S {command}")
        }
    }
}

/// Check if a binary exists in PATH
pub(crate) fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
