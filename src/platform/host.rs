//! Real platform detection and command tables
//!
//! Mirrors the package-manager and service-manager conventions of the
//! distributions the tool supports: apt/systemd (Debian family),
//! pacman/systemd (Arch family), dnf/systemd (Red Hat family) and
//! Homebrew services on macOS.

use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use super::{
    binary_exists, DaemonInvocation, Package, PlatformPaths, PlatformProvider, ServiceAction,
};

/// Operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Linux,
    MacOs,
    Other,
}

/// Linux distribution family, as far as package management is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Debian,
    Arch,
    RedHat,
    Unknown,
}

/// Capability provider backed by the machine the process runs on.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    os: OsKind,
    distro: Distro,
}

impl HostPlatform {
    /// Detect the current platform.
    pub fn detect() -> Self {
        let os = if cfg!(target_os = "linux") {
            OsKind::Linux
        } else if cfg!(target_os = "macos") {
            OsKind::MacOs
        } else {
            OsKind::Other
        };

        let distro = if os == OsKind::Linux {
            detect_distro()
        } else {
            Distro::Unknown
        };

        Self { os, distro }
    }

    /// Construct for a known platform; used by tests.
    pub fn with_parts(os: OsKind, distro: Distro) -> Self {
        Self { os, distro }
    }

    pub fn os(&self) -> OsKind {
        self.os
    }

    pub fn distro(&self) -> Distro {
        self.distro
    }

    /// The systemd unit name for the daemon differs on Debian, which ships
    /// an instanced `tor@default` unit.
    fn daemon_unit(&self) -> &'static str {
        match self.distro {
            Distro::Debian => "tor@default",
            _ => "tor",
        }
    }
}

fn detect_distro() -> Distro {
    if let Ok(content) = fs::read_to_string("/etc/os-release") {
        if let Some(distro) = classify_os_release(&content) {
            return distro;
        }
    }

    // Fall back to whichever package manager is on PATH.
    if binary_exists("apt") {
        Distro::Debian
    } else if binary_exists("pacman") {
        Distro::Arch
    } else if binary_exists("dnf") || binary_exists("yum") {
        Distro::RedHat
    } else {
        Distro::Unknown
    }
}

/// Classify an /etc/os-release body into a distribution family.
fn classify_os_release(content: &str) -> Option<Distro> {
    let content = content.to_lowercase();

    const DEBIAN_LIKE: &[&str] = &["debian", "ubuntu", "mint", "pop", "elementary", "zorin"];
    const ARCH_LIKE: &[&str] = &["arch", "manjaro", "endeavour", "garuda"];
    const REDHAT_LIKE: &[&str] = &["rhel", "fedora", "centos", "rocky", "alma"];

    if DEBIAN_LIKE.iter().any(|name| content.contains(name)) {
        Some(Distro::Debian)
    } else if ARCH_LIKE.iter().any(|name| content.contains(name)) {
        Some(Distro::Arch)
    } else if REDHAT_LIKE.iter().any(|name| content.contains(name)) {
        Some(Distro::RedHat)
    } else {
        None
    }
}

impl PlatformProvider for HostPlatform {
    fn install_command(&self, package: Package) -> Option<String> {
        let name = package.name();
        match (self.os, self.distro) {
            (OsKind::Linux, Distro::Debian) => Some(format!(
                "sudo -S sh -c 'apt update && apt install -y {name}'"
            )),
            (OsKind::Linux, Distro::Arch) => {
                Some(format!("sudo -S pacman -Sy --noconfirm {name}"))
            }
            (OsKind::Linux, Distro::RedHat) => Some(format!("sudo -S dnf install -y {name}")),
            (OsKind::MacOs, _) => Some(format!("brew install {name}")),
            _ => None,
        }
    }

    fn service_command(&self, package: Package, action: ServiceAction) -> Option<String> {
        match self.os {
            OsKind::Linux => {
                if self.distro == Distro::Unknown {
                    return None;
                }
                let unit = match package {
                    Package::Tor => self.daemon_unit(),
                    Package::Nginx => "nginx",
                };
                match action {
                    ServiceAction::Start => Some(format!("sudo -S systemctl start {unit}")),
                    ServiceAction::Stop => Some(format!("sudo -S systemctl stop {unit}")),
                    ServiceAction::Restart => Some(format!("sudo -S systemctl restart {unit}")),
                    ServiceAction::Test => match package {
                        Package::Nginx => Some("sudo -S nginx -t".to_string()),
                        Package::Tor => None,
                    },
                }
            }
            OsKind::MacOs => {
                let name = package.name();
                match action {
                    ServiceAction::Start => Some(format!("brew services start {name}")),
                    ServiceAction::Stop => Some(format!("brew services stop {name}")),
                    ServiceAction::Restart => Some(format!("brew services restart {name}")),
                    ServiceAction::Test => match package {
                        Package::Nginx => Some("nginx -t".to_string()),
                        Package::Tor => None,
                    },
                }
            }
            OsKind::Other => None,
        }
    }

    fn paths(&self) -> Option<PlatformPaths> {
        match self.os {
            OsKind::Linux => Some(PlatformPaths {
                daemon_config: "/etc/tor/torrc".into(),
                daemon_data_dir: "/var/lib/tor".into(),
                sites_available: match self.distro {
                    Distro::RedHat => "/etc/nginx/conf.d".into(),
                    _ => "/etc/nginx/sites-available".into(),
                },
                sites_enabled: match self.distro {
                    // conf.d is included directly; nothing to symlink.
                    Distro::RedHat => None,
                    _ => Some("/etc/nginx/sites-enabled".into()),
                },
                served_root: "/var/www/html".into(),
            }),
            OsKind::MacOs => Some(PlatformPaths {
                daemon_config: "/usr/local/etc/tor/torrc".into(),
                daemon_data_dir: "/usr/local/var/lib/tor".into(),
                sites_available: "/usr/local/etc/nginx/servers".into(),
                sites_enabled: None,
                served_root: "/usr/local/var/www".into(),
            }),
            OsKind::Other => None,
        }
    }

    fn has_elevated_privileges(&self) -> bool {
        Command::new("id")
            .arg("-u")
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
            .unwrap_or(false)
    }

    fn is_installed(&self, package: Package) -> bool {
        binary_exists(package.name())
    }

    fn daemon_invocation(&self, config_path: &Path) -> DaemonInvocation {
        let config = config_path.display().to_string();
        match self.os {
            OsKind::Linux => {
                // The data directory is owned by the tor user, so the daemon
                // must run as that user rather than as root or the caller.
                let (user, _) = self
                    .daemon_user()
                    .unwrap_or_else(|| ("tor".to_string(), "tor".to_string()));
                if self.has_elevated_privileges() {
                    DaemonInvocation::new(
                        "sudo",
                        vec!["-u".into(), user, "tor".into(), "-f".into(), config],
                    )
                } else {
                    DaemonInvocation::new(
                        "sudo",
                        vec![
                            "-S".into(),
                            "-u".into(),
                            user,
                            "tor".into(),
                            "-f".into(),
                            config,
                        ],
                    )
                    .with_elevation()
                }
            }
            _ => DaemonInvocation::new("tor", vec!["-f".into(), config]),
        }
    }

    fn daemon_verify_command(&self, config_path: &Path) -> Option<String> {
        match self.os {
            OsKind::Linux => {
                let (user, _) = self.daemon_user()?;
                let prefix = if self.has_elevated_privileges() {
                    format!("sudo -u {user}")
                } else {
                    format!("sudo -S -u {user}")
                };
                Some(format!(
                    "{prefix} tor --verify-config -f '{}'",
                    config_path.display()
                ))
            }
            OsKind::MacOs => Some(format!(
                "tor --verify-config -f '{}'",
                config_path.display()
            )),
            OsKind::Other => None,
        }
    }

    fn daemon_user(&self) -> Option<(String, String)> {
        match self.os {
            OsKind::Linux => match self.distro {
                Distro::Debian => Some(("debian-tor".to_string(), "debian-tor".to_string())),
                _ => Some(("tor".to_string(), "tor".to_string())),
            },
            OsKind::MacOs => {
                let user = env::var("USER").unwrap_or_else(|_| "tor".to_string());
                Some((user, "staff".to_string()))
            }
            OsKind::Other => None,
        }
    }

    fn proxy_user(&self) -> Option<String> {
        match (self.os, self.distro) {
            (OsKind::Linux, Distro::Debian) => Some("www-data".to_string()),
            (OsKind::Linux, Distro::Arch) => Some("http".to_string()),
            (OsKind::Linux, Distro::RedHat) => Some("nginx".to_string()),
            _ => None,
        }
    }
}
