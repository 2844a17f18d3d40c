//! Mock platform provider for testing.
//!
//! Provides a configurable implementation of `PlatformProvider` whose
//! commands are ordinary shell strings (usually `true`, or `touch` markers
//! that tests can observe) and whose paths point into a temp directory.
//! Reports itself as already elevated so no command is wrapped in sudo.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use super::{DaemonInvocation, Package, PlatformPaths, PlatformProvider, ServiceAction};

/// Configurable platform provider for tests.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    paths: PlatformPaths,
    installed: HashSet<Package>,
    service_commands: HashMap<(Package, ServiceAction), String>,
    install_commands: HashMap<Package, String>,
    daemon: DaemonInvocation,
    daemon_verify: Option<String>,
    daemon_user: Option<(String, String)>,
    proxy_user: Option<String>,
}

impl MockPlatform {
    /// Create a provider rooted at the given paths. Both packages report
    /// installed and every command is a no-op until overridden.
    pub fn new(paths: PlatformPaths) -> Self {
        Self {
            paths,
            installed: HashSet::from([Package::Tor, Package::Nginx]),
            service_commands: HashMap::new(),
            install_commands: HashMap::new(),
            daemon: DaemonInvocation::new("true", Vec::new()),
            daemon_verify: None,
            daemon_user: None,
            proxy_user: None,
        }
    }

    /// Create paths under `root`, creating the directories and an empty
    /// daemon config file so commands against them succeed.
    pub fn paths_under(root: &Path) -> PlatformPaths {
        let daemon_dir = root.join("tor");
        let sites_available = root.join("sites-available");
        let sites_enabled = root.join("sites-enabled");
        let served_root = root.join("www");
        for dir in [&daemon_dir, &sites_available, &sites_enabled, &served_root] {
            fs::create_dir_all(dir).expect("create mock platform dir");
        }
        let daemon_config = root.join("torrc");
        fs::write(&daemon_config, "").expect("create mock torrc");

        PlatformPaths {
            daemon_config,
            daemon_data_dir: daemon_dir,
            sites_available,
            sites_enabled: Some(sites_enabled),
            served_root,
        }
    }

    /// Override one service management command.
    pub fn with_service_command(
        mut self,
        package: Package,
        action: ServiceAction,
        command: impl Into<String>,
    ) -> Self {
        self.service_commands
            .insert((package, action), command.into());
        self
    }

    /// Override one install command.
    pub fn with_install_command(mut self, package: Package, command: impl Into<String>) -> Self {
        self.install_commands.insert(package, command.into());
        self
    }

    /// Mark a package as absent.
    pub fn without_package(mut self, package: Package) -> Self {
        self.installed.remove(&package);
        self
    }

    /// Use a custom daemon invocation (typically a shell script fixture).
    pub fn with_daemon_invocation(mut self, invocation: DaemonInvocation) -> Self {
        self.daemon = invocation;
        self
    }

    /// Use a daemon config verification command.
    pub fn with_daemon_verify_command(mut self, command: impl Into<String>) -> Self {
        self.daemon_verify = Some(command.into());
        self
    }
}

impl PlatformProvider for MockPlatform {
    fn install_command(&self, package: Package) -> Option<String> {
        Some(
            self.install_commands
                .get(&package)
                .cloned()
                .unwrap_or_else(|| "true".to_string()),
        )
    }

    fn service_command(&self, package: Package, action: ServiceAction) -> Option<String> {
        Some(
            self.service_commands
                .get(&(package, action))
                .cloned()
                .unwrap_or_else(|| "true".to_string()),
        )
    }

    fn paths(&self) -> Option<PlatformPaths> {
        Some(self.paths.clone())
    }

    fn has_elevated_privileges(&self) -> bool {
        true
    }

    fn is_installed(&self, package: Package) -> bool {
        self.installed.contains(&package)
    }

    fn daemon_invocation(&self, _config_path: &Path) -> DaemonInvocation {
        self.daemon.clone()
    }

    fn daemon_verify_command(&self, _config_path: &Path) -> Option<String> {
        self.daemon_verify.clone()
    }

    fn daemon_user(&self) -> Option<(String, String)> {
        self.daemon_user.clone()
    }

    fn proxy_user(&self) -> Option<String> {
        self.proxy_user.clone()
    }
}
