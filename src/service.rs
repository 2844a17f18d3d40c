//! Service lifecycle orchestration
//!
//! `OnionService` composes the platform provider, the privileged runner,
//! the configuration synthesizer, the bootstrap monitor and the directory
//! watcher into start/stop/restart/status operations. Steps in `start` are
//! strictly sequential: validation and dependency checks run before any
//! mutation, and each mutating step gates the next. `stop` is best-effort
//! and collects failures instead of bailing on the first one.

use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::bootstrap::{
    self, BootstrapMonitor, BootstrapPhase, BootstrapWait, ProgressCallback, ProgressSnapshot,
    DEFAULT_SETTLE_DELAY, SURFACED_ERROR_LINES,
};
use crate::command::{PrivilegedRunner, DEFAULT_TIMEOUT, INSTALL_TIMEOUT};
use crate::config::{
    validate_port, HistoryEntry, HostingMethod, Settings, SettingsStore,
};
use crate::error::{ServiceError, ServiceResult};
use crate::platform::{Package, PlatformProvider, ServiceAction};
use crate::siteconf;
use crate::watcher::{self, SiteWatcher, SyncFn};

/// Files that qualify a directory as publishable content.
pub const VALID_INDEX_FILES: &[&str] = &["index.html", "index.htm", "index.php"];

/// Subdirectory of the daemon data dir holding the hidden service keys.
const HIDDEN_SERVICE_SUBDIR: &str = "hidden_service";

/// Pause between stop and start during a restart. Whether the daemons
/// actually need it for socket release is unclear; it stays configurable.
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_secs(2);

/// Result of a successful `start`.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// The onion address, when the artifact was already readable. `None`
    /// means the caller should poll `status` shortly.
    pub address: Option<String>,
    pub message: String,
}

/// Read-only status snapshot; computed on demand, never persisted.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub running: bool,
    pub daemon_alive: bool,
    pub bootstrap_percent: u8,
    pub onion_address: Option<String>,
    pub site_directory: Option<String>,
    pub nginx_port: u16,
    pub hosting_method: HostingMethod,
    pub tor_installed: bool,
    pub nginx_installed: bool,
}

/// Installation state of the required external daemons.
#[derive(Debug, Clone, Copy)]
pub struct DependencyReport {
    pub tor: bool,
    pub nginx: bool,
}

/// What one start attempt will do, decided before anything mutates.
enum StartPlan {
    Proxy { site_dir: PathBuf, port: u16 },
    DirectPort { port: u16 },
}

impl StartPlan {
    fn forward_port(&self) -> u16 {
        match self {
            StartPlan::Proxy { port, .. } => *port,
            StartPlan::DirectPort { port } => *port,
        }
    }

    fn site_dir(&self) -> Option<&Path> {
        match self {
            StartPlan::Proxy { site_dir, .. } => Some(site_dir),
            StartPlan::DirectPort { .. } => None,
        }
    }
}

/// The lifecycle orchestrator. One logical owner per managed service;
/// `status` is safe to call concurrently with a lifecycle operation.
pub struct OnionService {
    platform: Box<dyn PlatformProvider>,
    runner: PrivilegedRunner,
    settings: Mutex<SettingsStore>,
    daemon: Mutex<Option<Child>>,
    progress: ProgressSnapshot,
    watcher: Mutex<Box<dyn SiteWatcher>>,
    bootstrap_timeout: Duration,
    settle_delay: Duration,
    restart_settle: Duration,
}

impl OnionService {
    pub fn new(
        platform: Box<dyn PlatformProvider>,
        runner: PrivilegedRunner,
        settings: SettingsStore,
    ) -> Self {
        Self {
            platform,
            runner,
            settings: Mutex::new(settings),
            daemon: Mutex::new(None),
            progress: ProgressSnapshot::new(),
            watcher: Mutex::new(watcher::detect()),
            bootstrap_timeout: bootstrap::DEFAULT_BOOTSTRAP_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            restart_settle: DEFAULT_RESTART_SETTLE,
        }
    }

    /// Override how long the daemon gets to bootstrap.
    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    /// Override the pause between 100% and the address read.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Override the pause between stop and start in `restart`.
    pub fn with_restart_settle(mut self, delay: Duration) -> Self {
        self.restart_settle = delay;
        self
    }

    /// The shared elevation credential; callers set it after an
    /// elevation-required error and retry.
    pub fn credential(&self) -> &crate::command::ElevationCredential {
        self.runner.credential()
    }

    /// Start the service and block until the daemon is bootstrapped.
    ///
    /// `progress` receives `(percent, status)` on a worker thread, at most
    /// once per distinct increasing percentage.
    pub fn start(
        &self,
        site_directory: Option<&Path>,
        progress: Option<ProgressCallback>,
    ) -> ServiceResult<StartOutcome> {
        if self.daemon_alive() {
            let address = lock(&self.settings).get().onion_address.clone();
            return Ok(StartOutcome {
                address,
                message: "Service is already running.".to_string(),
            });
        }

        // Fail fast, mutate late: nothing below runs a command until the
        // request and the dependency set check out.
        let plan = self.validate_request(site_directory)?;

        let deps = self.check_dependencies();
        if !deps.tor {
            return Err(ServiceError::MissingDependency("tor".to_string()));
        }
        if matches!(plan, StartPlan::Proxy { .. }) && !deps.nginx {
            return Err(ServiceError::MissingDependency("nginx".to_string()));
        }

        let paths = self.platform.paths().ok_or_else(|| {
            ServiceError::InvalidConfiguration(
                "this platform is not supported (no known daemon/proxy paths)".to_string(),
            )
        })?;

        // Proxy configuration comes first; a failure here must leave the
        // daemon untouched.
        if let StartPlan::Proxy { site_dir, port } = &plan {
            siteconf::sync_site_files(&self.runner, self.platform.as_ref(), site_dir, &paths.served_root)?;

            let error_log = lock(&self.settings).directory().join("nginx-error.log");
            let rendered = siteconf::render_proxy_config(*port, &paths.served_root, &error_log)?;
            let config_name = lock(&self.settings).get().nginx_config_name.clone();

            siteconf::apply_proxy_config(
                &self.runner,
                self.platform.as_ref(),
                &rendered,
                &paths,
                &config_name,
            )?;
            siteconf::enable_proxy_site(&self.runner, self.platform.as_ref(), &paths, &config_name)?;
            siteconf::test_proxy_config(&self.runner, self.platform.as_ref())?;

            lock(&self.settings).update(|s| {
                s.site_directory = Some(site_dir.display().to_string());
                s.nginx_port = *port;
            })?;
        }

        // Hidden-service setup is idempotent; the proxy config applied above
        // stays in place if this fails, it is harmless in isolation.
        let hs_dir = paths.daemon_data_dir.join(HIDDEN_SERVICE_SUBDIR);
        siteconf::ensure_hidden_service_dir(&self.runner, self.platform.as_ref(), &hs_dir)?;
        siteconf::ensure_hidden_service_stanza(
            &self.runner,
            self.platform.as_ref(),
            &paths.daemon_config,
            &hs_dir,
            plan.forward_port(),
        )?;
        lock(&self.settings).update(|s| {
            s.hidden_service_dir = Some(hs_dir.display().to_string());
        })?;

        if matches!(plan, StartPlan::Proxy { .. }) {
            let command = self
                .platform
                .service_command(Package::Nginx, ServiceAction::Start)
                .ok_or_else(|| {
                    ServiceError::ProxyStartFailed(
                        "no start command available for this platform".to_string(),
                    )
                })?;
            let result = self.runner.run(&command, DEFAULT_TIMEOUT)?;
            if !result.success() {
                return Err(ServiceError::ProxyStartFailed(
                    result.stderr_or("unknown error"),
                ));
            }
            info!("proxy started");
        }

        let address = match self.bootstrap_daemon(&paths.daemon_config, &hs_dir, progress) {
            Ok(address) => address,
            Err(err) => {
                self.cleanup_proxy(&plan);
                return Err(err);
            }
        };

        if let StartPlan::Proxy { site_dir, .. } = &plan {
            self.start_watcher(site_dir, &paths.served_root);
        }

        {
            let mut settings = lock(&self.settings);
            settings.update(|s| {
                s.service_running = true;
                if let Some(address) = &address {
                    s.onion_address = Some(address.clone());
                }
            })?;
            let mut entry = HistoryEntry::new("service_started");
            if let Some(site_dir) = plan.site_dir() {
                entry = entry.with_site_directory(site_dir.display().to_string());
            }
            if let Some(address) = &address {
                entry = entry.with_onion_address(address.clone());
            }
            settings.record(entry)?;
        }

        let message = match &address {
            Some(address) => {
                info!(%address, "onion service started");
                "Onion service started successfully!".to_string()
            }
            None => {
                warn!("onion service started but the address is not readable yet");
                "Onion service started. The onion address is not readable yet; check status again shortly.".to_string()
            }
        };

        Ok(StartOutcome { address, message })
    }

    /// Stop everything, collecting failures instead of short-circuiting.
    /// The running flag is cleared no matter what.
    pub fn stop(&self) -> ServiceResult<()> {
        let mut failures: Vec<String> = Vec::new();

        let method = lock(&self.settings).get().hosting_method;
        if method == HostingMethod::Proxy {
            match self.platform.service_command(Package::Nginx, ServiceAction::Stop) {
                Some(command) => match self.runner.run(&command, DEFAULT_TIMEOUT) {
                    Ok(result) if result.success() => info!("proxy stopped"),
                    Ok(result) => {
                        failures.push(format!("proxy: {}", result.stderr_or("stop command failed")))
                    }
                    Err(err) => failures.push(format!("proxy: {err}")),
                },
                None => {}
            }
        }

        {
            let mut daemon = lock(&self.daemon);
            if let Some(child) = daemon.as_mut() {
                match child.try_wait() {
                    Ok(Some(_)) => {}
                    _ => {
                        info!("stopping daemon process");
                        if let Err(err) = child.kill() {
                            failures.push(format!("daemon: {err}"));
                        }
                        let _ = child.wait();
                    }
                }
            }
            *daemon = None;
        }
        self.progress.reset();

        // The daemon may also run as a system service; stopping one that is
        // not active exits non-zero and that is fine.
        if let Some(command) = self.platform.service_command(Package::Tor, ServiceAction::Stop) {
            match self.runner.run(&command, DEFAULT_TIMEOUT) {
                Ok(_) => {}
                Err(err) => tracing::debug!(%err, "daemon service stop fallback failed"),
            }
        }

        lock(&self.watcher).unwatch();

        {
            let mut settings = lock(&self.settings);
            if let Err(err) = settings.update(|s| s.service_running = false) {
                failures.push(format!("settings: {err}"));
            }
            if let Err(err) = settings.record(HistoryEntry::new("service_stopped")) {
                failures.push(format!("history: {err}"));
            }
        }

        if failures.is_empty() {
            info!("onion service stopped");
            Ok(())
        } else {
            Err(ServiceError::StopFailed(failures.join("; ")))
        }
    }

    /// Stop, settle, start. The settle delay gives the daemons time to
    /// release their sockets.
    pub fn restart(
        &self,
        site_directory: Option<&Path>,
        progress: Option<ProgressCallback>,
    ) -> ServiceResult<StartOutcome> {
        if lock(&self.settings).get().service_running || self.daemon_alive() {
            self.stop()?;
            thread::sleep(self.restart_settle);
        }
        self.start(site_directory, progress)
    }

    /// Aggregate live process state with persisted settings. Pure read.
    pub fn status(&self) -> ServiceStatus {
        let daemon_alive = self.daemon_alive();
        let settings = lock(&self.settings);
        let s = settings.get();
        ServiceStatus {
            running: s.service_running,
            daemon_alive,
            bootstrap_percent: self.progress.percent(),
            onion_address: s.onion_address.clone(),
            site_directory: s.site_directory.clone(),
            nginx_port: s.nginx_port,
            hosting_method: s.hosting_method,
            tor_installed: self.platform.is_installed(Package::Tor),
            nginx_installed: self.platform.is_installed(Package::Nginx),
        }
    }

    /// Where the bootstrap currently stands.
    pub fn bootstrap_phase(&self) -> BootstrapPhase {
        self.progress.phase()
    }

    /// Try to resolve the onion address now, persisting it when found.
    pub fn onion_address(&self) -> Option<String> {
        if let Some(address) = lock(&self.settings).get().onion_address.clone() {
            return Some(address);
        }
        let hs_dir = lock(&self.settings).get().hidden_service_dir.clone()?;
        let address =
            bootstrap::read_onion_address(&self.runner, self.platform.as_ref(), Path::new(&hs_dir))?;
        if let Err(err) = lock(&self.settings).update(|s| s.onion_address = Some(address.clone())) {
            warn!(%err, "could not persist onion address");
        }
        Some(address)
    }

    /// Installed state of both external daemons.
    pub fn check_dependencies(&self) -> DependencyReport {
        DependencyReport {
            tor: self.platform.is_installed(Package::Tor),
            nginx: self.platform.is_installed(Package::Nginx),
        }
    }

    /// Install `package` via the platform's package manager. Skips work
    /// when the package is already present.
    pub fn install_dependency(&self, package: Package) -> ServiceResult<String> {
        if self.platform.is_installed(package) {
            return Ok(format!("{package} is already installed."));
        }

        let command = self.platform.install_command(package).ok_or_else(|| {
            ServiceError::InvalidConfiguration(format!(
                "no install command available for {package} on this platform"
            ))
        })?;

        info!(%package, "installing dependency");
        let result = self.runner.run(&command, INSTALL_TIMEOUT)?;
        if !result.success() {
            return Err(ServiceError::CommandFailed {
                step: format!("install {package}"),
                stderr: result.stderr_or("unknown error"),
            });
        }

        let mut settings = lock(&self.settings);
        settings.update(|s| match package {
            Package::Tor => s.services.tor_installed = true,
            Package::Nginx => s.services.nginx_installed = true,
        })?;
        settings.record(HistoryEntry::new("dependency_installed").with_detail(package.name()))?;

        Ok(format!("{package} installed successfully!"))
    }

    /// Persisted settings snapshot, for display.
    pub fn settings_snapshot(&self) -> Settings {
        lock(&self.settings).get().clone()
    }

    /// Persisted lifecycle history, newest last.
    pub fn history(&self) -> Vec<HistoryEntry> {
        lock(&self.settings).get().history.clone()
    }

    pub fn set_hosting_method(&self, method: HostingMethod) -> ServiceResult<()> {
        lock(&self.settings).update(|s| s.hosting_method = method)?;
        Ok(())
    }

    pub fn set_custom_port(&self, port: u16) -> ServiceResult<()> {
        if !validate_port(port) {
            return Err(ServiceError::InvalidConfiguration(format!(
                "custom port {port} is out of range (1024-65535)"
            )));
        }
        lock(&self.settings).update(|s| s.custom_port = Some(port))?;
        Ok(())
    }

    pub fn set_proxy_port(&self, port: u16) -> ServiceResult<()> {
        if !validate_port(port) {
            return Err(ServiceError::InvalidConfiguration(format!(
                "proxy port {port} is out of range (1024-65535)"
            )));
        }
        lock(&self.settings).update(|s| s.nginx_port = port)?;
        Ok(())
    }

    pub fn set_site_directory(&self, directory: &Path) -> ServiceResult<()> {
        validate_site_directory(directory).map_err(|msg| {
            ServiceError::InvalidConfiguration(format!("{}: {msg}", directory.display()))
        })?;
        lock(&self.settings).update(|s| {
            s.site_directory = Some(directory.display().to_string());
        })?;
        Ok(())
    }

    fn validate_request(&self, site_directory: Option<&Path>) -> ServiceResult<StartPlan> {
        let settings = lock(&self.settings);
        let s = settings.get();

        match s.hosting_method {
            HostingMethod::Proxy => {
                let site_dir = site_directory
                    .map(Path::to_path_buf)
                    .or_else(|| s.site_directory.as_ref().map(PathBuf::from))
                    .ok_or_else(|| {
                        ServiceError::InvalidConfiguration(
                            "no content directory configured; pass one to start".to_string(),
                        )
                    })?;
                validate_site_directory(&site_dir).map_err(|msg| {
                    ServiceError::InvalidConfiguration(format!("{}: {msg}", site_dir.display()))
                })?;

                let port = s.nginx_port;
                if !validate_port(port) {
                    return Err(ServiceError::InvalidConfiguration(format!(
                        "proxy port {port} is out of range (1024-65535)"
                    )));
                }
                Ok(StartPlan::Proxy { site_dir, port })
            }
            HostingMethod::DirectPort => {
                let port = s.custom_port.ok_or_else(|| {
                    ServiceError::InvalidConfiguration(
                        "custom port not configured; set custom_port first".to_string(),
                    )
                })?;
                if !validate_port(port) {
                    return Err(ServiceError::InvalidConfiguration(format!(
                        "custom port {port} is out of range (1024-65535)"
                    )));
                }
                Ok(StartPlan::DirectPort { port })
            }
        }
    }

    /// Launch the daemon, wait out its bootstrap and read the address.
    fn bootstrap_daemon(
        &self,
        daemon_config: &Path,
        hs_dir: &Path,
        progress: Option<ProgressCallback>,
    ) -> ServiceResult<Option<String>> {
        if let Some(command) = self.platform.daemon_verify_command(daemon_config) {
            match self.runner.run(&command, Duration::from_secs(30)) {
                Ok(result) if !result.success() => {
                    let detail = result.stderr_or(result.stdout.trim());
                    return Err(ServiceError::BootstrapFailed(format!(
                        "daemon configuration is invalid: {detail}"
                    )));
                }
                Ok(_) => {}
                Err(crate::command::CommandError::Timeout(_)) => {
                    return Err(ServiceError::BootstrapFailed(
                        "daemon configuration check timed out".to_string(),
                    ));
                }
                Err(err) => {
                    // Not being able to verify is not the same as invalid.
                    warn!(%err, "could not verify daemon configuration");
                }
            }
        }

        let invocation = self.platform.daemon_invocation(daemon_config);
        let credential = if invocation.needs_elevation {
            match self.runner.credential().get() {
                Some(secret) => Some(secret),
                None => return Err(crate::command::CommandError::ElevationRequired.into()),
            }
        } else {
            None
        };

        self.progress.reset();
        self.progress.set_phase(BootstrapPhase::Launching);

        let monitor = BootstrapMonitor::with_timeout(self.bootstrap_timeout);
        let mut handle = match monitor.launch(&invocation, credential.as_deref()) {
            Ok(handle) => handle,
            Err(err) => {
                let reason = format!("daemon could not be launched: {err}");
                self.progress.set_phase(BootstrapPhase::Failed(reason.clone()));
                return Err(ServiceError::BootstrapFailed(reason));
            }
        };

        match monitor.wait(&mut handle, progress, &self.progress) {
            BootstrapWait::Complete { .. } => {
                thread::sleep(self.settle_delay);
                let address =
                    bootstrap::read_onion_address(&self.runner, self.platform.as_ref(), hs_dir);
                self.progress
                    .set_phase(BootstrapPhase::Ready(address.clone()));
                *lock(&self.daemon) = Some(handle.into_child());
                Ok(address)
            }
            BootstrapWait::TimedOut { percent, mut errors } => {
                self.progress.set_phase(BootstrapPhase::TimedOut);
                // Keep the handle so a later stop can reap the process.
                *lock(&self.daemon) = Some(handle.into_child());
                errors.truncate(SURFACED_ERROR_LINES);
                Err(ServiceError::BootstrapTimedOut { percent, errors })
            }
            BootstrapWait::Exited { percent, mut errors } => {
                let _ = handle.child_mut().wait();
                errors.truncate(SURFACED_ERROR_LINES);
                let reason = if errors.is_empty() {
                    format!("daemon exited at {percent}% before finishing bootstrap")
                } else {
                    format!(
                        "daemon exited at {percent}% before finishing bootstrap: {}",
                        errors.join(" | ")
                    )
                };
                self.progress.set_phase(BootstrapPhase::Failed(reason.clone()));
                Err(ServiceError::BootstrapFailed(reason))
            }
        }
    }

    /// Best-effort proxy stop after a failed daemon bootstrap.
    fn cleanup_proxy(&self, plan: &StartPlan) {
        if !matches!(plan, StartPlan::Proxy { .. }) {
            return;
        }
        if let Some(command) = self.platform.service_command(Package::Nginx, ServiceAction::Stop) {
            match self.runner.run(&command, DEFAULT_TIMEOUT) {
                Ok(result) if result.success() => info!("proxy stopped after failed bootstrap"),
                Ok(result) => warn!(stderr = %result.stderr.trim(), "proxy cleanup stop failed"),
                Err(err) => warn!(%err, "proxy cleanup stop failed"),
            }
        }
    }

    /// Wire the watcher to mirror `site_dir` into the served root.
    fn start_watcher(&self, site_dir: &Path, served_root: &Path) {
        let copy = siteconf::sync_command(self.platform.as_ref(), site_dir, served_root);
        let chown = siteconf::chown_command(self.platform.as_ref(), served_root);
        let runner = self.runner.clone();

        let sync: SyncFn = Box::new(move || {
            match runner.run(&copy, DEFAULT_TIMEOUT) {
                Ok(result) if result.success() => tracing::debug!("site files synced"),
                Ok(result) => warn!(stderr = %result.stderr.trim(), "site sync failed"),
                Err(err) => warn!(%err, "site sync failed"),
            }
            if let Some(chown) = &chown {
                let _ = runner.run(chown, DEFAULT_TIMEOUT);
            }
        });

        if let Err(err) = lock(&self.watcher).watch(site_dir, sync) {
            // The service works without live mirroring.
            warn!(%err, "file watcher could not start");
        }
    }

    fn daemon_alive(&self) -> bool {
        let mut daemon = lock(&self.daemon);
        match daemon.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

impl Drop for OnionService {
    fn drop(&mut self) {
        lock(&self.watcher).unwatch();
        // The credential lives exactly as long as its orchestrator.
        self.runner.credential().clear();
    }
}

/// Check that `directory` exists and contains a recognized index file.
pub fn validate_site_directory(directory: &Path) -> Result<(), String> {
    if !directory.exists() {
        return Err("directory does not exist".to_string());
    }
    if !directory.is_dir() {
        return Err("path is not a directory".to_string());
    }
    let has_index = VALID_INDEX_FILES
        .iter()
        .any(|name| directory.join(name).exists());
    if !has_index {
        return Err(format!(
            "no index file found; expected one of: {}",
            VALID_INDEX_FILES.join(", ")
        ));
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
