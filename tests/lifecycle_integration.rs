//! End-to-end lifecycle tests.
//!
//! These drive `OnionService` against a `MockPlatform` whose paths live in a
//! temp directory, whose service commands are observable shell one-liners,
//! and whose daemon is a shell script emitting Tor-style bootstrap lines.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use onionhost::command::{ElevationCredential, PrivilegedRunner};
use onionhost::config::{HostingMethod, SettingsStore};
use onionhost::platform::{DaemonInvocation, MockPlatform, Package, PlatformPaths, ServiceAction};
use onionhost::service::OnionService;
use onionhost::ServiceError;
use tempfile::TempDir;

const ONION_ADDRESS: &str = "abcdefghijklmnop.onion";

/// Script that bootstraps to 100% and then lingers like a real daemon.
const HAPPY_DAEMON: &str = r#"echo "Bootstrapped 10% (conn): Connecting to a relay"
echo "Bootstrapped 50% (loading_descriptors): Loading relay descriptors"
echo "Bootstrapped 100% (done): Done"
sleep 10
"#;

fn write_daemon_script(dir: &Path, body: &str) -> DaemonInvocation {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-tor");
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    DaemonInvocation::new(path.display().to_string(), Vec::new())
}

fn write_site(root: &Path) -> PathBuf {
    let site = root.join("site");
    fs::create_dir_all(&site).expect("create site dir");
    fs::write(site.join("index.html"), "<h1>hidden hello</h1>").expect("write index");
    site
}

fn write_hostname(paths: &PlatformPaths) {
    let hs_dir = paths.daemon_data_dir.join("hidden_service");
    fs::create_dir_all(&hs_dir).expect("create hidden service dir");
    fs::write(hs_dir.join("hostname"), format!("{ONION_ADDRESS}\n")).expect("write hostname");
}

fn make_service(root: &Path, platform: MockPlatform) -> OnionService {
    let settings = SettingsStore::open(root.join("config.json")).expect("open settings");
    let runner = PrivilegedRunner::new(ElevationCredential::new(), true);
    OnionService::new(Box::new(platform), runner, settings)
        .with_bootstrap_timeout(Duration::from_secs(10))
        .with_settle_delay(Duration::ZERO)
        .with_restart_settle(Duration::ZERO)
}

#[test]
fn test_start_serves_site_and_returns_address() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths.clone()).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    let outcome = service.start(Some(&site), None).expect("start should succeed");
    assert_eq!(outcome.address.as_deref(), Some(ONION_ADDRESS));

    // Proxy config was applied and enabled.
    let vhost = paths.sites_available.join("onion-site");
    assert!(vhost.exists());
    let rendered = fs::read_to_string(&vhost).unwrap();
    assert!(rendered.contains("listen 127.0.0.1:8080;"));
    assert!(paths
        .sites_enabled
        .as_ref()
        .unwrap()
        .join("onion-site")
        .exists());

    // Site content was mirrored into the served root.
    assert!(paths.served_root.join("index.html").exists());

    // Hidden service stanza references the served port.
    let torrc = fs::read_to_string(&paths.daemon_config).unwrap();
    assert!(torrc.contains("HiddenServicePort 80 127.0.0.1:8080"));

    let status = service.status();
    assert!(status.running);
    assert!(status.daemon_alive);
    assert_eq!(status.onion_address.as_deref(), Some(ONION_ADDRESS));
    assert_eq!(status.bootstrap_percent, 100);

    service.stop().expect("stop should succeed");
    let status = service.status();
    assert!(!status.running);
    assert!(!status.daemon_alive);
}

#[test]
fn test_progress_callback_is_strictly_increasing() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let site = write_site(temp.path());

    let daemon = write_daemon_script(
        temp.path(),
        r#"echo "Bootstrapped 10%: First"
echo "Bootstrapped 5%: Regression noise"
echo "Bootstrapped 10%: Duplicate"
echo "Bootstrapped 45% (requesting_descriptors): Asking for more"
echo "Bootstrapped 100% (done): Done"
sleep 2
"#,
    );
    let platform = MockPlatform::new(paths).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = Box::new(move |percent: u8, _status: &str| {
        sink.lock().unwrap().push(percent);
    });

    service.start(Some(&site), Some(callback)).expect("start");

    let delivered = seen.lock().unwrap().clone();
    assert_eq!(delivered, vec![10, 45, 100]);

    service.stop().expect("stop");
}

#[test]
fn test_start_without_index_runs_no_commands() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let marker = temp.path().join("command-ran");

    let platform = MockPlatform::new(paths.clone())
        .with_service_command(
            Package::Nginx,
            ServiceAction::Start,
            format!("touch '{}'", marker.display()),
        )
        .with_service_command(
            Package::Nginx,
            ServiceAction::Stop,
            format!("touch '{}'", marker.display()),
        )
        .with_service_command(
            Package::Nginx,
            ServiceAction::Test,
            format!("touch '{}'", marker.display()),
        );
    let service = make_service(temp.path(), platform);

    let empty_site = temp.path().join("empty-site");
    fs::create_dir_all(&empty_site).unwrap();

    let result = service.start(Some(&empty_site), None);
    assert!(matches!(result, Err(ServiceError::InvalidConfiguration(_))));

    // Validation failed before anything mutated.
    assert!(!marker.exists());
    assert_eq!(fs::read_to_string(&paths.daemon_config).unwrap(), "");
    assert!(!paths.sites_available.join("onion-site").exists());
}

#[test]
fn test_start_with_missing_dependency_names_it() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let site = write_site(temp.path());

    let platform = MockPlatform::new(paths).without_package(Package::Tor);
    let service = make_service(temp.path(), platform);

    let result = service.start(Some(&site), None);
    match result {
        Err(ServiceError::MissingDependency(name)) => assert_eq!(name, "tor"),
        other => panic!("expected MissingDependency, got {other:?}"),
    }
}

#[test]
fn test_bootstrap_timeout_stops_proxy() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let site = write_site(temp.path());
    let stop_marker = temp.path().join("proxy-stopped");

    let daemon = write_daemon_script(
        temp.path(),
        r#"echo "Bootstrapped 25% (loading_status): Loading networkstatus consensus"
sleep 30
"#,
    );
    let platform = MockPlatform::new(paths)
        .with_daemon_invocation(daemon)
        .with_service_command(
            Package::Nginx,
            ServiceAction::Stop,
            format!("touch '{}'", stop_marker.display()),
        );
    let service = make_service(temp.path(), platform)
        .with_bootstrap_timeout(Duration::from_millis(500));

    let result = service.start(Some(&site), None);
    match result {
        Err(ServiceError::BootstrapTimedOut { percent, .. }) => assert_eq!(percent, 25),
        other => panic!("expected BootstrapTimedOut, got {other:?}"),
    }

    // Best-effort cleanup stopped the proxy.
    assert!(stop_marker.exists());

    // The half-bootstrapped daemon is reaped by a later stop.
    let _ = service.stop();
    assert!(!service.status().daemon_alive);
}

#[test]
fn test_daemon_death_reports_error_lines() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let site = write_site(temp.path());

    let daemon = write_daemon_script(
        temp.path(),
        r#"echo "Bootstrapped 15% (handshake): Handshaking"
echo "[err] Could not bind to 127.0.0.1:9050: Address already in use"
exit 1
"#,
    );
    let platform = MockPlatform::new(paths).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    let result = service.start(Some(&site), None);
    match result {
        Err(ServiceError::BootstrapFailed(reason)) => {
            assert!(reason.contains("15%"));
            assert!(reason.contains("Address already in use"));
        }
        other => panic!("expected BootstrapFailed, got {other:?}"),
    }
}

#[test]
fn test_stop_aggregates_proxy_failure_but_clears_running_flag() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths)
        .with_daemon_invocation(daemon)
        .with_service_command(
            Package::Nginx,
            ServiceAction::Stop,
            "echo 'nginx.service not loaded' >&2; false",
        );
    let service = make_service(temp.path(), platform);

    service.start(Some(&site), None).expect("start");
    assert!(service.status().running);

    let result = service.stop();
    match result {
        Err(ServiceError::StopFailed(message)) => {
            assert!(message.contains("proxy"));
            assert!(message.contains("nginx.service not loaded"));
        }
        other => panic!("expected StopFailed, got {other:?}"),
    }

    // The running flag never stays stale.
    let status = service.status();
    assert!(!status.running);
    assert!(!status.daemon_alive);
}

#[test]
fn test_repeated_start_keeps_single_stanza() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths.clone()).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    service.start(Some(&site), None).expect("first start");
    service.stop().expect("stop");
    service.start(Some(&site), None).expect("second start");
    service.stop().expect("second stop");

    let torrc = fs::read_to_string(&paths.daemon_config).unwrap();
    assert_eq!(torrc.matches("HiddenServiceDir").count(), 1);
}

#[test]
fn test_start_while_running_is_a_noop() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    service.start(Some(&site), None).expect("start");
    let again = service.start(Some(&site), None).expect("second start");
    assert!(again.message.contains("already running"));
    assert_eq!(again.address.as_deref(), Some(ONION_ADDRESS));

    service.stop().expect("stop");
}

#[test]
fn test_direct_port_mode_skips_proxy() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let proxy_marker = temp.path().join("proxy-started");

    fs::write(
        temp.path().join("config.json"),
        r#"{"hosting_method": "custom_port", "custom_port": 3000}"#,
    )
    .unwrap();

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths.clone())
        .with_daemon_invocation(daemon)
        .with_service_command(
            Package::Nginx,
            ServiceAction::Start,
            format!("touch '{}'", proxy_marker.display()),
        );
    let service = make_service(temp.path(), platform);

    let outcome = service.start(None, None).expect("start");
    assert_eq!(outcome.address.as_deref(), Some(ONION_ADDRESS));

    // No proxy involvement in direct-port mode.
    assert!(!proxy_marker.exists());
    assert!(!paths.sites_available.join("onion-site").exists());

    // The stanza forwards to the user's port instead.
    let torrc = fs::read_to_string(&paths.daemon_config).unwrap();
    assert!(torrc.contains("HiddenServicePort 80 127.0.0.1:3000"));

    service.stop().expect("stop");
}

#[test]
fn test_direct_port_mode_rejects_privileged_port() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());

    fs::write(
        temp.path().join("config.json"),
        r#"{"hosting_method": "custom_port", "custom_port": 80}"#,
    )
    .unwrap();

    let platform = MockPlatform::new(paths);
    let service = make_service(temp.path(), platform);

    let result = service.start(None, None);
    assert!(matches!(result, Err(ServiceError::InvalidConfiguration(_))));
}

#[test]
fn test_address_resolution_can_be_deferred() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    // Deliberately no hostname artifact yet.
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths.clone()).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    let outcome = service.start(Some(&site), None).expect("start");
    assert!(outcome.address.is_none());
    assert!(outcome.message.contains("shortly"));
    assert!(service.status().running);

    // The daemon writes the artifact a moment later; a poll resolves it.
    write_hostname(&paths);
    assert_eq!(service.onion_address().as_deref(), Some(ONION_ADDRESS));
    assert_eq!(
        service.status().onion_address.as_deref(),
        Some(ONION_ADDRESS)
    );

    service.stop().expect("stop");
}

#[test]
fn test_restart_runs_stop_then_start() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    service.start(Some(&site), None).expect("start");
    let outcome = service.restart(None, None).expect("restart");
    assert_eq!(outcome.address.as_deref(), Some(ONION_ADDRESS));
    assert!(service.status().running);

    service.stop().expect("stop");
}

#[test]
fn test_history_records_lifecycle() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    write_hostname(&paths);
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths).with_daemon_invocation(daemon);
    let service = make_service(temp.path(), platform);

    service.start(Some(&site), None).expect("start");
    service.stop().expect("stop");

    let history = service.history();
    let actions: Vec<&str> = history.iter().map(|entry| entry.action.as_str()).collect();
    assert_eq!(actions, vec!["service_started", "service_stopped"]);

    let started = &history[0];
    assert_eq!(started.onion_address.as_deref(), Some(ONION_ADDRESS));
    assert_eq!(
        started.site_directory.as_deref(),
        Some(site.display().to_string().as_str())
    );
}

#[test]
fn test_install_dependency_skips_when_present() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let install_marker = temp.path().join("installed");

    let platform = MockPlatform::new(paths).with_install_command(
        Package::Tor,
        format!("touch '{}'", install_marker.display()),
    );
    let service = make_service(temp.path(), platform);

    let message = service.install_dependency(Package::Tor).expect("install");
    assert!(message.contains("already installed"));
    assert!(!install_marker.exists());
}

#[test]
fn test_install_dependency_runs_install_command() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let install_marker = temp.path().join("installed");

    let platform = MockPlatform::new(paths)
        .without_package(Package::Nginx)
        .with_install_command(
            Package::Nginx,
            format!("touch '{}'", install_marker.display()),
        );
    let service = make_service(temp.path(), platform);

    service.install_dependency(Package::Nginx).expect("install");
    assert!(install_marker.exists());

    let settings = service.settings_snapshot();
    assert!(settings.services.nginx_installed);

    let history = service.history();
    assert_eq!(history.last().unwrap().action, "dependency_installed");
}

#[test]
fn test_failing_proxy_config_test_aborts_before_daemon() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let site = write_site(temp.path());
    let daemon_marker = temp.path().join("daemon-launched");

    let daemon = write_daemon_script(
        temp.path(),
        &format!("touch '{}'\n", daemon_marker.display()),
    );
    let platform = MockPlatform::new(paths)
        .with_daemon_invocation(daemon)
        .with_service_command(
            Package::Nginx,
            ServiceAction::Test,
            "echo 'nginx: configuration file test failed' >&2; false",
        );
    let service = make_service(temp.path(), platform);

    let result = service.start(Some(&site), None);
    match result {
        Err(ServiceError::CommandFailed { step, stderr }) => {
            assert_eq!(step, "proxy config test");
            assert!(stderr.contains("test failed"));
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }

    // The daemon was never touched.
    assert!(!daemon_marker.exists());
}

#[test]
fn test_daemon_verify_failure_is_fatal() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let site = write_site(temp.path());

    let daemon = write_daemon_script(temp.path(), HAPPY_DAEMON);
    let platform = MockPlatform::new(paths)
        .with_daemon_invocation(daemon)
        .with_daemon_verify_command("echo 'Invalid HiddenServiceDir' >&2; false");
    let service = make_service(temp.path(), platform);

    let result = service.start(Some(&site), None);
    match result {
        Err(ServiceError::BootstrapFailed(reason)) => {
            assert!(reason.contains("Invalid HiddenServiceDir"));
        }
        other => panic!("expected BootstrapFailed, got {other:?}"),
    }
}

#[test]
fn test_settings_reflect_hosting_method_changes() {
    let temp = TempDir::new().unwrap();
    let paths = MockPlatform::paths_under(temp.path());
    let platform = MockPlatform::new(paths);
    let service = make_service(temp.path(), platform);

    service
        .set_hosting_method(HostingMethod::DirectPort)
        .unwrap();
    service.set_custom_port(3000).unwrap();

    let settings = service.settings_snapshot();
    assert_eq!(settings.hosting_method, HostingMethod::DirectPort);
    assert_eq!(settings.custom_port, Some(3000));

    assert!(service.set_custom_port(80).is_err());
    assert!(service.set_proxy_port(100).is_err());
}
