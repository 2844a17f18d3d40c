//! Proxy and hidden-service configuration synthesis
//!
//! Renders the nginx virtual host and the Tor hidden-service stanza from
//! embedded minijinja templates, then applies them through the privileged
//! runner: vhosts are staged in a temp file and moved into place so the
//! running proxy never sees a partial write, and the Tor stanza is appended
//! at most once per hidden-service directory.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use minijinja::{context, Environment};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::command::{PrivilegedRunner, DEFAULT_TIMEOUT};
use crate::error::{ServiceError, ServiceResult};
use crate::platform::{Package, PlatformPaths, PlatformProvider, ServiceAction};

/// Virtual host served only on loopback; the hidden service is the sole
/// public entry point.
const PROXY_TEMPLATE: &str = r#"server {
    listen 127.0.0.1:{{ port }};
    server_name localhost;

    # Hide server details from visitors.
    server_tokens off;
    add_header X-Frame-Options "SAMEORIGIN" always;
    add_header X-Content-Type-Options "nosniff" always;
    add_header X-XSS-Protection "1; mode=block" always;
    add_header Referrer-Policy "no-referrer" always;

    root {{ document_root }};
    index index.html index.htm;

    location / {
        try_files $uri $uri/ =404;
    }

    # No access log; visits stay private.
    access_log off;
    error_log {{ error_log }};
}
"#;

const STANZA_TEMPLATE: &str = r#"# onionhost hidden service
HiddenServiceDir {{ service_dir }}
HiddenServicePort 80 127.0.0.1:{{ forward_port }}
"#;

fn environment() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("vhost", PROXY_TEMPLATE)?;
    env.add_template("stanza", STANZA_TEMPLATE)?;
    Ok(env)
}

/// Render the proxy virtual-host file. Pure; no I/O.
pub fn render_proxy_config(
    port: u16,
    document_root: &Path,
    error_log: &Path,
) -> Result<String, minijinja::Error> {
    let env = environment()?;
    let template = env.get_template("vhost")?;
    template.render(context! {
        port,
        document_root => document_root.display().to_string(),
        error_log => error_log.display().to_string(),
    })
}

/// Render the hidden-service stanza. Pure; no I/O.
pub fn render_hidden_service_stanza(
    service_dir: &Path,
    forward_port: u16,
) -> Result<String, minijinja::Error> {
    let env = environment()?;
    let template = env.get_template("stanza")?;
    template.render(context! {
        service_dir => service_dir.display().to_string(),
        forward_port,
    })
}

/// True when `config` already carries a `HiddenServiceDir` directive naming
/// exactly `service_dir`.
///
/// Matches the directive value, not a substring: a stanza for
/// `/var/lib/tor/hs2` must not count as covering `/var/lib/tor/hs`.
pub fn stanza_configured(config: &str, service_dir: &Path) -> bool {
    let wanted = service_dir.display().to_string();
    let wanted = wanted.trim_end_matches('/');

    config.lines().any(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return false;
        }
        let mut parts = line.split_whitespace();
        parts.next() == Some("HiddenServiceDir")
            && parts
                .next()
                .map(|value| value.trim_end_matches('/') == wanted)
                .unwrap_or(false)
    })
}

fn stage_temp_file(contents: &str) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Install the rendered vhost at `sites_available/<config_name>`.
///
/// The text is staged in a temp file and moved into place by a privileged
/// command, so the proxy never observes a half-written config.
pub fn apply_proxy_config(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
    rendered: &str,
    paths: &PlatformPaths,
    config_name: &str,
) -> ServiceResult<PathBuf> {
    let target = paths.sites_available.join(config_name);
    let staged = stage_temp_file(rendered)?;

    let command = platform.elevate(&format!(
        "mv '{}' '{}'",
        staged.path().display(),
        target.display()
    ));
    let result = runner.run(&command, DEFAULT_TIMEOUT)?;
    if !result.success() {
        return Err(ServiceError::CommandFailed {
            step: "install proxy config".to_string(),
            stderr: result.stderr_or("unknown error"),
        });
    }

    info!(config = %target.display(), "proxy config installed");
    Ok(target)
}

/// Symlink the vhost into sites-enabled, replacing any previous link, and
/// drop the distribution's default site so it cannot shadow ours.
///
/// No-op on platforms where sites-available is included directly.
pub fn enable_proxy_site(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
    paths: &PlatformPaths,
    config_name: &str,
) -> ServiceResult<()> {
    let Some(enabled_dir) = &paths.sites_enabled else {
        return Ok(());
    };

    let available = paths.sites_available.join(config_name);
    let enabled = enabled_dir.join(config_name);

    let remove = platform.elevate(&format!("rm -f '{}'", enabled.display()));
    runner.run(&remove, DEFAULT_TIMEOUT)?;

    let link = platform.elevate(&format!(
        "ln -s '{}' '{}'",
        available.display(),
        enabled.display()
    ));
    let result = runner.run(&link, DEFAULT_TIMEOUT)?;
    if !result.success() {
        return Err(ServiceError::CommandFailed {
            step: "enable proxy site".to_string(),
            stderr: result.stderr_or("unknown error"),
        });
    }

    let default_site = enabled_dir.join("default");
    let remove_default = platform.elevate(&format!("rm -f '{}'", default_site.display()));
    if let Err(err) = runner.run(&remove_default, DEFAULT_TIMEOUT) {
        warn!(%err, "could not remove default site link");
    }

    info!(link = %enabled.display(), "proxy site enabled");
    Ok(())
}

/// Run the proxy's configuration check, where the platform has one.
pub fn test_proxy_config(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
) -> ServiceResult<()> {
    if let Some(command) = platform.service_command(Package::Nginx, ServiceAction::Test) {
        let result = runner.run(&command, DEFAULT_TIMEOUT)?;
        if !result.success() {
            return Err(ServiceError::CommandFailed {
                step: "proxy config test".to_string(),
                stderr: result.stderr_or("unknown error"),
            });
        }
    }
    Ok(())
}

/// Copy the content directory into the served root and hand ownership to
/// the proxy user. The copy is idempotent; the watcher re-runs it on change.
pub fn sync_site_files(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
    source: &Path,
    served_root: &Path,
) -> ServiceResult<()> {
    let mkdir = platform.elevate(&format!("mkdir -p '{}'", served_root.display()));
    let result = runner.run(&mkdir, DEFAULT_TIMEOUT)?;
    if !result.success() {
        return Err(ServiceError::CommandFailed {
            step: "create served root".to_string(),
            stderr: result.stderr_or("unknown error"),
        });
    }

    let copy = sync_command(platform, source, served_root);
    let result = runner.run(&copy, DEFAULT_TIMEOUT)?;
    if !result.success() {
        return Err(ServiceError::CommandFailed {
            step: "copy site files".to_string(),
            stderr: result.stderr_or("unknown error"),
        });
    }

    if let Some(chown) = chown_command(platform, served_root) {
        let result = runner.run(&chown, DEFAULT_TIMEOUT)?;
        if !result.success() {
            // The proxy can usually still read the files; not fatal.
            warn!(stderr = %result.stderr.trim(), "could not set served-root ownership");
        }
    }

    debug!(source = %source.display(), "site files synced");
    Ok(())
}

/// The copy command `sync_site_files` runs; also handed to the watcher.
pub fn sync_command(platform: &dyn PlatformProvider, source: &Path, served_root: &Path) -> String {
    platform.elevate(&format!(
        "cp -r '{}'/* '{}'/",
        source.display(),
        served_root.display()
    ))
}

/// The ownership fix paired with `sync_command`, when the platform names a
/// proxy user.
pub fn chown_command(platform: &dyn PlatformProvider, served_root: &Path) -> Option<String> {
    platform.proxy_user().map(|user| {
        platform.elevate(&format!(
            "chown -R {user}:{user} '{}'",
            served_root.display()
        ))
    })
}

/// Create the hidden-service directory with the ownership and mode the
/// daemon insists on, and verify the mode actually took.
pub fn ensure_hidden_service_dir(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
    dir: &Path,
) -> ServiceResult<()> {
    let mkdir = platform.elevate(&format!("mkdir -p '{}'", dir.display()));
    let result = runner.run(&mkdir, DEFAULT_TIMEOUT)?;
    if !result.success() {
        return Err(ServiceError::CommandFailed {
            step: "create hidden service directory".to_string(),
            stderr: result.stderr_or("unknown error"),
        });
    }

    if let Some((user, group)) = platform.daemon_user() {
        let chown = platform.elevate(&format!("chown -R {user}:{group} '{}'", dir.display()));
        let result = runner.run(&chown, DEFAULT_TIMEOUT)?;
        if !result.success() {
            warn!(stderr = %result.stderr.trim(), "could not set hidden service ownership");
        }
    }

    let chmod = platform.elevate(&format!("chmod 700 '{}'", dir.display()));
    let result = runner.run(&chmod, DEFAULT_TIMEOUT)?;
    if !result.success() {
        return Err(ServiceError::PermissionSetupFailed {
            path: dir.display().to_string(),
            detail: result.stderr_or("chmod failed"),
        });
    }

    // The daemon refuses world-readable service directories; confirm the
    // mode rather than trusting chmod's exit code.
    let stat = platform.elevate(&format!("stat -c %a '{}'", dir.display()));
    let result = runner.run(&stat, DEFAULT_TIMEOUT)?;
    let mode = result.stdout.trim();
    if !result.success() || mode != "700" {
        return Err(ServiceError::PermissionSetupFailed {
            path: dir.display().to_string(),
            detail: if result.success() {
                format!("expected mode 700, found {mode}")
            } else {
                result.stderr_or("mode could not be read")
            },
        });
    }

    Ok(())
}

/// Read the daemon config, falling back to a privileged read when the file
/// is not directly readable. A missing file reads as empty.
pub fn read_daemon_config(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
    path: &Path,
) -> ServiceResult<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(_) => {
            let command = platform.elevate(&format!("cat '{}'", path.display()));
            let result = runner.run(&command, DEFAULT_TIMEOUT)?;
            if result.success() {
                Ok(result.stdout)
            } else if result.stderr.contains("No such file") {
                Ok(String::new())
            } else {
                Err(ServiceError::CommandFailed {
                    step: "read daemon config".to_string(),
                    stderr: result.stderr_or("unknown error"),
                })
            }
        }
    }
}

/// Append the hidden-service stanza unless one for `service_dir` already
/// exists. Returns whether anything was written.
///
/// Re-running start against the same directory must not pile up duplicate
/// stanzas; the daemon would refuse the config.
pub fn ensure_hidden_service_stanza(
    runner: &PrivilegedRunner,
    platform: &dyn PlatformProvider,
    daemon_config: &Path,
    service_dir: &Path,
    forward_port: u16,
) -> ServiceResult<bool> {
    let existing = read_daemon_config(runner, platform, daemon_config)?;
    if stanza_configured(&existing, service_dir) {
        debug!(dir = %service_dir.display(), "hidden service already configured");
        return Ok(false);
    }

    let stanza = render_hidden_service_stanza(service_dir, forward_port)?;
    let staged = stage_temp_file(&format!("\n{stanza}"))?;

    let append = platform.elevate(&format!(
        "sh -c \"cat '{}' >> '{}'\"",
        staged.path().display(),
        daemon_config.display()
    ));
    let result = runner.run(&append, DEFAULT_TIMEOUT)?;
    if !result.success() {
        return Err(ServiceError::CommandFailed {
            step: "update daemon config".to_string(),
            stderr: result.stderr_or("unknown error"),
        });
    }

    info!(dir = %service_dir.display(), port = forward_port, "hidden service configured");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ElevationCredential;
    use crate::platform::MockPlatform;
    use tempfile::TempDir;

    fn runner() -> PrivilegedRunner {
        PrivilegedRunner::new(ElevationCredential::new(), true)
    }

    #[test]
    fn test_render_proxy_config_round_trip() {
        let rendered = render_proxy_config(
            8080,
            Path::new("/var/www/html"),
            Path::new("/tmp/nginx-error.log"),
        )
        .unwrap();

        // Parse the listen and root directives back out.
        let listen = rendered
            .lines()
            .find_map(|line| line.trim().strip_prefix("listen 127.0.0.1:"))
            .and_then(|rest| rest.trim_end_matches(';').parse::<u16>().ok());
        let root = rendered
            .lines()
            .find_map(|line| line.trim().strip_prefix("root "))
            .map(|rest| rest.trim_end_matches(';'));

        assert_eq!(listen, Some(8080));
        assert_eq!(root, Some("/var/www/html"));
        assert!(rendered.contains("access_log off"));
        assert!(rendered.contains("error_log /tmp/nginx-error.log;"));
    }

    #[test]
    fn test_render_stanza_contents() {
        let rendered =
            render_hidden_service_stanza(Path::new("/var/lib/tor/hidden_service"), 8080).unwrap();
        assert!(rendered.contains("HiddenServiceDir /var/lib/tor/hidden_service"));
        assert!(rendered.contains("HiddenServicePort 80 127.0.0.1:8080"));
    }

    #[test]
    fn test_stanza_configured_exact_match() {
        let config = "SocksPort 9050\nHiddenServiceDir /var/lib/tor/hidden_service\nHiddenServicePort 80 127.0.0.1:8080\n";
        assert!(stanza_configured(
            config,
            Path::new("/var/lib/tor/hidden_service")
        ));
    }

    #[test]
    fn test_stanza_configured_rejects_prefix_match() {
        // A configured sibling that shares a path prefix must not count.
        let config = "HiddenServiceDir /var/lib/tor/hidden_service2\n";
        assert!(!stanza_configured(
            config,
            Path::new("/var/lib/tor/hidden_service")
        ));

        let config = "HiddenServiceDir /var/lib/tor/hidden_service\n";
        assert!(!stanza_configured(
            config,
            Path::new("/var/lib/tor/hidden_service2")
        ));
    }

    #[test]
    fn test_stanza_configured_ignores_comments() {
        let config = "# HiddenServiceDir /var/lib/tor/hidden_service\n";
        assert!(!stanza_configured(
            config,
            Path::new("/var/lib/tor/hidden_service")
        ));
    }

    #[test]
    fn test_stanza_configured_tolerates_trailing_slash() {
        let config = "HiddenServiceDir /var/lib/tor/hidden_service/\n";
        assert!(stanza_configured(
            config,
            Path::new("/var/lib/tor/hidden_service")
        ));
    }

    #[test]
    fn test_ensure_stanza_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());
        let runner = runner();
        let service_dir = paths.daemon_data_dir.join("hidden_service");

        let first = ensure_hidden_service_stanza(
            &runner,
            &platform,
            &paths.daemon_config,
            &service_dir,
            8080,
        )
        .unwrap();
        let second = ensure_hidden_service_stanza(
            &runner,
            &platform,
            &paths.daemon_config,
            &service_dir,
            8080,
        )
        .unwrap();

        assert!(first);
        assert!(!second);

        let config = fs::read_to_string(&paths.daemon_config).unwrap();
        let count = config.matches("HiddenServiceDir").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_ensure_stanza_appends_for_sibling_directory() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());
        let runner = runner();

        let first_dir = paths.daemon_data_dir.join("hidden_service");
        let second_dir = paths.daemon_data_dir.join("hidden_service2");

        ensure_hidden_service_stanza(&runner, &platform, &paths.daemon_config, &first_dir, 8080)
            .unwrap();
        let appended = ensure_hidden_service_stanza(
            &runner,
            &platform,
            &paths.daemon_config,
            &second_dir,
            8081,
        )
        .unwrap();

        assert!(appended);
        let config = fs::read_to_string(&paths.daemon_config).unwrap();
        assert_eq!(config.matches("HiddenServiceDir").count(), 2);
    }

    #[test]
    fn test_ensure_stanza_preserves_existing_config() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        fs::write(&paths.daemon_config, "SocksPort 9050\n").unwrap();
        let platform = MockPlatform::new(paths.clone());

        ensure_hidden_service_stanza(
            &runner(),
            &platform,
            &paths.daemon_config,
            &paths.daemon_data_dir.join("hidden_service"),
            8080,
        )
        .unwrap();

        let config = fs::read_to_string(&paths.daemon_config).unwrap();
        assert!(config.starts_with("SocksPort 9050\n"));
        assert!(config.contains("HiddenServiceDir"));
    }

    #[test]
    fn test_read_daemon_config_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());

        let contents =
            read_daemon_config(&runner(), &platform, &temp.path().join("missing-torrc")).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn test_apply_proxy_config_moves_into_place() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());

        let rendered = render_proxy_config(
            8080,
            &paths.served_root,
            &temp.path().join("nginx-error.log"),
        )
        .unwrap();
        let target =
            apply_proxy_config(&runner(), &platform, &rendered, &paths, "onion-site").unwrap();

        assert_eq!(target, paths.sites_available.join("onion-site"));
        let written = fs::read_to_string(&target).unwrap();
        assert_eq!(written, rendered);
    }

    #[test]
    fn test_enable_proxy_site_creates_symlink() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());
        let runner = runner();

        let rendered = render_proxy_config(8080, &paths.served_root, &temp.path().join("err.log"))
            .unwrap();
        apply_proxy_config(&runner, &platform, &rendered, &paths, "onion-site").unwrap();
        enable_proxy_site(&runner, &platform, &paths, "onion-site").unwrap();

        let link = paths.sites_enabled.as_ref().unwrap().join("onion-site");
        assert!(link.exists());

        // Re-enabling replaces the link instead of failing.
        enable_proxy_site(&runner, &platform, &paths, "onion-site").unwrap();
        assert!(link.exists());
    }

    #[test]
    fn test_enable_proxy_site_removes_default_link() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());
        let runner = runner();

        let enabled_dir = paths.sites_enabled.clone().unwrap();
        fs::write(enabled_dir.join("default"), "default site").unwrap();

        let rendered = render_proxy_config(8080, &paths.served_root, &temp.path().join("err.log"))
            .unwrap();
        apply_proxy_config(&runner, &platform, &rendered, &paths, "onion-site").unwrap();
        enable_proxy_site(&runner, &platform, &paths, "onion-site").unwrap();

        assert!(!enabled_dir.join("default").exists());
    }

    #[test]
    fn test_sync_site_files_copies_content() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());

        let source = temp.path().join("site");
        fs::create_dir_all(source.join("assets")).unwrap();
        fs::write(source.join("index.html"), "<h1>hi</h1>").unwrap();
        fs::write(source.join("assets/app.css"), "body {}").unwrap();

        sync_site_files(&runner(), &platform, &source, &paths.served_root).unwrap();

        assert!(paths.served_root.join("index.html").exists());
        assert!(paths.served_root.join("assets/app.css").exists());
    }

    #[test]
    fn test_ensure_hidden_service_dir_sets_mode() {
        let temp = TempDir::new().unwrap();
        let paths = MockPlatform::paths_under(temp.path());
        let platform = MockPlatform::new(paths.clone());
        let dir = paths.daemon_data_dir.join("hidden_service");

        ensure_hidden_service_dir(&runner(), &platform, &dir).unwrap();

        assert!(dir.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
