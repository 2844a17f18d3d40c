use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use onionhost::bootstrap::ProgressCallback;
use onionhost::config::{self, HostingMethod, SettingsStore};
use onionhost::logging::{init_logging, LogConfig, Verbosity};
use onionhost::platform::{HostPlatform, Package, PlatformProvider};
use onionhost::{ElevationCredential, OnionService, PrivilegedRunner, ServiceError};

#[derive(Parser)]
#[command(name = "onionhost")]
#[command(version)]
#[command(about = "Host static websites as Tor hidden services")]
#[command(
    long_about = "Publishes a local content directory as a Tor hidden service: nginx serves it on a loopback port and Tor forwards onion connections to it."
)]
struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Write detailed logs to this file
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the onion service
    Start {
        /// Content directory to publish (defaults to the saved one)
        directory: Option<PathBuf>,
    },
    /// Stop the onion service
    Stop,
    /// Restart the onion service
    Restart {
        /// Content directory to publish (defaults to the saved one)
        directory: Option<PathBuf>,
    },
    /// Show service status
    Status,
    /// Install a dependency (tor, nginx or all)
    Install {
        /// Package name
        package: String,
    },
    /// Show recent lifecycle history
    History,
    /// Show or change persisted configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the persisted configuration
    Show,
    /// Set a key: hosting_method, custom_port, nginx_port or site_directory
    Set { key: String, value: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stderr belongs to the progress bar by default; -v turns on info logs.
    let verbosity = match cli.verbose {
        0 => Verbosity::Quiet,
        1 => Verbosity::Normal,
        2 => Verbosity::Verbose,
        _ => Verbosity::Trace,
    };
    let _log_guard = init_logging(&LogConfig {
        verbosity,
        log_file: cli.log_file.clone(),
    });

    let platform = HostPlatform::detect();
    let elevated = platform.has_elevated_privileges();
    let runner = PrivilegedRunner::new(ElevationCredential::new(), elevated);
    let settings = SettingsStore::open_default().context("could not open settings")?;
    let service = OnionService::new(Box::new(platform), runner, settings);

    // Privileged operations need the sudo password; ask once up front
    // rather than failing halfway through a stop that cannot roll back.
    let needs_elevation = matches!(
        cli.command,
        Commands::Start { .. } | Commands::Stop | Commands::Restart { .. } | Commands::Install { .. }
    );
    if needs_elevation && !elevated {
        prompt_credential(&service)?;
    }

    match cli.command {
        Commands::Start { directory } => run_lifecycle(&service, directory.as_deref(), false),
        Commands::Restart { directory } => run_lifecycle(&service, directory.as_deref(), true),
        Commands::Stop => run_stop(&service),
        Commands::Status => run_status(&service),
        Commands::Install { package } => run_install(&service, &package),
        Commands::History => run_history(&service),
        Commands::Config { action } => run_config(&service, action),
    }
}

/// Start or restart, prompting for the sudo password when a step needs it.
fn run_lifecycle(service: &OnionService, directory: Option<&Path>, restart: bool) -> Result<()> {
    let mut attempts = 0;
    loop {
        let progress = progress_bar();
        let result = if restart {
            service.restart(directory, Some(progress))
        } else {
            service.start(directory, Some(progress))
        };

        match result {
            Ok(outcome) => {
                println!();
                println!("{}", outcome.message);
                if let Some(address) = &outcome.address {
                    println!();
                    println!("Your onion address:");
                    println!("{address}");
                    copy_to_clipboard(address);
                }
                return Ok(());
            }
            Err(err) if err.needs_credential() && attempts < 2 => {
                attempts += 1;
                eprintln!();
                prompt_credential(service)?;
            }
            Err(err) => {
                eprintln!();
                return Err(err.into());
            }
        }
    }
}

fn run_stop(service: &OnionService) -> Result<()> {
    match service.stop() {
        Ok(()) => {
            println!("Onion service stopped successfully!");
            Ok(())
        }
        Err(err @ ServiceError::StopFailed(_)) => {
            // The running flag is cleared regardless; report and exit nonzero.
            Err(err.into())
        }
        Err(err) if err.needs_credential() => {
            prompt_credential(service)?;
            service.stop()?;
            println!("Onion service stopped successfully!");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn run_status(service: &OnionService) -> Result<()> {
    let status = service.status();

    println!("Service status");
    println!("  running:            {}", status.running);
    println!("  daemon process:     {}", if status.daemon_alive { "alive" } else { "not running" });
    println!("  bootstrap:          {}%", status.bootstrap_percent);
    println!(
        "  onion address:      {}",
        status.onion_address.as_deref().unwrap_or("(not yet assigned)")
    );
    println!(
        "  site directory:     {}",
        status.site_directory.as_deref().unwrap_or("(not set)")
    );
    println!("  hosting method:     {}", status.hosting_method);
    println!("  proxy port:         {}", status.nginx_port);
    println!("  tor installed:      {}", status.tor_installed);
    println!("  nginx installed:    {}", status.nginx_installed);
    Ok(())
}

fn run_install(service: &OnionService, package: &str) -> Result<()> {
    let packages: Vec<Package> = match package.to_lowercase().as_str() {
        "tor" => vec![Package::Tor],
        "nginx" => vec![Package::Nginx],
        "all" => vec![Package::Tor, Package::Nginx],
        other => anyhow::bail!("unknown package '{other}'; expected tor, nginx or all"),
    };

    for package in packages {
        let mut attempts = 0;
        loop {
            match service.install_dependency(package) {
                Ok(message) => {
                    println!("{message}");
                    break;
                }
                Err(err) if err.needs_credential() && attempts < 2 => {
                    attempts += 1;
                    prompt_credential(service)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

fn run_history(service: &OnionService) -> Result<()> {
    let history = service.history();
    if history.is_empty() {
        println!("No history yet.");
        return Ok(());
    }

    for entry in &history {
        let mut line = format!(
            "{}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.action
        );
        if let Some(dir) = &entry.site_directory {
            line.push_str(&format!("  dir={dir}"));
        }
        if let Some(address) = &entry.onion_address {
            line.push_str(&format!("  address={address}"));
        }
        if let Some(detail) = &entry.detail {
            line.push_str(&format!("  {detail}"));
        }
        println!("{line}");
    }
    Ok(())
}

fn run_config(service: &OnionService, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let settings = service.settings_snapshot();
            println!("Current configuration:");
            println!(
                "  site_directory = {}",
                settings.site_directory.as_deref().unwrap_or("(not set)")
            );
            println!("  hosting_method = {}", settings.hosting_method);
            println!("  nginx_port = {}", settings.nginx_port);
            match settings.custom_port {
                Some(port) => println!("  custom_port = {port}"),
                None => println!("  custom_port = (not set)"),
            }
            println!(
                "  onion_address = {}",
                settings.onion_address.as_deref().unwrap_or("(not set)")
            );
            println!("  service_running = {}", settings.service_running);
            Ok(())
        }
        ConfigAction::Set { key, value } => {
            match key.as_str() {
                "hosting_method" => {
                    let method = match value.as_str() {
                        "nginx" => HostingMethod::Proxy,
                        "custom_port" => HostingMethod::DirectPort,
                        other => anyhow::bail!(
                            "invalid hosting method '{other}'; use 'nginx' or 'custom_port'"
                        ),
                    };
                    service.set_hosting_method(method)?;
                    if method == HostingMethod::DirectPort {
                        println!("Remember to set custom_port: config set custom_port <port>");
                    }
                }
                "custom_port" => {
                    let port = config::parse_port(&value).map_err(anyhow::Error::msg)?;
                    service.set_custom_port(port)?;
                }
                "nginx_port" => {
                    let port = config::parse_port(&value).map_err(anyhow::Error::msg)?;
                    service.set_proxy_port(port)?;
                }
                "site_directory" => {
                    service.set_site_directory(Path::new(&value))?;
                }
                other => anyhow::bail!(
                    "unknown key '{other}'; expected hosting_method, custom_port, nginx_port or site_directory"
                ),
            }
            println!("Configuration saved.");
            Ok(())
        }
    }
}

/// Render bootstrap progress as a bar on stderr. Runs on a worker thread.
fn progress_bar() -> ProgressCallback {
    const BAR_WIDTH: usize = 40;
    Box::new(move |percent, status| {
        let filled = (BAR_WIDTH * percent as usize) / 100;
        let bar: String = "#".repeat(filled) + &"-".repeat(BAR_WIDTH - filled);
        let status: String = status.chars().take(50).collect();
        eprint!("\r[{bar}] {percent:>3}% - {status:<50}");
        let _ = io::stderr().flush();
        if percent >= 100 {
            eprintln!();
        }
    })
}

fn prompt_credential(service: &OnionService) -> Result<()> {
    let secret = inquire::Password::new("sudo password:")
        .without_confirmation()
        .with_display_mode(inquire::PasswordDisplayMode::Hidden)
        .prompt()
        .context("could not read password")?;
    service.credential().set(secret);
    Ok(())
}

/// Best effort; plenty of environments have no clipboard at all.
fn copy_to_clipboard(address: &str) {
    match arboard::Clipboard::new().and_then(|mut clipboard| clipboard.set_text(address.to_string()))
    {
        Ok(()) => println!("(copied to clipboard)"),
        Err(err) => tracing::debug!(%err, "clipboard unavailable"),
    }
}
