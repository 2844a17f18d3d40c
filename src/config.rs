//! Persisted service settings for onionhost
//!
//! Handles loading and saving settings from ~/.config/onionhost/config.json,
//! including the append-only lifecycle history.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings file name
const CONFIG_FILE: &str = "config.json";

/// Application name for config directory
const APP_NAME: &str = "onionhost";

/// Most recent history entries kept on disk
const HISTORY_LIMIT: usize = 100;

/// Default loopback port the proxy listens on
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Ports below this need root to bind and are rejected outright
pub const MIN_PORT: u16 = 1024;

/// Settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse settings file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type for settings operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How published content reaches the hidden service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HostingMethod {
    /// nginx serves the content directory on a loopback port.
    #[default]
    #[serde(rename = "nginx")]
    Proxy,
    /// The hidden service forwards straight to a port the user manages.
    #[serde(rename = "custom_port")]
    DirectPort,
}

impl std::fmt::Display for HostingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostingMethod::Proxy => write!(f, "nginx"),
            HostingMethod::DirectPort => write!(f, "custom_port"),
        }
    }
}

/// Installation flags recorded after successful installs.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct InstalledServices {
    #[serde(default)]
    pub tor_installed: bool,
    #[serde(default)]
    pub nginx_installed: bool,
}

/// One lifecycle history record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub action: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onion_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryEntry {
    /// Create a new entry stamped with the current time.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            timestamp: Utc::now(),
            site_directory: None,
            onion_address: None,
            detail: None,
        }
    }

    pub fn with_site_directory(mut self, dir: impl Into<String>) -> Self {
        self.site_directory = Some(dir.into());
        self
    }

    pub fn with_onion_address(mut self, address: impl Into<String>) -> Self {
        self.onion_address = Some(address.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Persisted service settings.
///
/// The `nginx_port` key name is kept for compatibility with existing
/// config files even though it is simply "the proxy port".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub site_directory: Option<String>,

    #[serde(default = "default_proxy_port")]
    pub nginx_port: u16,

    #[serde(default)]
    pub custom_port: Option<u16>,

    #[serde(default)]
    pub hosting_method: HostingMethod,

    #[serde(default)]
    pub onion_address: Option<String>,

    #[serde(default)]
    pub service_running: bool,

    #[serde(default)]
    pub hidden_service_dir: Option<String>,

    #[serde(default = "default_config_name")]
    pub nginx_config_name: String,

    #[serde(default)]
    pub services: InstalledServices,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_config_name() -> String {
    "onion-site".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            site_directory: None,
            nginx_port: DEFAULT_PROXY_PORT,
            custom_port: None,
            hosting_method: HostingMethod::default(),
            onion_address: None,
            service_running: false,
            hidden_service_dir: None,
            nginx_config_name: default_config_name(),
            services: InstalledServices::default(),
            history: Vec::new(),
            last_modified: None,
        }
    }
}

/// Settings plus the file they live in.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    /// Get the default settings file path
    ///
    /// Returns ~/.config/onionhost/config.json on Linux/macOS
    pub fn default_path() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Open the store at the default location.
    pub fn open_default() -> ConfigResult<Self> {
        Self::open(Self::default_path()?)
    }

    /// Open the store at `path`, falling back to defaults when the file
    /// does not exist or cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();

        let settings = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::warn!(%err, "settings file unreadable, using defaults");
                    Settings::default()
                }
            }
        } else {
            Settings::default()
        };

        Ok(Self { path, settings })
    }

    /// The settings file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory holding the settings file (also used for log files).
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Current settings snapshot.
    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Apply a mutation and save immediately.
    pub fn update(&mut self, mutate: impl FnOnce(&mut Settings)) -> ConfigResult<()> {
        mutate(&mut self.settings);
        self.save()
    }

    /// Append a history entry, dropping the oldest beyond the cap.
    pub fn record(&mut self, entry: HistoryEntry) -> ConfigResult<()> {
        self.settings.history.push(entry);
        let len = self.settings.history.len();
        if len > HISTORY_LIMIT {
            self.settings.history.drain(..len - HISTORY_LIMIT);
        }
        self.save()
    }

    fn save(&mut self) -> ConfigResult<()> {
        self.settings.last_modified = Some(Utc::now());

        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let contents = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

/// True for ports a non-root service can bind (1024..=65535).
pub fn validate_port(port: u16) -> bool {
    port >= MIN_PORT
}

/// Parse and validate a port from user input.
pub fn parse_port(value: &str) -> Result<u16, String> {
    let port: u16 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{value}' is not a valid port number"))?;
    if !validate_port(port) {
        return Err(format!("port {port} is out of range ({MIN_PORT}-65535)"));
    }
    Ok(port)
}
