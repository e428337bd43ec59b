//! Configuration loading and validation for carpd

use carp::{Authenticator, CARP_KEY_LEN, CarpOptions, CarpRequest, Interval};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub options: OptionSettings,

    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub routers: Vec<RouterSettings>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.logging.validate()?;
        self.watcher.validate()?;

        let mut names = HashSet::new();
        for router in &self.routers {
            router.validate()?;
            if !names.insert(router.name.as_str()) {
                let mut errors = ValidationErrors::new();
                errors.add("routers", ValidationError::new("duplicate_router_name"));
                return Err(errors);
            }
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LoggingSettings {
    pub level: Option<String>,

    /// "text" (default) or "json"
    #[validate(custom = "validate_log_format")]
    pub format: Option<String>,
}

impl LoggingSettings {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn is_json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

/// Protocol-wide switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionSettings {
    pub allow: bool,
    pub preempt: bool,
    pub log_bad_packets: bool,
}

impl Default for OptionSettings {
    fn default() -> Self {
        let options = CarpOptions::default();
        Self {
            allow: options.allow,
            preempt: options.preempt,
            log_bad_packets: options.log_bad_packets,
        }
    }
}

impl From<&OptionSettings> for CarpOptions {
    fn from(settings: &OptionSettings) -> Self {
        CarpOptions {
            allow: settings.allow,
            preempt: settings.preempt,
            log_bad_packets: settings.log_bad_packets,
        }
    }
}

/// Host address watcher settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WatcherSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// One virtual router
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RouterSettings {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(range(min = 1))]
    pub vhid: u8,

    #[serde(default = "default_advbase")]
    #[validate(range(min = 1))]
    pub advbase: u8,

    #[serde(default)]
    #[validate(range(max = 254))]
    pub advskew: u8,

    /// Shared secret, at most 20 bytes of UTF-8
    #[serde(default)]
    #[validate(custom = "validate_password")]
    pub password: String,

    #[validate(length(min = 1))]
    pub addresses: Vec<IpAddr>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RouterSettings {
    /// Configuration request for the router
    pub fn request(&self) -> CarpRequest {
        CarpRequest {
            state: None,
            vhid: Some(self.vhid),
            timing: Some(Interval::new(self.advbase, self.advskew)),
            key: Some(Authenticator::key_from_passphrase(&self.password)),
        }
    }
}

fn default_advbase() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

// Custom validators

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "text" | "json" => Ok(()),
        _ => Err(ValidationError::new("log_format_invalid")),
    }
}

fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.len() > CARP_KEY_LEN {
        return Err(ValidationError::new("password_too_long"));
    }
    Ok(())
}

fn validate_poll_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(100..=60_000).contains(&millis) {
        return Err(ValidationError::new("poll_interval_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from `path`, or from the default search paths
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Candidate configuration files in lookup order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/carp/carpd.yaml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config/carp/carpd.yaml"));
        }
        paths.push(PathBuf::from("./carpd.yaml"));
        paths
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|p| p.is_file())
    }

    pub fn carp_options(&self) -> CarpOptions {
        CarpOptions::from(&self.options)
    }
}
