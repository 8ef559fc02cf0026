use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use directories::BaseDirs;
use merge::Merge;
use tracing::{debug, info, warn};

pub use iptunnel_traits::config::{Config, ConfigError, ConfigStore};

pub const APP_NAME: &str = "IPTunnelGsmMeta";
const CONFIG_FILE: &str = "config.json";

/// `%APPDATA%\IPTunnelGsmMeta\config.json` on Windows,
/// `~/.iptunnelgsmmeta/config.json` elsewhere.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let dirs = BaseDirs::new().ok_or(ConfigError::NoConfigDir)?;
    let dir = if cfg!(windows) {
        dirs.config_dir().join(APP_NAME)
    } else {
        dirs.home_dir().join(format!(".{}", APP_NAME.to_lowercase()))
    };
    Ok(dir.join(CONFIG_FILE))
}

/// Resolves a path that may start with `~/`.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    let Ok(rest) = path.strip_prefix("~") else {
        return Some(path.to_path_buf());
    };

    BaseDirs::new().map(|dirs| dirs.home_dir().join(rest))
}

/// Configuration persisted as a JSON file.
pub struct JsonConfigStore {
    path: PathBuf,
    config: Config,
}

impl JsonConfigStore {
    /// Opens the store at its default location.
    pub fn open_default() -> Result<Self, ConfigError> {
        Ok(Self::open(default_config_path()?))
    }

    /// Loads `path` over the defaults. A missing file yields the defaults; an
    /// unreadable one is reported and also yields the defaults, so the store
    /// stays usable and the next save repairs the file.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match read_layer(&path) {
            Ok(Some(layer)) => over_defaults(layer),
            Ok(None) => {
                debug!("No configuration at {}, using defaults", path.display());
                Config::default()
            }
            Err(e) => {
                warn!("Error loading config from {}: {}", path.display(), e);
                Config::default()
            }
        };
        Self { path, config }
    }

    pub fn auto_connect(&self) -> bool {
        self.config.auto_connect.unwrap_or(false)
    }

    pub fn set_auto_connect(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.config.auto_connect = Some(enabled);
        self.save()
    }

    pub fn minimize_to_tray(&self) -> bool {
        self.config.minimize_to_tray.unwrap_or(true)
    }

    pub fn set_minimize_to_tray(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.config.minimize_to_tray = Some(enabled);
        self.save()
    }

    pub fn show_notifications(&self) -> bool {
        self.config.show_notifications.unwrap_or(true)
    }

    pub fn set_show_notifications(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.config.show_notifications = Some(enabled);
        self.save()
    }

    pub fn log_level(&self) -> Option<&str> {
        self.config.log_level.as_deref()
    }

    pub fn export_to(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(&self.config)?)?;
        info!("Configuration exported to {}", path.display());
        Ok(())
    }

    /// Replaces the current configuration with the contents of `path` and
    /// saves it.
    pub fn import_from(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        if !value.is_object() {
            return Err(ConfigError::InvalidFormat);
        }
        let layer: Config = serde_json::from_value(value)?;
        self.config = over_defaults(layer);
        info!("Configuration imported from {}", path.display());
        self.save()
    }
}

impl ConfigStore for JsonConfigStore {
    fn config(&self) -> &Config {
        &self.config
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn set_command(&mut self, command: &str) -> Result<(), ConfigError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if !command.starts_with("ssh") {
            return Err(ConfigError::InvalidCommand);
        }

        self.config.server_command = Some(command.to_string());
        self.config.first_run = Some(false);
        self.save()
    }

    fn clear(&mut self) -> Result<(), ConfigError> {
        self.config = Config::default();
        self.save()
    }

    fn save(&mut self) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.config.last_updated = Some(Local::now());
        fs::write(&self.path, serde_json::to_string_pretty(&self.config)?)?;
        debug!("Configuration saved to {}", self.path.display());
        Ok(())
    }
}

fn read_layer(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn over_defaults(layer: Config) -> Config {
    let mut config = Config::default();
    config.merge(layer);
    config
}
