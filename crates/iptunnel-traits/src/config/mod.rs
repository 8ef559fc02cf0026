use std::path::Path;

use chrono::{DateTime, Local};
use merge::Merge;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A custom merge strategy for `Option<T>` fields. It overwrites the destination
/// (`left`) with the source (`right`) only if the source is `Some`.
fn overwrite_if_some<T>(left: &mut Option<T>, right: Option<T>) {
    if right.is_some() {
        *left = right;
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine the home directory for the configuration file")]
    NoConfigDir,
    #[error("Command cannot be empty")]
    EmptyCommand,
    #[error("Invalid SSH command format")]
    InvalidCommand,
    #[error("Invalid configuration file format")]
    InvalidFormat,
    #[error("Failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Merge, Debug, Clone, PartialEq)]
pub struct Config {
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub server_command: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub auto_connect: Option<bool>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub minimize_to_tray: Option<bool>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub show_notifications: Option<bool>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub first_run: Option<bool>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub log_level: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Local>>,
}

impl Config {
    /// A layer with every field unset, for merging over another config.
    pub fn empty() -> Self {
        Self {
            server_command: None,
            auto_connect: None,
            minimize_to_tray: None,
            show_notifications: None,
            first_run: None,
            log_level: None,
            last_updated: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_command: Some(String::new()),
            auto_connect: Some(false),
            minimize_to_tray: Some(true),
            show_notifications: Some(true),
            first_run: Some(true),
            log_level: Some("info".to_string()),
            last_updated: None,
        }
    }
}

/// Persistent store for the tunnel command and user preferences.
pub trait ConfigStore {
    fn config(&self) -> &Config;
    fn path(&self) -> &Path;

    /// The stored tunnel command, or an empty string.
    fn command(&self) -> String {
        self.config().server_command.clone().unwrap_or_default()
    }

    fn has_command(&self) -> bool {
        !self.command().trim().is_empty()
    }

    fn is_first_run(&self) -> bool {
        self.config().first_run.unwrap_or(true)
    }

    fn set_command(&mut self, command: &str) -> Result<(), ConfigError>;
    fn clear(&mut self) -> Result<(), ConfigError>;
    fn save(&mut self) -> Result<(), ConfigError>;
}
