//! TOML-based configuration system.
//!
//! Loads the policy engine settings from a `policy.toml` file, falling back
//! to sensible defaults. Every struct implements `Default` so a missing or
//! partial config file still produces a working engine. Runtime messages
//! (`set-permissions`, `set-download-settings`, ...) override these values
//! in memory only.
//!
//! ## Config file search order
//!
//! 1. `SURIBROWS_POLICY_CONFIG` environment variable (explicit override)
//! 2. Next to the executable (`<exe_dir>/policy.toml`)
//! 3. Platform config directory (`%APPDATA%\SuriBrows\policy.toml` on Windows)
//! 4. Current working directory (`./policy.toml`)
//! 5. No file found → `Config::default()`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::download::DownloadSettings;
use crate::error::{PolicyError, Result};
use crate::filter::{AdblockMode, FilterListSource, default_filter_lists};
use crate::permission::PermissionSettings;

const CONFIG_FILE: &str = "policy.toml";

// ─────────────────────────────────────────────────────────────────────────────
// Config structs
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub sessions: SessionConfig,
    pub adblock: AdblockConfig,
    pub downloads: DownloadSettings,
    pub permissions: PermissionSettings,
}

/// Where downloads history, filter lists and favicons are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

/// Sessions created at startup and their shared redirect rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub startup: Vec<String>,
    /// Comma-separated `pattern~replacement` entries.
    pub redirects: String,
    /// Keep the HTTP cache of new sessions.
    pub cache: bool,
}

/// Filter-list sources and the mode used at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdblockConfig {
    pub mode: AdblockMode,
    pub lists: Vec<FilterListSource>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Default impls
// ─────────────────────────────────────────────────────────────────────────────

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: platform_data_dir().unwrap_or_else(|| PathBuf::from("suribrows-data")),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            startup: vec!["persist:main".to_string()],
            redirects: String::new(),
            cache: true,
        }
    }
}

impl Default for AdblockConfig {
    fn default() -> Self {
        Self {
            mode: AdblockMode::Static,
            lists: default_filter_lists(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config loading and saving
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Loads the first config file found. An unreadable or invalid file is
    /// logged and replaced by the defaults: startup never fails on config.
    pub fn load() -> Self {
        let Some(path) = find_config_path() else {
            info!("No config file found, using defaults");
            return Config::default();
        };
        match Self::load_from(&path) {
            Ok(config) => {
                info!(path = %path.display(), "Configuration loaded");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unusable config, using defaults");
                Config::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| PolicyError::io(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Writes to the platform config directory, where `load` finds it next.
    pub fn save(&self) -> io::Result<()> {
        self.save_to(&save_path())
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, content)?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

/// Searches for a config file in the standard locations.
fn find_config_path() -> Option<PathBuf> {
    // 1. Explicit env var override
    if let Ok(path) = std::env::var("SURIBROWS_POLICY_CONFIG") {
        let p = PathBuf::from(path);
        if p.is_file() {
            return Some(p);
        }
    }

    // 2. Next to the executable
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let p = dir.join(CONFIG_FILE);
        if p.is_file() {
            return Some(p);
        }
    }

    // 3. Platform config directory
    if let Some(dir) = platform_config_dir() {
        let p = dir.join(CONFIG_FILE);
        if p.is_file() {
            return Some(p);
        }
    }

    // 4. Current working directory
    let p = PathBuf::from(CONFIG_FILE);
    if p.is_file() {
        return Some(p);
    }

    None
}

/// Returns the platform-specific save path for the config file.
fn save_path() -> PathBuf {
    platform_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE)
}

/// Returns the platform config directory without adding a dependency.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|appdata| PathBuf::from(appdata).join("SuriBrows"))
    }
    #[cfg(not(windows))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .or_else(|| std::env::var("HOME").ok().map(|h| format!("{h}/.config")))
            .map(|dir| PathBuf::from(dir).join("suribrows"))
    }
}

/// Returns the platform data directory (downloads history, blocklists).
fn platform_data_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        std::env::var("LOCALAPPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("SuriBrows"))
    }
    #[cfg(not(windows))]
    {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .or_else(|| std::env::var("HOME").ok().map(|h| format!("{h}/.local/share")))
            .map(|dir| PathBuf::from(dir).join("suribrows"))
    }
}
