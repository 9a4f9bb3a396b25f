//! Shared configuration directory for the disposable inbox tools
//!
//! Config files live in `~/.config/tempmail/`, data files (SQLite database,
//! LMDB environment) default to `~/.local/share/tempmail/`.
//!
//! Call [`init`] at application startup to bootstrap both directories.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Directory name shared by config and data locations
const APP_DIR: &str = "tempmail";

/// Initialize the config and data directories.
///
/// Returns the config directory. Call this once at application startup.
pub fn init() -> Result<PathBuf> {
    ensure_dir(data_dir())?;
    ensure_dir(config_dir())
}

/// Get the config directory (~/.config/tempmail/)
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Get the data directory (~/.local/share/tempmail/)
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

/// Get the path to a config file within the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Get the path to a file or directory within the data directory
pub fn data_path(name: &str) -> Option<PathBuf> {
    data_dir().map(|p| p.join(name))
}

/// Check if a config file exists in the config directory
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Load and parse a JSON config file from the config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Load a JSON config file if it exists, otherwise return `T::default()`
pub fn load_json_or_default<T: DeserializeOwned + Default>(filename: &str) -> Result<T> {
    if config_exists(filename) {
        load_json(filename)
    } else {
        Ok(T::default())
    }
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Read a non-empty environment variable
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn ensure_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = dir.context("Could not determine application directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    Ok(dir)
}
