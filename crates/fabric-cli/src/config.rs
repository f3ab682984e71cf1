//! Configuration file management for fabric.
//!
//! Provides a TOML-based config file at `~/.config/fabric/config.toml`
//! wrapping [`fabric_db::config::FabricConfig`], whose own `load` already
//! implements the file-then-env precedence chain.

use std::path::PathBuf;

use anyhow::{Context, Result};
use fabric_db::config::FabricConfig;

/// Return the fabric config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/fabric` or `~/.config/fabric`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fabric");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fabric")
}

/// Return the path to the fabric config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Resolve the effective [`FabricConfig`]: the on-disk file if present,
/// merged with `FABRIC_*` environment overrides, else the compiled default.
pub fn resolve() -> Result<FabricConfig> {
    FabricConfig::load(&config_path())
}

/// Serialize and write `config` to the config file, creating parent
/// directories as needed.
pub fn save_config(config: &FabricConfig) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}
