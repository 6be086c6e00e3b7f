//! Configuration loading.
//!
//! Tunables for buffer sizes, retry bounds and delays. Read from
//! `config.json` in the config directory, then overridden by environment
//! variables. A missing or unreadable file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

use crate::constants;

/// Driver tunables.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Initial receive buffer for command sockets, in bytes.
    pub rx_buffer_size: usize,
    /// Initial receive buffer for event and auxiliary sockets, in bytes.
    pub event_rx_buffer_size: usize,
    /// Down/set/up cycles attempted before a mode switch gives up.
    pub mode_switch_attempts: u32,
    /// Sleep between attempts while the device reports busy, in milliseconds.
    pub mode_switch_busy_delay_ms: u64,
    /// Attempts for a dump the kernel keeps interrupting.
    pub dump_retry_attempts: u32,
    /// Delay before re-resolving groups after a family reload, in milliseconds.
    pub regroup_delay_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: constants::DEFAULT_RX_BUFFER_SIZE,
            event_rx_buffer_size: constants::DEFAULT_EVENT_RX_BUFFER_SIZE,
            mode_switch_attempts: constants::MODE_SWITCH_ATTEMPTS,
            mode_switch_busy_delay_ms: constants::MODE_SWITCH_BUSY_DELAY.as_millis() as u64,
            dump_retry_attempts: constants::DUMP_RETRY_ATTEMPTS,
            regroup_delay_ms: constants::REGROUP_DELAY.as_millis() as u64,
        }
    }
}

impl DriverConfig {
    /// Returns the configuration directory.
    ///
    /// Directory selection priority:
    /// 1. `NL80211D_CONFIG_DIR` env var
    /// 2. Platform config dir (`~/.config/nl80211d` on Linux)
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("NL80211D_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("nl80211d"))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_dir() {
            Ok(dir) => Self::load_from(&dir.join("config.json")).unwrap_or_else(|e| {
                log::debug!("Using default config: {:#}", e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Persists the configuration to `path`.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("NL80211D_MODE_SWITCH_ATTEMPTS") {
            if let Ok(attempts) = value.parse::<u32>() {
                self.mode_switch_attempts = attempts;
            }
        }

        if let Ok(value) = std::env::var("NL80211D_MODE_SWITCH_BUSY_DELAY_MS") {
            if let Ok(delay) = value.parse::<u64>() {
                self.mode_switch_busy_delay_ms = delay;
            }
        }

        if let Ok(value) = std::env::var("NL80211D_DUMP_RETRY_ATTEMPTS") {
            if let Ok(attempts) = value.parse::<u32>() {
                self.dump_retry_attempts = attempts;
            }
        }

        if let Ok(value) = std::env::var("NL80211D_RX_BUFFER_SIZE") {
            if let Ok(size) = value.parse::<usize>() {
                self.rx_buffer_size = size;
            }
        }
    }

    /// Busy-retry sleep as a duration.
    pub fn mode_switch_busy_delay(&self) -> Duration {
        Duration::from_millis(self.mode_switch_busy_delay_ms)
    }

    /// Regroup delay as a duration.
    pub fn regroup_delay(&self) -> Duration {
        Duration::from_millis(self.regroup_delay_ms)
    }
}
