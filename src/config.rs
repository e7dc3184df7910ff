//! Configuration loading and defaults for burnguard.
//!
//! The config file is the settings collaborator: per-monitor policy keyed by
//! hardware id, with a `[defaults]` table for monitors that have no entry.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::domain::HardwareId;

/// Highest accepted brightness level.
pub const MAX_LEVEL: u8 = 100;

/// Errors found while validating a loaded configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dim_level {level} for {scope} is above {MAX_LEVEL}")]
    DimLevelOutOfRange { scope: String, level: u8 },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("hardware id {0} is configured more than once")]
    DuplicateMonitor(HardwareId),
}

/// Policy applied to monitors without their own `[[monitor]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorDefaults {
    /// Seconds without activity before a monitor is considered idle (default: 300).
    pub idle_timeout_seconds: u64,

    /// Brightness (0-100) applied while idle (default: 10).
    pub dim_level: u8,

    /// Cover the monitor with a black overlay while idle (default: false).
    pub blackout_enabled: bool,

    /// Whether burnguard touches the monitor at all (default: true).
    pub managed: bool,
}

impl Default for MonitorDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 300,
            dim_level: 10,
            blackout_enabled: false,
            managed: true,
        }
    }
}

/// Per-monitor overrides. Unset fields fall back to `[defaults]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorOverride {
    pub hardware_id: HardwareId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim_level: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blackout_enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<bool>,
}

impl MonitorOverride {
    /// An entry that overrides nothing.
    pub fn new(hardware_id: HardwareId) -> Self {
        Self {
            hardware_id,
            idle_timeout_seconds: None,
            dim_level: None,
            blackout_enabled: None,
            managed: None,
        }
    }
}

/// Effective, read-only policy for one monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub hardware_id: HardwareId,
    pub idle_timeout: Duration,
    pub dim_level: u8,
    pub blackout_enabled: bool,
    pub managed: bool,
}

/// Main configuration for burnguard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Topology polling interval in milliseconds (default: 2000).
    pub poll_interval_ms: u64,

    /// Activity sampling interval in milliseconds (default: 1000).
    pub idle_check_interval_ms: u64,

    /// Where pre-dim brightness values are persisted for crash recovery.
    /// If unset, uses the user state directory.
    pub brightness_state_path: Option<PathBuf>,

    /// Dry run mode: log brightness and overlay actions instead of executing.
    pub dry_run: bool,

    /// Policy for monitors without an entry.
    pub defaults: MonitorDefaults,

    /// Per-monitor entries.
    #[serde(rename = "monitor")]
    pub monitors: Vec<MonitorOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            idle_check_interval_ms: 1000,
            brightness_state_path: None,
            dry_run: false,
            defaults: MonitorDefaults::default(),
            monitors: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(default_path) = Self::default_path()
            && default_path.exists()
        {
            return Self::load(&default_path);
        }

        Ok(Self::default())
    }

    /// Default config location: `<config dir>/burnguard/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("burnguard").join("config.toml"))
    }

    /// Write the configuration as pretty TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("poll_interval_ms"));
        }
        if self.idle_check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("idle_check_interval_ms"));
        }
        if self.defaults.dim_level > MAX_LEVEL {
            return Err(ConfigError::DimLevelOutOfRange {
                scope: "defaults".to_string(),
                level: self.defaults.dim_level,
            });
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.monitors {
            if !seen.insert(&entry.hardware_id) {
                return Err(ConfigError::DuplicateMonitor(entry.hardware_id.clone()));
            }
            if let Some(level) = entry.dim_level
                && level > MAX_LEVEL
            {
                return Err(ConfigError::DimLevelOutOfRange {
                    scope: entry.hardware_id.to_string(),
                    level,
                });
            }
        }

        Ok(())
    }

    /// Resolve the effective settings for a monitor.
    pub fn settings_for(&self, hardware_id: &HardwareId) -> MonitorSettings {
        let entry = self.monitors.iter().find(|m| &m.hardware_id == hardware_id);
        let d = &self.defaults;

        MonitorSettings {
            hardware_id: hardware_id.clone(),
            idle_timeout: Duration::from_secs(
                entry
                    .and_then(|e| e.idle_timeout_seconds)
                    .unwrap_or(d.idle_timeout_seconds),
            ),
            dim_level: entry.and_then(|e| e.dim_level).unwrap_or(d.dim_level),
            blackout_enabled: entry
                .and_then(|e| e.blackout_enabled)
                .unwrap_or(d.blackout_enabled),
            managed: entry.and_then(|e| e.managed).unwrap_or(d.managed),
        }
    }

    /// Effective settings for every explicitly configured monitor.
    pub fn monitor_settings(&self) -> Vec<MonitorSettings> {
        self.monitors
            .iter()
            .map(|m| self.settings_for(&m.hardware_id))
            .collect()
    }

    /// Add an empty entry for each id that has none. Returns how many were added.
    pub fn adopt_monitors<'a>(&mut self, ids: impl IntoIterator<Item = &'a HardwareId>) -> usize {
        let mut added = 0;
        for id in ids {
            if !self.monitors.iter().any(|m| &m.hardware_id == id) {
                self.monitors.push(MonitorOverride::new(id.clone()));
                added += 1;
            }
        }
        added
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    /// Path of the brightness-state file.
    pub fn brightness_state_path(&self) -> Option<PathBuf> {
        if let Some(ref p) = self.brightness_state_path {
            return Some(p.clone());
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|d| d.join("burnguard").join("brightness.json"))
    }
}
