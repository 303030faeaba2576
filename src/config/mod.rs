// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Configuration module

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::streaming::StreamingConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Application version
    pub version: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Enable demo mode (simulated PLC signal feed)
    pub demo_mode: bool,

    /// Signal / state-machine configuration
    pub signals: SignalConfig,

    /// Shift definitions
    pub shifts: Vec<ShiftConfig>,

    /// Streaming configuration
    pub streaming: StreamingConfig,

    /// Database configuration
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "moldwatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            demo_mode: false,
            signals: SignalConfig::default(),
            shifts: ShiftConfig::default_shifts(),
            streaming: StreamingConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.signals.validate()?;
        for shift in &config.shifts {
            shift.validate()?;
        }
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            // Create parent directories
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("moldwatch"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

/// Signal-timeout and evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Minutes without a power signal before a machine loses power state
    pub power_timeout_minutes: u32,

    /// Minutes without a cycle signal before a machine counts as not producing
    pub cycle_timeout_minutes: u32,

    /// Periodic state-evaluation interval in seconds
    pub tick_interval_secs: u64,

    /// Pin-mapping / timeout cache TTL in seconds
    pub cache_ttl_secs: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            power_timeout_minutes: 2,
            cycle_timeout_minutes: 3,
            tick_interval_secs: 60,
            cache_ttl_secs: 300,
        }
    }
}

impl SignalConfig {
    /// Validate timeout ranges (1-60 minutes)
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("power_timeout_minutes", self.power_timeout_minutes),
            ("cycle_timeout_minutes", self.cycle_timeout_minutes),
        ] {
            if !(1..=60).contains(&value) {
                return Err(anyhow!("{} must be between 1 and 60, got {}", name, value));
            }
        }
        Ok(())
    }
}

/// A recurring daily shift window, possibly wrapping past midnight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftConfig {
    /// Shift name
    pub name: String,

    /// Start time, "HH:MM"
    pub start: String,

    /// End time, "HH:MM" (end before start wraps past midnight)
    pub end: String,

    /// Whether the shift is in use
    pub active: bool,
}

impl ShiftConfig {
    pub fn default_shifts() -> Vec<Self> {
        vec![
            Self {
                name: "morning".to_string(),
                start: "06:00".to_string(),
                end: "14:00".to_string(),
                active: true,
            },
            Self {
                name: "afternoon".to_string(),
                start: "14:00".to_string(),
                end: "22:00".to_string(),
                active: true,
            },
            Self {
                name: "night".to_string(),
                start: "22:00".to_string(),
                end: "06:00".to_string(),
                active: true,
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        self.start_hour()?;
        self.end_hour()?;
        Ok(())
    }

    /// Hour-of-day the shift starts (minutes are ignored for hour bucketing)
    pub fn start_hour(&self) -> Result<u32> {
        parse_hour(&self.start)
    }

    /// Hour-of-day the shift ends (exclusive)
    pub fn end_hour(&self) -> Result<u32> {
        parse_hour(&self.end)
    }
}

fn parse_hour(hhmm: &str) -> Result<u32> {
    let (h, m) = hhmm
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid time '{}', expected HH:MM", hhmm))?;
    let hour: u32 = h.parse().map_err(|_| anyhow!("invalid hour in '{}'", hhmm))?;
    let minute: u32 = m.parse().map_err(|_| anyhow!("invalid minute in '{}'", hhmm))?;
    if hour > 23 || minute > 59 {
        return Err(anyhow!("time '{}' out of range", hhmm));
    }
    Ok(hour)
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database path
    pub path: PathBuf,

    /// Retention period for raw signal rows in days
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/moldwatch.db"),
            retention_days: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_range_enforced() {
        let mut cfg = SignalConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.power_timeout_minutes = 0;
        assert!(cfg.validate().is_err());

        cfg.power_timeout_minutes = 61;
        assert!(cfg.validate().is_err());

        cfg.power_timeout_minutes = 60;
        cfg.cycle_timeout_minutes = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_shift_time_parsing() {
        let shift = ShiftConfig {
            name: "night".to_string(),
            start: "22:00".to_string(),
            end: "06:00".to_string(),
            active: true,
        };
        assert_eq!(shift.start_hour().unwrap(), 22);
        assert_eq!(shift.end_hour().unwrap(), 6);

        let bad = ShiftConfig {
            name: "bad".to_string(),
            start: "25:00".to_string(),
            end: "06:00".to_string(),
            active: true,
        };
        assert!(bad.validate().is_err());
    }
}
