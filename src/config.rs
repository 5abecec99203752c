//! Engine configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. A TOML file with the engine settings and the group/channel list
//! 3. Environment variables prefixed with `ARCHIVE_ENGINE_`, nested keys
//!    separated by `__` (e.g. `ARCHIVE_ENGINE_WRITE_PERIOD=10`)
//!
//! # Example
//! ```toml
//! write_period = 30.0
//! get_threshold = 20.0
//!
//! [[group]]
//! name = "beamline"
//!
//!   [[group.channel]]
//!   name = "BL:current"
//!   period = 1.0
//!   monitor = true
//! ```

use crate::error::{AppResult, ArchiveError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ARCHIVE_ENGINE_";

/// Engine settings plus the groups and channels to archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between writes to storage
    pub write_period: f64,
    /// Scan periods at or above this use periodic polls instead of a subscription
    pub get_threshold: f64,
    /// Data file size in MB before starting a new file
    pub file_size: f64,
    /// Values stamped further than this many seconds in the future are dropped
    pub ignored_future: f64,
    /// Ring buffers hold `write_period * buffer_reserve / period` samples
    pub buffer_reserve: u32,
    /// Repeats of one value before a repeat marker is forced out
    pub max_repeat_count: u32,
    /// Disconnect channels while their groups are disabled
    pub disconnect_on_disable: bool,
    /// Groups to archive
    #[serde(rename = "group", default)]
    pub groups: Vec<GroupConfig>,
}

/// A named group of channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group name
    pub name: String,
    /// Member channels
    #[serde(rename = "channel", default)]
    pub channels: Vec<ChannelConfig>,
}

/// One channel inside a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Data source name
    pub name: String,
    /// Requested scan period in seconds
    pub period: f64,
    /// Archive every change pushed by the source
    #[serde(default)]
    pub monitor: bool,
    /// Sample periodically (the default when `monitor` is not set)
    #[serde(default)]
    pub scan: bool,
    /// Disable the group whenever this channel's value is above zero
    #[serde(default)]
    pub disable: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_period: 30.0,
            get_threshold: 20.0,
            file_size: 100.0,
            ignored_future: 60.0,
            buffer_reserve: 3,
            max_repeat_count: 100,
            disconnect_on_disable: false,
            groups: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path`, then environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ArchiveError::Configuration(format!(
                "config file '{}' not found",
                path.display()
            )));
        }
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults (no environment overrides).
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(text))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let positive = [
            ("write_period", self.write_period),
            ("get_threshold", self.get_threshold),
            ("file_size", self.file_size),
        ];
        for (key, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ArchiveError::Configuration(format!(
                    "{key} must be positive, got {value}"
                )));
            }
        }
        if !(self.ignored_future.is_finite() && self.ignored_future >= 0.0) {
            return Err(ArchiveError::Configuration(format!(
                "ignored_future must not be negative, got {}",
                self.ignored_future
            )));
        }
        if self.buffer_reserve == 0 {
            return Err(ArchiveError::Configuration("buffer_reserve must be at least 1".into()));
        }
        if self.max_repeat_count == 0 {
            return Err(ArchiveError::Configuration("max_repeat_count must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(ArchiveError::Configuration("group with empty name".into()));
            }
            if !names.insert(group.name.as_str()) {
                return Err(ArchiveError::Configuration(format!(
                    "duplicate group '{}'",
                    group.name
                )));
            }
            for channel in &group.channels {
                channel.validate(&group.name)?;
            }
        }
        Ok(())
    }

    /// Ring buffer capacity for a channel scanned every `period` seconds.
    pub fn suggested_buffer_space(&self, period: f64) -> usize {
        if period <= 0.0 {
            return 1;
        }
        let space = self.write_period * f64::from(self.buffer_reserve) / period;
        (space as usize).max(3)
    }

    /// The engine settings without groups.
    pub fn settings(&self) -> EngineConfig {
        EngineConfig {
            groups: Vec::new(),
            ..self.clone()
        }
    }

    /// Serialize as a TOML document.
    pub fn to_toml_string(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl ChannelConfig {
    fn validate(&self, group: &str) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(ArchiveError::Configuration(format!(
                "channel with empty name in group '{group}'"
            )));
        }
        if !(self.period.is_finite() && self.period > 0.0) {
            return Err(ArchiveError::Configuration(format!(
                "channel '{}' in group '{group}': period must be positive, got {}",
                self.name, self.period
            )));
        }
        if self.monitor && self.scan {
            return Err(ArchiveError::Configuration(format!(
                "channel '{}' in group '{group}': choose either monitor or scan",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
write_period = 10.0
max_repeat_count = 5

[[group]]
name = "beamline"

  [[group.channel]]
  name = "BL:current"
  period = 1.0
  monitor = true

  [[group.channel]]
  name = "BL:beam_off"
  period = 1.0
  disable = true

[[group]]
name = "vacuum"

  [[group.channel]]
  name = "VAC:pressure"
  period = 30.0
  scan = true
"#;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.write_period, 30.0);
        assert_eq!(config.get_threshold, 20.0);
        assert_eq!(config.buffer_reserve, 3);
        assert_eq!(config.max_repeat_count, 100);
        assert!(!config.disconnect_on_disable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_groups() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.write_period, 10.0);
        assert_eq!(config.max_repeat_count, 5);
        // Unset keys keep their defaults.
        assert_eq!(config.ignored_future, 60.0);
        assert_eq!(config.groups.len(), 2);
        let beamline = &config.groups[0];
        assert_eq!(beamline.channels.len(), 2);
        assert!(beamline.channels[0].monitor);
        assert!(beamline.channels[1].disable);
        assert!(config.groups[1].channels[0].scan);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.groups[1].name, "vacuum");
        assert!(EngineConfig::load_from("/nonexistent/engine.toml").is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.groups.push(config.groups[0].clone());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.buffer_reserve = 0;
        assert!(config.validate().is_err());

        let bad_period = "[[group]]\nname = \"g\"\n[[group.channel]]\nname = \"c\"\nperiod = -1.0\n";
        assert!(EngineConfig::from_toml_str(bad_period).is_err());

        let both = "[[group]]\nname = \"g\"\n[[group.channel]]\nname = \"c\"\nperiod = 1.0\nmonitor = true\nscan = true\n";
        assert!(EngineConfig::from_toml_str(both).is_err());
    }

    #[test]
    fn test_suggested_buffer_space() {
        let config = EngineConfig::default();
        assert_eq!(config.suggested_buffer_space(0.0), 1);
        assert_eq!(config.suggested_buffer_space(1.0), 90);
        assert_eq!(config.suggested_buffer_space(0.5), 180);
        assert_eq!(config.suggested_buffer_space(60.0), 3);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[[group.channel]]"));
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
