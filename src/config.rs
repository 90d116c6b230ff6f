//! Configuration System using Figment
//!
//! Strongly-typed configuration for the scan orchestrator. Configuration is
//! layered from:
//! 1. Built-in defaults
//! 2. A TOML file (`config/wire_scan.toml` by default)
//! 3. Environment variables prefixed with `WIRE_SCAN_`, using `__` to separate
//!    sections (e.g. `WIRE_SCAN_SCAN__SAMPLE_COUNT=40`)
//!
//! # Example
//! ```no_run
//! use wire_scan::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Samples per scan: {}", config.scan.sample_count);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, ScanError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/wire_scan.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "WIRE_SCAN_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scan orchestration settings
    #[serde(default)]
    pub scan: ScanSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Scalar settings consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Health-check timeout per channel, in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: f64,
    /// Default step/sample count for a scan
    #[serde(default = "default_sample_count")]
    pub sample_count: u32,
    /// Blend weight of the running average, in (0, 1)
    #[serde(default = "default_averaging_weight")]
    pub averaging_weight: f64,
    /// Ask before a scan overwrites device settings with defaults
    #[serde(default = "default_warn_destructive")]
    pub warn_before_destructive_mode: bool,
    /// Upper bound for a single command write, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: f64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            sample_count: default_sample_count(),
            averaging_weight: default_averaging_weight(),
            warn_before_destructive_mode: default_warn_destructive(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl ScanSettings {
    /// Health-check timeout as a `Duration`.
    pub fn connection_timeout(&self) -> Duration {
        secs_to_duration(self.connection_timeout_secs)
    }

    /// Command write timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        secs_to_duration(self.command_timeout_secs)
    }

    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.connection_timeout_secs.is_finite() && self.connection_timeout_secs > 0.0) {
            return Err(ScanError::Configuration(format!(
                "Invalid connection_timeout_secs {}. Must be > 0",
                self.connection_timeout_secs
            )));
        }
        if !(self.command_timeout_secs.is_finite() && self.command_timeout_secs > 0.0) {
            return Err(ScanError::Configuration(format!(
                "Invalid command_timeout_secs {}. Must be > 0",
                self.command_timeout_secs
            )));
        }
        if self.sample_count == 0 {
            return Err(ScanError::Configuration(
                "Invalid sample_count 0. Must be positive".to_string(),
            ));
        }
        if !(self.averaging_weight > 0.0 && self.averaging_weight < 1.0) {
            return Err(ScanError::Configuration(format!(
                "Invalid averaging_weight {}. Must be in (0, 1)",
                self.averaging_weight
            )));
        }
        Ok(())
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

// Default value functions
fn default_name() -> String {
    "wire-scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connection_timeout() -> f64 {
    2.0
}

fn default_sample_count() -> u32 {
    20
}

fn default_averaging_weight() -> f64 {
    0.5
}

fn default_warn_destructive() -> bool {
    true
}

fn default_command_timeout() -> f64 {
    2.0
}

impl AppConfig {
    /// Load from the default file location and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        self.scan.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.connection_timeout(), Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [application]
            name = "Test Scan"
            log_level = "debug"

            [scan]
            connection_timeout_secs = 0.5
            sample_count = 40
            averaging_weight = 0.25
            warn_before_destructive_mode = false
            "#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "Test Scan");
        assert_eq!(config.scan.sample_count, 40);
        assert_eq!(config.scan.averaging_weight, 0.25);
        assert!(!config.scan.warn_before_destructive_mode);
        assert_eq!(config.scan.connection_timeout(), Duration::from_millis(500));
        // Unspecified keys keep their defaults
        assert_eq!(config.scan.command_timeout_secs, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("WIRE_SCAN_SCAN__SAMPLE_COUNT", "7");
        let config = AppConfig::load_from("does/not/exist.toml");
        std::env::remove_var("WIRE_SCAN_SCAN__SAMPLE_COUNT");

        assert_eq!(config.unwrap().scan.sample_count, 7);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".into();
        assert!(matches!(
            config.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_scan_settings() {
        let cases = [
            ScanSettings {
                averaging_weight: 1.0,
                ..Default::default()
            },
            ScanSettings {
                averaging_weight: 0.0,
                ..Default::default()
            },
            ScanSettings {
                sample_count: 0,
                ..Default::default()
            },
            ScanSettings {
                connection_timeout_secs: -1.0,
                ..Default::default()
            },
        ];
        for settings in cases {
            assert!(settings.validate().is_err(), "{settings:?} should be rejected");
        }
    }
}
