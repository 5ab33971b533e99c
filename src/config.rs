//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the scan utility.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/default.toml` by default)
//! 2. Environment variables (prefixed with `CURRENT_SCAN_`, `__` separates sections)
//!
//! Every field has a default equal to the reference bench (Agilent source at
//! `GPIB0::10::INSTR`, Keithley picoammeter at `GPIB0::14::INSTR`), so an empty
//! file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use current_scan::config::ScanConfig;
//!
//! let config = ScanConfig::load()?;
//! println!("Meter: {}", config.meter.resource);
//! # Ok::<(), current_scan::error::ScanError>(())
//! ```

use crate::error::{AppResult, ScanError};
use crate::instrument::meter::MeterSetup;
use crate::instrument::ConnectionOptions;
use crate::sweep::VoltageSweep;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CURRENT_SCAN_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Bias voltage source
    #[serde(default)]
    pub source: SourceConfig,
    /// Picoammeter
    #[serde(default)]
    pub meter: MeterConfig,
    /// Voltage sweep applied by `run`
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Acquisition loop tuning
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Bias voltage source connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// VISA resource string
    #[serde(default = "default_source_resource")]
    pub resource: String,
    /// Minimum gap between requests in milliseconds (0 disables throttling)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Transport timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Picoammeter connection and measurement setup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterConfig {
    /// VISA resource string
    #[serde(default = "default_meter_resource")]
    pub resource: String,
    /// Minimum gap between requests in milliseconds (0 disables throttling)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Transport timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Integration time in power-line cycles
    #[serde(default = "default_nplc")]
    pub nplc: f64,
    /// Current measurement range in amps
    #[serde(default = "default_range")]
    pub range: f64,
}

/// Sweep parameters, bounded like the bias-scan form of the reference UI
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    /// First voltage (V)
    #[serde(default)]
    pub start: f64,
    /// Exclusive upper bound (V)
    #[serde(default = "default_sweep_end")]
    pub end: f64,
    /// Increment (V)
    #[serde(default = "default_sweep_step")]
    pub step: f64,
}

/// Acquisition loop tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionConfig {
    /// Cooperative sleep at the end of each cycle in milliseconds
    #[serde(default = "default_cycle_sleep_ms")]
    pub cycle_sleep_ms: u64,
}

// Default value functions
fn default_name() -> String {
    "Current Scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_resource() -> String {
    "GPIB0::10::INSTR".to_string()
}

fn default_meter_resource() -> String {
    "GPIB0::14::INSTR".to_string()
}

fn default_interval_ms() -> u64 {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_nplc() -> f64 {
    6.0
}

fn default_range() -> f64 {
    2e-8
}

fn default_sweep_end() -> f64 {
    30.0
}

fn default_sweep_step() -> f64 {
    0.05
}

fn default_cycle_sleep_ms() -> u64 {
    1
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            resource: default_source_resource(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            resource: default_meter_resource(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            nplc: default_nplc(),
            range: default_range(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: default_sweep_end(),
            step: default_sweep_step(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            cycle_sleep_ms: default_cycle_sleep_ms(),
        }
    }
}

impl SourceConfig {
    /// Minimum inter-request interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Transport options for opening this instrument
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::default().with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

impl MeterConfig {
    /// Minimum inter-request interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Measurement setup applied on initialization
    pub fn setup(&self) -> MeterSetup {
        MeterSetup {
            nplc: self.nplc,
            range: self.range,
        }
    }

    /// Transport options for opening this instrument
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::default().with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

impl SweepConfig {
    /// Materialize the configured sweep
    pub fn to_sweep(&self) -> AppResult<VoltageSweep> {
        VoltageSweep::new(self.start, self.end, self.step)
    }
}

impl AcquisitionConfig {
    /// Per-cycle cooperative sleep
    pub fn cycle_sleep(&self) -> Duration {
        Duration::from_millis(self.cycle_sleep_ms)
    }
}

impl ScanConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables can override configuration with prefix `CURRENT_SCAN_`
    /// Example: `CURRENT_SCAN_METER__NPLC=1`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: ScanConfig = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.source.resource.trim().is_empty() {
            return Err(ScanError::Configuration(
                "source.resource must not be empty".to_string(),
            ));
        }
        if self.meter.resource.trim().is_empty() {
            return Err(ScanError::Configuration(
                "meter.resource must not be empty".to_string(),
            ));
        }
        if self.source.resource == self.meter.resource {
            return Err(ScanError::Configuration(format!(
                "source and meter share resource '{}'",
                self.source.resource
            )));
        }

        if !(0.01..=10.0).contains(&self.meter.nplc) {
            return Err(ScanError::Configuration(format!(
                "Invalid meter.nplc {}. Must be 0.01-10",
                self.meter.nplc
            )));
        }
        if !self.meter.range.is_finite() || self.meter.range <= 0.0 {
            return Err(ScanError::Configuration(format!(
                "Invalid meter.range {}. Must be a positive current in amps",
                self.meter.range
            )));
        }

        check_bound("sweep.start", self.sweep.start, 0.0, 20.0)?;
        check_bound("sweep.end", self.sweep.end, 0.0, 50.0)?;
        check_bound("sweep.step", self.sweep.step, 0.001, 20.0)?;

        Ok(())
    }
}

fn check_bound(name: &str, value: f64, min: f64, max: f64) -> AppResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ScanError::Configuration(format!(
            "Invalid {} {}. Must be {}-{}",
            name, value, min, max
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_bench() {
        let config = ScanConfig::default();
        assert_eq!(config.source.resource, "GPIB0::10::INSTR");
        assert_eq!(config.meter.resource, "GPIB0::14::INSTR");
        assert_eq!(config.source.interval(), Duration::from_millis(1));
        assert_eq!(config.meter.nplc, 6.0);
        assert_eq!(config.meter.range, 2e-8);
        assert_eq!(config.sweep.end, 30.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[meter]\nnplc = 1.0\n\n[sweep]\nstart = 1.0\nend = 2.0\nstep = 0.5"
        )
        .unwrap();

        let config = ScanConfig::load_from(file.path()).unwrap();
        assert_eq!(config.meter.nplc, 1.0);
        assert_eq!(config.meter.resource, "GPIB0::14::INSTR");
        assert_eq!(config.sweep.step, 0.5);
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ScanConfig::default());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = ScanConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn shared_resource_rejected() {
        let mut config = ScanConfig::default();
        config.meter.resource = config.source.resource.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn sweep_bounds_enforced() {
        let mut config = ScanConfig::default();
        config.sweep.step = 0.0;
        assert!(config.validate().is_err());

        let mut config = ScanConfig::default();
        config.sweep.start = 25.0;
        assert!(config.validate().is_err());

        let mut config = ScanConfig::default();
        config.sweep.end = 51.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn meter_range_must_be_positive() {
        let mut config = ScanConfig::default();
        config.meter.range = -1.0;
        assert!(config.validate().is_err());
        config.meter.range = f64::NAN;
        assert!(config.validate().is_err());
    }
}
