//! Configuration system using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. built-in defaults ([`Settings::default`], valid for headless use)
//! 2. `config/potentiostat.toml` (or any file given to [`Settings::load_from`])
//! 3. environment variables prefixed with `POTENTIOSTAT_`, nested keys split on
//!    `__` (e.g. `POTENTIOSTAT_DEVICE__PORT=/dev/ttyACM0`)
//!
//! # Example
//! ```no_run
//! use potentiostat_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Instrument on {}", settings.device.port);
//! # Ok::<(), potentiostat_daq::error::DaqError>(())
//! ```

use crate::data::acquisition::ReductionPolicy;
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/potentiostat.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "POTENTIOSTAT_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// `[application]` table
    pub application: ApplicationSettings,
    /// `[device]` table
    pub device: DeviceSettings,
    /// `[acquisition]` table
    pub acquisition: AcquisitionSettings,
    /// `[storage]` table
    pub storage: StorageSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "potentiostat".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Serial link to the instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Serial port path (`/dev/ttyUSB0`, `COM3`, ...)
    pub port: String,
    /// Modbus unit id of the instrument
    pub slave_address: u8,
    /// Line rate, 8N1
    pub baud_rate: u32,
    /// Per-read timeout in milliseconds
    pub timeout_ms: u64,
    /// Retries after the first attempt of a failed transaction
    pub max_retries: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            slave_address: 1,
            baud_rate: 1_500_000,
            timeout_ms: 30,
            max_retries: 3,
        }
    }
}

/// Sampling loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Default sampling interval in milliseconds
    pub sampling_interval_ms: u64,
    /// Longest uninterrupted wait of the driving loop, in milliseconds
    pub stop_poll_ms: u64,
    /// Optional incremental data reduction
    pub reduction: Option<ReductionPolicy>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 10,
            stop_poll_ms: 50,
            reduction: None,
        }
    }
}

impl AcquisitionSettings {
    /// `sampling_interval_ms` as a [`Duration`].
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    /// `stop_poll_ms` as a [`Duration`].
    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }
}

/// Output location defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Folder used when the caller does not name one
    pub output_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "application.log_level: invalid level '{}', must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.device.port.trim().is_empty() {
            return Err(DaqError::Configuration(
                "device.port: must not be empty".to_string(),
            ));
        }
        if self.device.baud_rate == 0 {
            return Err(DaqError::Configuration(
                "device.baud_rate: must be > 0".to_string(),
            ));
        }
        if self.device.timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "device.timeout_ms: must be > 0".to_string(),
            ));
        }
        if self.device.slave_address == 0 || self.device.slave_address > 247 {
            return Err(DaqError::Configuration(format!(
                "device.slave_address: {} is not a valid Modbus unit id (1-247)",
                self.device.slave_address
            )));
        }

        if self.acquisition.sampling_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "acquisition.sampling_interval_ms: must be > 0".to_string(),
            ));
        }
        if !(1..=1000).contains(&self.acquisition.stop_poll_ms) {
            return Err(DaqError::Configuration(format!(
                "acquisition.stop_poll_ms: {} must be within 1-1000",
                self.acquisition.stop_poll_ms
            )));
        }
        if let Some(policy) = &self.acquisition.reduction {
            policy
                .validate()
                .map_err(|reason| DaqError::Configuration(format!("acquisition.reduction: {reason}")))?;
        }

        Ok(())
    }
}
