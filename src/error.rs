//! Custom error types for the experiment engine.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between raw user parameters and a flushed dataset.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidParameter`**: the experiment description is wrong (missing key, wrong
//!   type, out-of-bounds value, unknown key). Raised before any hardware contact.
//! - **`InvalidWaveform`**: parameters were individually valid but produce a degenerate
//!   or out-of-range waveform. Also raised before any hardware contact.
//! - **`Communication`**: the serial transport timed out, returned a malformed frame,
//!   or the instrument answered with a Modbus exception.
//! - **`Busy`**: a second run was requested while one is active.
//! - **`Aborted`**: a cooperative stop was requested mid-run.
//! - **`RunFailed`**: wraps `Communication`/`Aborted` once acquisition has started, and
//!   carries the partial dataset that was flushed on the way out.
//!
//! The remaining variants cover configuration, file and serialization failures.

use crate::data::storage::DatasetHandle;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Crate-wide error type. See the module docs for the hierarchy.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A request parameter is missing, mistyped, out of bounds or unknown.
    #[error("Invalid parameter '{key}': {reason}")]
    InvalidParameter {
        /// Offending key
        key: String,
        /// What is wrong with it
        reason: String,
    },

    /// The parameters produce a degenerate or out-of-range waveform.
    #[error("Invalid waveform: {0}")]
    InvalidWaveform(String),

    /// Transport, framing or Modbus exception failure.
    #[error("Communication error: {0}")]
    Communication(String),

    /// Another run holds the instrument.
    #[error("Instrument is busy with another experiment")]
    Busy,

    /// A stop request ended the run.
    #[error("Experiment aborted by stop request")]
    Aborted,

    /// A run failed after acquisition had started.
    #[error("Experiment failed: {cause}")]
    RunFailed {
        /// Underlying `Communication` or `Aborted` error
        cause: Box<DaqError>,
        /// Dataset flushed on the way out, if the sink accepted it
        dataset: Option<Box<DatasetHandle>>,
    },

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dataset file could not be written or parsed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Dataset header could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other sink failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl DaqError {
    /// Shorthand for an [`DaqError::InvalidParameter`].
    pub fn invalid_parameter(key: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::InvalidParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The originating error, looking through `RunFailed`.
    pub fn cause(&self) -> &DaqError {
        match self {
            DaqError::RunFailed { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// Partial dataset flushed before the error was reported, if any.
    pub fn partial_dataset(&self) -> Option<&DatasetHandle> {
        match self {
            DaqError::RunFailed { dataset, .. } => dataset.as_deref(),
            _ => None,
        }
    }

    /// Whether the error was raised before any hardware side effect.
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            DaqError::InvalidParameter { .. } | DaqError::InvalidWaveform(_) | DaqError::Busy
        )
    }
}
