//! # Potentiostat DAQ
//!
//! Experiment execution engine for a serial-connected potentiostat/galvanostat.
//! It turns a declarative measurement description into a timed sequence of
//! setpoints, drives them against the instrument while a background task samples
//! potential and current, and hands back a complete, ordered dataset.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: register map, Modbus RTU framing, serial and simulated
//!   transports, and the shared [`hardware::SharedDeviceLink`].
//! - **`experiment`**: parameter schema, waveform generation, lifecycle states and
//!   the [`experiment::ExperimentController`].
//! - **`data`**: the sampling task, reduction policies and dataset persistence.
//! - **`config`**: layered settings loaded with `figment`.
//! - **`error`**: the crate-wide [`error::DaqError`].
//! - **`tracing_init`**: structured logging bootstrap.
//!
//! ## Example
//!
//! ```no_run
//! use potentiostat_daq::data::SinkDescriptor;
//! use potentiostat_daq::experiment::{ControllerOptions, ExperimentController, MeasurementRequest};
//! use potentiostat_daq::hardware::{DeviceLink, MockPotentiostat, SharedDeviceLink};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), potentiostat_daq::error::DaqError> {
//! let link = SharedDeviceLink::new(DeviceLink::new(Box::new(MockPotentiostat::new(1)), 1));
//! let controller = ExperimentController::new(link, ControllerOptions::default());
//! let request = MeasurementRequest::new(
//!     "CV",
//!     json!({"start": -0.25, "vertex": 0.8, "end": 0.0, "scan_rate": 0.1, "cycles": 2}),
//!     3,
//!     SinkDescriptor::csv("data"),
//! );
//! let dataset = controller.apply_measurement(request).await?;
//! println!("{} samples written to {:?}", dataset.len(), dataset.path);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod tracing_init;
