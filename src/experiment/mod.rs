//! Experiment execution: parameter schema, waveform generation, lifecycle
//! states and the controller that ties them to the instrument.

pub mod controller;
pub mod schema;
pub mod state;
pub mod waveform;

pub use controller::{ControllerOptions, ExperimentController, ExperimentSpec, MeasurementRequest};
pub use schema::{describe_mode, list_modes, MeasurementParams, ModeDescription, ModeName};
pub use state::{ExperimentState, LoggerState};
pub use waveform::{build_segments, Segment, Transition, Waveform};
