//! Sampling and persistence of measured data.
pub mod acquisition;
pub mod storage;

pub use acquisition::{AcquisitionBuffer, ReductionPolicy, Sample};
pub use storage::{read_dataset, DatasetHandle, DatasetHeader, RunStatus, SinkDescriptor};
