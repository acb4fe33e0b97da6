//! Lifecycle states of the controller and of the sampling loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Controller lifecycle.
///
/// # State Machine
///
/// ```text
/// Idle ──> Validating ──> Running ──> Completing ──> Idle
///              │             │
///              │ (rejected)  │ link failure / stop
///              ▼             ▼
///            Idle        Aborting ──> Failed ──> (next run) Validating
/// ```
///
/// `Completing` and `Failed` are reported until the next run begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    /// No experiment running
    Idle,
    /// Checking parameters, no hardware contact yet
    Validating,
    /// Setpoints are being driven and the cell is sampled
    Running,
    /// Finished normally; data flushed
    Completing,
    /// Shutting down after a failure or a stop request
    Aborting,
    /// Last run ended with an error
    Failed,
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExperimentState::Idle => "Idle",
            ExperimentState::Validating => "Validating",
            ExperimentState::Running => "Running",
            ExperimentState::Completing => "Completing",
            ExperimentState::Aborting => "Aborting",
            ExperimentState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Sampling loop lifecycle.
///
/// ```text
/// Idle ──> Sampling ──> Flushing ──> Done
///              │
///              └──(link failure / abort)──> Flushing ──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggerState {
    /// Created, not yet told to run
    Idle,
    /// Reading one sample per interval
    Sampling,
    /// Handing the buffer to the sink
    Flushing,
    /// Flushed after a normal stop
    Done,
    /// Flushed after a link failure or abort
    Aborted,
}

impl fmt::Display for LoggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoggerState::Idle => "Idle",
            LoggerState::Sampling => "Sampling",
            LoggerState::Flushing => "Flushing",
            LoggerState::Done => "Done",
            LoggerState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}
