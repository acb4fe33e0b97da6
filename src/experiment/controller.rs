//! Experiment orchestration.
//!
//! [`ExperimentController::apply_measurement`] is the single entry point for a
//! run:
//!
//! 1. **Validating**: parse the mode, validate the parameters, check TIA gain and
//!    sampling interval, compute the waveform. Any failure here returns before
//!    the instrument is touched.
//! 2. Hardware setup: TIA gain (fail fast), clear FIFO, control mode, cell on.
//! 3. **Running**: the sampling task is started and the setpoints are driven
//!    in order. Waits are sliced so a stop request or a dead sampling task is
//!    noticed within `stop_poll`.
//! 4. **Completing** on success, or **Aborting** then **Failed**. Both paths
//!    flush the buffered data and switch the cell off.
//!
//! Failures after sampling started come back as [`DaqError::RunFailed`] carrying
//! the flushed partial dataset.

use crate::config::{AcquisitionSettings, Settings};
use crate::data::acquisition::{AcquisitionLogger, LoggerHandle, LoggerReport, ReductionPolicy};
use crate::data::storage::{DatasetHandle, DatasetHeader, SinkDescriptor};
use crate::error::{AppResult, DaqError};
use crate::experiment::schema::{self, MeasurementParams, ModeDescription, ModeName};
use crate::experiment::state::{ExperimentState, LoggerState};
use crate::experiment::waveform::{self, Transition, Waveform};
use crate::hardware::{ControlKind, DeviceCommand, Register, SharedDeviceLink, TiaGain};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Parameter passed with instrument commands.
const COMMAND_ARG: u16 = 1;

/// Raw description of one run, as received from a caller.
#[derive(Debug, Clone)]
pub struct MeasurementRequest {
    /// Mode name, case-insensitive
    pub mode: String,
    /// JSON object of mode parameters
    pub params: Value,
    /// TIA gain index (0-4)
    pub tia_gain: u8,
    /// Overrides the configured sampling interval
    pub sampling_interval: Option<Duration>,
    /// Where the dataset goes
    pub sink: SinkDescriptor,
}

impl MeasurementRequest {
    /// Request using the configured sampling interval.
    pub fn new(mode: impl Into<String>, params: Value, tia_gain: u8, sink: SinkDescriptor) -> Self {
        Self {
            mode: mode.into(),
            params,
            tia_gain,
            sampling_interval: None,
            sink,
        }
    }

    /// Sample every `interval` instead of the configured default.
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = Some(interval);
        self
    }
}

/// Validated, immutable description of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSpec {
    /// Normalized mode parameters
    pub params: MeasurementParams,
    /// Current measurement range
    pub tia_gain: TiaGain,
    /// Sampling period, also the ramp update interval
    pub sampling_interval: Duration,
    /// Reduction applied before storage
    pub reduction: Option<ReductionPolicy>,
    /// Where the dataset goes
    pub sink: SinkDescriptor,
}

impl ExperimentSpec {
    /// Mode of the run.
    pub fn mode(&self) -> ModeName {
        self.params.mode()
    }
}

/// Timing knobs of the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    /// Used when a request does not set its own interval
    pub sampling_interval: Duration,
    /// Longest uninterrupted wait while driving
    pub stop_poll: Duration,
    /// Reduction applied to every run
    pub reduction: Option<ReductionPolicy>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from(&AcquisitionSettings::default())
    }
}

impl From<&AcquisitionSettings> for ControllerOptions {
    fn from(settings: &AcquisitionSettings) -> Self {
        Self {
            sampling_interval: settings.sampling_interval(),
            stop_poll: settings.stop_poll(),
            reduction: settings.reduction,
        }
    }
}

/// Why the driving loop stopped early.
enum DriveError {
    Device(DaqError),
    Stopped,
    SamplingEnded,
}

/// Clears the busy flag when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> AppResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DaqError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs experiments against one instrument, one at a time.
pub struct ExperimentController {
    link: SharedDeviceLink,
    options: ControllerOptions,
    busy: AtomicBool,
    state: watch::Sender<ExperimentState>,
    stop_flag: Mutex<Option<watch::Sender<bool>>>,
}

impl ExperimentController {
    /// Idle controller driving `link`.
    pub fn new(link: SharedDeviceLink, options: ControllerOptions) -> Self {
        let (state, _) = watch::channel(ExperimentState::Idle);
        Self {
            link,
            options,
            busy: AtomicBool::new(false),
            state,
            stop_flag: Mutex::new(None),
        }
    }

    /// Controller with options taken from `[acquisition]`.
    pub fn from_settings(link: SharedDeviceLink, settings: &Settings) -> Self {
        Self::new(link, ControllerOptions::from(&settings.acquisition))
    }

    /// Link shared with direct register users.
    pub fn link(&self) -> &SharedDeviceLink {
        &self.link
    }

    /// Current state.
    pub fn state(&self) -> ExperimentState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ExperimentState> {
        self.state.subscribe()
    }

    /// See [`schema::list_modes`].
    pub fn list_modes(&self) -> Vec<ModeName> {
        schema::list_modes()
    }

    /// Parameter contract of `mode`, parsed case-insensitively.
    pub fn describe_mode(&self, mode: &str) -> AppResult<ModeDescription> {
        Ok(schema::describe_mode(mode.parse()?))
    }

    /// Request a cooperative stop of the run in flight. No-op when idle.
    pub fn stop(&self) {
        let guard = self.stop_flag.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(flag) => {
                info!("Stop requested");
                flag.send_replace(true);
            }
            None => debug!("Stop requested while idle, ignoring"),
        }
    }

    /// Issue the RESET command.
    pub async fn reset_device(&self) -> AppResult<()> {
        self.idle_command(DeviceCommand::Reset).await
    }

    /// Issue the SENSOR_ZERO command.
    pub async fn zero_sensor(&self) -> AppResult<()> {
        self.idle_command(DeviceCommand::SensorZero).await
    }

    async fn idle_command(&self, command: DeviceCommand) -> AppResult<()> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        info!(command = ?command, "Sending instrument command");
        self.link.send_command(command, COMMAND_ARG).await
    }

    fn set_state(&self, next: ExperimentState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Experiment state changed");
        }
    }

    /// Validate a request without touching the instrument.
    pub fn prepare(&self, request: &MeasurementRequest) -> AppResult<(ExperimentSpec, Waveform)> {
        let params = schema::validate_named(&request.mode, &request.params)?;
        let tia_gain = TiaGain::try_from(request.tia_gain).map_err(|index| {
            DaqError::invalid_parameter(
                "tia_gain",
                format!("{index} is not a valid gain index (0-4)"),
            )
        })?;
        let sampling_interval = request
            .sampling_interval
            .unwrap_or(self.options.sampling_interval);
        if sampling_interval.is_zero() {
            return Err(DaqError::invalid_parameter(
                "sampling_interval",
                "must be > 0",
            ));
        }

        let waveform = waveform::build_segments(&params, sampling_interval)?;
        let spec = ExperimentSpec {
            params,
            tia_gain,
            sampling_interval,
            reduction: self.options.reduction,
            sink: request.sink.clone(),
        };
        Ok((spec, waveform))
    }

    /// Run one experiment end to end.
    ///
    /// Returns the flushed dataset. A concurrent call fails with
    /// [`DaqError::Busy`]; parameter problems fail with
    /// [`DaqError::InvalidParameter`] or [`DaqError::InvalidWaveform`] before any
    /// register write; failures once sampling has started come back as
    /// [`DaqError::RunFailed`].
    #[instrument(skip_all, fields(mode = %request.mode, tia_gain = request.tia_gain))]
    pub async fn apply_measurement(&self, request: MeasurementRequest) -> AppResult<DatasetHandle> {
        let _busy = BusyGuard::acquire(&self.busy)?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_flag.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        let result = self.run(&request, &mut stop_rx).await;

        *self.stop_flag.lock().unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    async fn run(
        &self,
        request: &MeasurementRequest,
        stop: &mut watch::Receiver<bool>,
    ) -> AppResult<DatasetHandle> {
        self.set_state(ExperimentState::Validating);
        let (spec, waveform) = match self.prepare(request) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Measurement rejected");
                self.set_state(ExperimentState::Idle);
                return Err(e);
            }
        };

        info!(
            mode = %spec.mode(),
            segments = waveform.segments.len(),
            duration_s = waveform.total_duration(),
            planned_writes = waveform.planned_writes(),
            sampling_ms = spec.sampling_interval.as_millis() as u64,
            sink = ?spec.sink,
            "Starting measurement"
        );

        if let Err(e) = self.setup(&spec).await {
            error!(error = %e, "Instrument setup failed");
            if let Err(teardown) = self.teardown().await {
                warn!(error = %teardown, "Teardown after failed setup also failed");
            }
            self.set_state(ExperimentState::Failed);
            return Err(e);
        }

        let header = DatasetHeader::new(
            spec.params.clone(),
            spec.tia_gain,
            spec.sampling_interval.as_secs_f64(),
            spec.reduction,
        );
        let sink = spec.sink.open(&header);
        let run_start = Instant::now();
        let logger = match AcquisitionLogger::new(
            self.link.clone(),
            spec.sampling_interval,
            sink,
            header,
        ) {
            Ok(logger) => logger.spawn(run_start),
            Err(e) => {
                if let Err(teardown) = self.teardown().await {
                    warn!(error = %teardown, "Teardown failed");
                }
                self.set_state(ExperimentState::Failed);
                return Err(e);
            }
        };

        self.set_state(ExperimentState::Running);
        let mut writes = 0u64;
        let driven = self.drive(&waveform, &logger, stop, &mut writes).await;

        let outcome = match driven {
            Ok(()) => self.complete(logger, writes, run_start).await,
            Err(reason) => self.abort(logger, reason, writes, run_start).await,
        };
        if outcome.is_err() {
            self.set_state(ExperimentState::Failed);
        }
        outcome
    }

    async fn setup(&self, spec: &ExperimentSpec) -> AppResult<()> {
        let control = spec.params.control();
        self.link
            .write_register(Register::TiaGainSelect, f64::from(spec.tia_gain.index()))
            .await?;
        self.link
            .send_command(DeviceCommand::ClearFifo, COMMAND_ARG)
            .await?;
        self.link
            .write_register(Register::ControlMode, control.code())
            .await?;
        if control != ControlKind::OpenCircuit {
            self.link.write_register(Register::CellSwitch, 1.0).await?;
        }
        Ok(())
    }

    /// Switch the cell off and stop the test. Both steps are always attempted.
    async fn teardown(&self) -> AppResult<()> {
        let switched_off = self.link.write_register(Register::CellSwitch, 0.0).await;
        let stopped = self
            .link
            .send_command(DeviceCommand::TestStop, COMMAND_ARG)
            .await;
        switched_off?;
        stopped
    }

    fn check_interrupt(
        stop: &watch::Receiver<bool>,
        logger: &LoggerHandle,
    ) -> Result<(), DriveError> {
        if *stop.borrow() {
            return Err(DriveError::Stopped);
        }
        if logger.is_finished() {
            return Err(DriveError::SamplingEnded);
        }
        Ok(())
    }

    /// Sleep until `deadline` in slices of at most `stop_poll`.
    async fn wait_until(
        &self,
        deadline: Instant,
        stop: &watch::Receiver<bool>,
        logger: &LoggerHandle,
    ) -> Result<(), DriveError> {
        loop {
            Self::check_interrupt(stop, logger)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep((deadline - now).min(self.options.stop_poll)).await;
        }
    }

    async fn drive(
        &self,
        waveform: &Waveform,
        logger: &LoggerHandle,
        stop: &watch::Receiver<bool>,
        writes: &mut u64,
    ) -> Result<(), DriveError> {
        let register = waveform.setpoint_register();

        for (index, segment) in waveform.segments.iter().enumerate() {
            if segment.duration <= 0.0 {
                debug!(index, "Skipping zero-duration segment");
                continue;
            }
            let segment_start = Instant::now();

            if let Some(register) = register {
                match segment.transition {
                    Transition::Step => {
                        Self::check_interrupt(stop, logger)?;
                        self.link
                            .write_register(register, segment.target)
                            .await
                            .map_err(DriveError::Device)?;
                        *writes += 1;
                    }
                    Transition::Ramp => {
                        for (offset, value) in segment.ramp_updates(waveform.update_interval) {
                            self.wait_until(segment_start + offset, stop, logger).await?;
                            self.link
                                .write_register(register, value)
                                .await
                                .map_err(DriveError::Device)?;
                            *writes += 1;
                        }
                    }
                }
            }

            self.wait_until(segment_start + segment.duration(), stop, logger)
                .await?;
            if let Some(register) = register.filter(|_| waveform.closes_ramp(index)) {
                self.link
                    .write_register(register, segment.target)
                    .await
                    .map_err(DriveError::Device)?;
                *writes += 1;
            }
            debug!(index, target = segment.target, "Segment finished");
        }
        Ok(())
    }

    async fn complete(
        &self,
        logger: LoggerHandle,
        writes: u64,
        run_start: Instant,
    ) -> AppResult<DatasetHandle> {
        let report = logger.stop().await;
        let teardown = self.teardown().await;
        let mut report = report?;
        self.log_summary(&report, writes, run_start).await;

        if let Some(cause) = report.link_error.take() {
            // Sampling died after the last segment was driven.
            return Err(DaqError::RunFailed {
                cause: Box::new(cause),
                dataset: report.dataset.ok().map(Box::new),
            });
        }
        let dataset = match report.dataset {
            Ok(dataset) => dataset,
            Err(e) => {
                error!(error = %e, "Dataset could not be flushed");
                return Err(DaqError::RunFailed {
                    cause: Box::new(e),
                    dataset: None,
                });
            }
        };
        if let Err(e) = teardown {
            error!(error = %e, "Teardown failed after a complete run");
            return Err(DaqError::RunFailed {
                cause: Box::new(e),
                dataset: Some(Box::new(dataset)),
            });
        }

        self.set_state(ExperimentState::Completing);
        info!(
            samples = dataset.len(),
            path = ?dataset.path,
            "Measurement completed"
        );
        Ok(dataset)
    }

    async fn abort(
        &self,
        logger: LoggerHandle,
        reason: DriveError,
        writes: u64,
        run_start: Instant,
    ) -> AppResult<DatasetHandle> {
        self.set_state(ExperimentState::Aborting);
        let cause = match reason {
            DriveError::Device(e) => Some(e),
            DriveError::Stopped => Some(DaqError::Aborted),
            DriveError::SamplingEnded => None,
        };
        let description = cause
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "sampling ended unexpectedly".to_string());
        warn!(reason = %description, "Aborting measurement");

        let report = logger.abort(description.clone()).await;
        if let Err(e) = self.teardown().await {
            warn!(error = %e, "Teardown during abort failed");
        }

        let mut report = match report {
            Ok(report) => report,
            Err(e) => {
                return Err(DaqError::RunFailed {
                    cause: Box::new(cause.unwrap_or(e)),
                    dataset: None,
                })
            }
        };
        self.log_summary(&report, writes, run_start).await;

        let cause = cause
            .or_else(|| report.link_error.take())
            .unwrap_or_else(|| DaqError::Communication(description));
        let dataset = match report.dataset {
            Ok(dataset) => Some(Box::new(dataset)),
            Err(e) => {
                error!(error = %e, "Partial dataset could not be flushed");
                None
            }
        };
        Err(DaqError::RunFailed { cause: Box::new(cause), dataset })
    }

    async fn log_summary(&self, report: &LoggerReport, writes: u64, run_start: Instant) {
        let (transactions, retries) = self.link.counters().await;
        let stored = report.dataset.as_ref().map(|d| d.len()).unwrap_or(0);
        if report.state == LoggerState::Done {
            info!(
                elapsed_s = run_start.elapsed().as_secs_f64(),
                setpoint_writes = writes,
                samples_acquired = report.samples_acquired,
                samples_stored = stored,
                transactions,
                retries,
                "Run summary"
            );
        } else {
            warn!(
                elapsed_s = run_start.elapsed().as_secs_f64(),
                setpoint_writes = writes,
                samples_acquired = report.samples_acquired,
                samples_stored = stored,
                transactions,
                retries,
                "Run summary"
            );
        }
    }
}
