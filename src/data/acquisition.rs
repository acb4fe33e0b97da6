//! Background sampling of the cell.
//!
//! [`AcquisitionLogger`] runs as a tokio task next to the setpoint driver. Once
//! per sampling interval it reads potential and current in one locked link
//! operation, timestamps the pair relative to the run start and appends it to
//! its [`AcquisitionBuffer`], optionally through a [`Reducer`]. It owns the
//! buffer until the run ends; then it flushes the buffer to its sink exactly
//! once, whatever the reason for stopping.
//!
//! The controller talks to the task only through a `watch` channel of
//! [`LoggerCommand`]s. Cancellation is observed at the top of every sampling
//! iteration.

use crate::data::storage::{DatasetHandle, DatasetHeader, DatasetSink, RunStatus};
use crate::error::{AppResult, DaqError};
use crate::experiment::state::LoggerState;
use crate::hardware::{Register, SharedDeviceLink};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Smallest step used to keep timestamps strictly increasing.
const TIME_NUDGE_S: f64 = 1e-9;

/// One acquired data point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since run start
    pub time_s: f64,
    /// V
    pub potential: f64,
    /// A
    pub current: f64,
}

/// Ordered samples with strictly increasing timestamps.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AcquisitionBuffer {
    samples: Vec<Sample>,
}

impl AcquisitionBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample.
    ///
    /// A timestamp that does not exceed the previous one is moved just past it;
    /// negative timestamps are raised to zero.
    pub fn push(&mut self, mut sample: Sample) {
        sample.time_s = sample.time_s.max(0.0);
        if let Some(last) = self.samples.last() {
            if sample.time_s <= last.time_s {
                sample.time_s = last.time_s + TIME_NUDGE_S;
            }
        }
        self.samples.push(sample);
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing was buffered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Buffered samples in order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Take the samples out of the buffer.
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

/// Incremental data reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReductionPolicy {
    /// Keep the first sample of every `window`.
    Decimate {
        /// Raw samples per stored sample
        window: usize,
    },
    /// Mean of each consecutive, non-overlapping `window`.
    MovingAverage {
        /// Raw samples per stored sample
        window: usize,
    },
}

impl ReductionPolicy {
    /// Window size in raw samples.
    pub fn window(&self) -> usize {
        match self {
            ReductionPolicy::Decimate { window } | ReductionPolicy::MovingAverage { window } => {
                *window
            }
        }
    }

    /// Reject a zero window.
    pub fn validate(&self) -> Result<(), String> {
        if self.window() == 0 {
            return Err("window must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Applies a [`ReductionPolicy`] sample by sample.
#[derive(Debug, Clone)]
pub struct Reducer {
    policy: Option<ReductionPolicy>,
    seen: usize,
    sum: [f64; 3],
}

impl Reducer {
    /// Reducer applying `policy`; `None` keeps every sample.
    pub fn new(policy: Option<ReductionPolicy>) -> Self {
        Self {
            policy,
            seen: 0,
            sum: [0.0; 3],
        }
    }

    /// Feed one raw sample; returns a sample to store, if any.
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        match self.policy {
            None => Some(sample),
            Some(ReductionPolicy::Decimate { window }) => {
                let keep = self.seen % window.max(1) == 0;
                self.seen += 1;
                keep.then_some(sample)
            }
            Some(ReductionPolicy::MovingAverage { window }) => {
                self.sum[0] += sample.time_s;
                self.sum[1] += sample.potential;
                self.sum[2] += sample.current;
                self.seen += 1;
                if self.seen >= window.max(1) {
                    self.take_mean()
                } else {
                    None
                }
            }
        }
    }

    /// Emit the trailing partial window, if the policy keeps one.
    pub fn flush(&mut self) -> Option<Sample> {
        match self.policy {
            Some(ReductionPolicy::MovingAverage { .. }) if self.seen > 0 => self.take_mean(),
            _ => None,
        }
    }

    fn take_mean(&mut self) -> Option<Sample> {
        let n = self.seen as f64;
        let mean = Sample {
            time_s: self.sum[0] / n,
            potential: self.sum[1] / n,
            current: self.sum[2] / n,
        };
        self.seen = 0;
        self.sum = [0.0; 3];
        Some(mean)
    }
}

/// Instruction from the controller to the sampling task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerCommand {
    /// Start sampling.
    Run,
    /// Normal end of the run: flush as completed.
    Stop,
    /// Abnormal end: flush as aborted with this reason.
    Abort(String),
}

/// What the sampling task hands back when it ends.
#[derive(Debug)]
pub struct LoggerReport {
    /// `Done` or `Aborted`
    pub state: LoggerState,
    /// Raw samples read from the instrument, before reduction
    pub samples_acquired: u64,
    /// Link failure that ended sampling, if any
    pub link_error: Option<DaqError>,
    /// Result of the flush
    pub dataset: AppResult<DatasetHandle>,
}

/// Sampling task, not yet started.
pub struct AcquisitionLogger {
    link: SharedDeviceLink,
    interval: Duration,
    reducer: Reducer,
    sink: Box<dyn DatasetSink>,
    header: DatasetHeader,
}

impl AcquisitionLogger {
    /// Logger sampling every `interval`. A zero interval is rejected.
    pub fn new(
        link: SharedDeviceLink,
        interval: Duration,
        sink: Box<dyn DatasetSink>,
        header: DatasetHeader,
    ) -> AppResult<Self> {
        if interval.is_zero() {
            return Err(DaqError::invalid_parameter(
                "sampling_interval",
                "must be > 0",
            ));
        }
        Ok(Self {
            link,
            interval,
            reducer: Reducer::new(header.reduction),
            sink,
            header,
        })
    }

    /// Start sampling; timestamps are relative to `run_start`.
    pub fn spawn(self, run_start: Instant) -> LoggerHandle {
        let (command_tx, command_rx) = watch::channel(LoggerCommand::Run);
        let (state_tx, state_rx) = watch::channel(LoggerState::Idle);
        let task = tokio::spawn(self.run(run_start, command_rx, state_tx));
        LoggerHandle {
            commands: command_tx,
            state: state_rx,
            task,
        }
    }

    async fn run(
        mut self,
        run_start: Instant,
        mut commands: watch::Receiver<LoggerCommand>,
        state: watch::Sender<LoggerState>,
    ) -> LoggerReport {
        state.send_replace(LoggerState::Sampling);
        debug!(interval_ms = self.interval.as_millis() as u64, "Sampling started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buffer = AcquisitionBuffer::new();
        let mut acquired = 0u64;
        let mut link_error = None;

        let abort_reason = loop {
            tokio::select! {
                biased;
                changed = commands.changed() => {
                    if changed.is_err() {
                        break Some("controller went away".to_string());
                    }
                }
                _ = ticker.tick() => {}
            }

            let command = commands.borrow_and_update().clone();
            match command {
                LoggerCommand::Run => {}
                LoggerCommand::Stop => break None,
                LoggerCommand::Abort(reason) => break Some(reason),
            }

            let t = run_start.elapsed().as_secs_f64();
            match self
                .link
                .read_registers(vec![Register::ReadPotential, Register::ReadCurrent])
                .await
            {
                Ok(values) => {
                    acquired += 1;
                    let raw = Sample {
                        time_s: t,
                        potential: values[0],
                        current: values[1],
                    };
                    if let Some(kept) = self.reducer.push(raw) {
                        buffer.push(kept);
                    }
                }
                Err(e) => {
                    error!(error = %e, samples = buffer.len(), "Sampling failed, aborting run");
                    let reason = e.to_string();
                    link_error = Some(e);
                    break Some(reason);
                }
            }
        };

        state.send_replace(LoggerState::Flushing);
        if let Some(tail) = self.reducer.flush() {
            buffer.push(tail);
        }

        let final_state = match &abort_reason {
            None => LoggerState::Done,
            Some(_) => LoggerState::Aborted,
        };
        let mut header = self.header;
        header.status = match final_state {
            LoggerState::Done => RunStatus::Completed,
            _ => RunStatus::Aborted,
        };
        header.error = abort_reason;

        let stored = buffer.len();
        let mut sink = self.sink;
        let samples = buffer.into_samples();
        let dataset = tokio::task::spawn_blocking(move || sink.persist(header, samples))
            .await
            .unwrap_or_else(|e| Err(DaqError::Storage(format!("flush task failed: {e}"))));

        match &dataset {
            Ok(handle) => {
                let location = handle
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "memory".to_string());
                info!(acquired, stored, sink = %location, state = %final_state, "Acquisition flushed");
            }
            Err(e) => warn!(error = %e, acquired, stored, "Acquisition flush failed"),
        }

        state.send_replace(final_state);
        LoggerReport {
            state: final_state,
            samples_acquired: acquired,
            link_error,
            dataset,
        }
    }
}

/// Controller's side of a running [`AcquisitionLogger`].
pub struct LoggerHandle {
    commands: watch::Sender<LoggerCommand>,
    state: watch::Receiver<LoggerState>,
    task: JoinHandle<LoggerReport>,
}

impl LoggerHandle {
    /// Latest published logger state.
    pub fn state(&self) -> LoggerState {
        *self.state.borrow()
    }

    /// True once the task has ended on its own (link failure).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// End the run normally and wait for the flush.
    pub async fn stop(self) -> AppResult<LoggerReport> {
        self.finish(LoggerCommand::Stop).await
    }

    /// End the run as aborted and wait for the flush.
    pub async fn abort(self, reason: impl Into<String>) -> AppResult<LoggerReport> {
        self.finish(LoggerCommand::Abort(reason.into())).await
    }

    async fn finish(self, command: LoggerCommand) -> AppResult<LoggerReport> {
        self.commands.send_replace(command);
        self.task
            .await
            .map_err(|e| DaqError::Storage(format!("acquisition task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::MemorySink;
    use crate::experiment::schema::{MeasurementParams, OcpParams};
    use crate::hardware::{DeviceLink, MockHandle, MockPotentiostat, TiaGain};

    fn sample(t: f64, v: f64) -> Sample {
        Sample {
            time_s: t,
            potential: v,
            current: v * 1e-3,
        }
    }

    fn logger(interval: Duration) -> (AcquisitionLogger, MockHandle) {
        let mock = MockPotentiostat::new(1);
        let handle = mock.handle();
        let link = SharedDeviceLink::new(DeviceLink::new(Box::new(mock), 1).with_max_retries(1));
        let header = DatasetHeader::new(
            MeasurementParams::Ocp(OcpParams { duration: 1.0 }),
            TiaGain::R1k,
            interval.as_secs_f64(),
            None,
        );
        let logger = AcquisitionLogger::new(link, interval, Box::new(MemorySink), header).unwrap();
        (logger, handle)
    }

    #[test]
    fn buffer_keeps_timestamps_strictly_increasing() {
        let mut buffer = AcquisitionBuffer::new();
        buffer.push(sample(-0.5, 0.0));
        buffer.push(sample(0.1, 0.1));
        buffer.push(sample(0.1, 0.2));
        buffer.push(sample(0.05, 0.3));
        let times: Vec<f64> = buffer.samples().iter().map(|s| s.time_s).collect();
        assert_eq!(times[0], 0.0);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn decimate_keeps_first_of_each_window() {
        let mut reducer = Reducer::new(Some(ReductionPolicy::Decimate { window: 3 }));
        let kept: Vec<f64> = (0..7)
            .filter_map(|i| reducer.push(sample(f64::from(i), f64::from(i))))
            .map(|s| s.potential)
            .collect();
        assert_eq!(kept, vec![0.0, 3.0, 6.0]);
        assert_eq!(reducer.flush(), None);
    }

    #[test]
    fn moving_average_emits_window_means_and_partial_tail() {
        let mut reducer = Reducer::new(Some(ReductionPolicy::MovingAverage { window: 2 }));
        let mut out: Vec<Sample> = (0..5)
            .filter_map(|i| reducer.push(sample(f64::from(i), f64::from(i) * 2.0)))
            .collect();
        out.extend(reducer.flush());
        let potentials: Vec<f64> = out.iter().map(|s| s.potential).collect();
        assert_eq!(potentials, vec![1.0, 5.0, 8.0]);
        assert_eq!(out[0].time_s, 0.5);
    }

    #[test]
    fn no_policy_passes_through() {
        let mut reducer = Reducer::new(None);
        assert_eq!(reducer.push(sample(1.0, 2.0)), Some(sample(1.0, 2.0)));
        assert_eq!(reducer.flush(), None);
    }

    #[test]
    fn policy_serializes_as_kind_and_window() {
        let policy: ReductionPolicy =
            serde_json::from_str(r#"{"kind": "decimate", "window": 4}"#).unwrap();
        assert_eq!(policy, ReductionPolicy::Decimate { window: 4 });
        assert!(ReductionPolicy::MovingAverage { window: 0 }.validate().is_err());
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let mock = MockPotentiostat::new(1);
        let link = SharedDeviceLink::new(DeviceLink::new(Box::new(mock), 1));
        let header = DatasetHeader::new(
            MeasurementParams::Ocp(OcpParams { duration: 1.0 }),
            TiaGain::R1k,
            0.0,
            None,
        );
        assert!(AcquisitionLogger::new(link, Duration::ZERO, Box::new(MemorySink), header).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn samples_until_stopped_then_flushes_completed() {
        let (logger, handle) = logger(Duration::from_millis(5));
        handle.set_rest_potential(0.123);
        let running = logger.spawn(Instant::now());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(running.state(), LoggerState::Sampling);

        let report = running.stop().await.unwrap();
        assert_eq!(report.state, LoggerState::Done);
        assert!(report.link_error.is_none());
        let dataset = report.dataset.unwrap();
        assert_eq!(dataset.header.status, RunStatus::Completed);
        assert!(dataset.len() >= 2);
        assert_eq!(dataset.len() as u64, report.samples_acquired);
        assert!(dataset.samples[0].time_s >= 0.0);
        assert!(dataset.samples.windows(2).all(|w| w[0].time_s < w[1].time_s));
        assert!(dataset
            .samples
            .iter()
            .all(|s| (s.potential - 0.123).abs() < 1e-6));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn link_failure_flushes_partial_data_as_aborted() {
        let (logger, handle) = logger(Duration::from_millis(5));
        handle.fail_reads_after(4);
        let running = logger.spawn(Instant::now());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !running.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let report = running.abort("ignored, already finished").await.unwrap();
        assert_eq!(report.state, LoggerState::Aborted);
        assert!(matches!(report.link_error, Some(DaqError::Communication(_))));
        let dataset = report.dataset.unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.header.status, RunStatus::Aborted);
        assert!(dataset.header.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_command_flushes_with_reason() {
        let (logger, _handle) = logger(Duration::from_millis(5));
        let running = logger.spawn(Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = running.abort("stop requested").await.unwrap();
        assert_eq!(report.state, LoggerState::Aborted);
        let dataset = report.dataset.unwrap();
        assert_eq!(dataset.header.error.as_deref(), Some("stop requested"));
        assert!(!dataset.is_empty());
    }
}
