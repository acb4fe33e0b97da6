//! End-to-end runs of the experiment controller against the simulated
//! instrument.

use potentiostat_daq::data::{read_dataset, ReductionPolicy, RunStatus, SinkDescriptor};
use potentiostat_daq::error::DaqError;
use potentiostat_daq::experiment::{
    ControllerOptions, ExperimentController, ExperimentState, MeasurementRequest,
};
use potentiostat_daq::hardware::{
    DeviceCommand, DeviceLink, MockHandle, MockPotentiostat, Register, SharedDeviceLink,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn options() -> ControllerOptions {
    ControllerOptions {
        sampling_interval: Duration::from_millis(5),
        stop_poll: Duration::from_millis(10),
        reduction: None,
    }
}

fn rig_with(options: ControllerOptions) -> (Arc<ExperimentController>, MockHandle) {
    let mock = MockPotentiostat::new(1);
    let handle = mock.handle();
    let link = SharedDeviceLink::new(DeviceLink::new(Box::new(mock), 1).with_max_retries(1));
    (Arc::new(ExperimentController::new(link, options)), handle)
}

fn rig() -> (Arc<ExperimentController>, MockHandle) {
    rig_with(options())
}

fn close(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chronoamperometry_writes_a_complete_csv() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, handle) = rig();
    handle.set_rest_potential(0.25);
    handle.set_resistance(1_000.0);

    let request = MeasurementRequest::new(
        "CA",
        json!({"potential": 0.5, "duration": 0.2}),
        3,
        SinkDescriptor::csv(dir.path()),
    )
    .with_sampling_interval(Duration::from_millis(10));
    let dataset = controller.apply_measurement(request).await.unwrap();

    let path = dataset.path.clone().expect("csv sink returns a path");
    assert!(path.starts_with(dir.path()));
    let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.ends_with("_CA_tia3.csv"), "{file_name}");

    let (header, samples) = read_dataset(&path).unwrap();
    assert_eq!(header.status, RunStatus::Completed);
    assert_eq!(header.tia_gain, 3);
    assert_eq!(header.sampling_interval_s, 0.01);
    assert_eq!(header.sample_count, samples.len());
    assert_eq!(samples.len(), dataset.len());
    assert!(samples.len() >= 5, "only {} samples", samples.len());

    assert!(samples[0].time_s >= 0.0);
    assert!(samples.windows(2).all(|w| w[0].time_s < w[1].time_s));

    let last = samples.last().unwrap();
    assert!(close(last.potential, 0.5, 1e-6));
    assert!(close(last.current, 2.5e-4, 1e-9));
    assert_eq!(controller.state(), ExperimentState::Completing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cyclic_voltammetry_drives_interpolated_legs() {
    let (controller, handle) = rig();
    let request = MeasurementRequest::new(
        "cv",
        json!({"start": 0.0, "vertex": 0.02, "end": 0.01, "scan_rate": 0.5, "cycles": 1}),
        1,
        SinkDescriptor::Memory,
    )
    .with_sampling_interval(Duration::from_millis(10));
    controller.apply_measurement(request).await.unwrap();

    let setpoints = handle.writes_to(Register::SetPotential);
    // 4 updates up, 4 down, 2 on the trailing leg to `end`, then `end` itself
    assert_eq!(setpoints.len(), 11);
    assert!(close(setpoints[0], 0.0, 1e-9));
    assert!(close(setpoints[4], 0.02, 1e-9));
    assert!(close(setpoints[8], 0.0, 1e-9));
    assert!(close(setpoints[9], 0.005, 1e-9));
    assert!(close(setpoints[10], 0.01, 1e-9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linear_sweep_finishes_on_its_end_potential() {
    let (controller, handle) = rig();
    let request = MeasurementRequest::new(
        "LSV",
        json!({"start": 0.0, "end": 0.5, "scan_rate": 5.0}),
        0,
        SinkDescriptor::Memory,
    )
    .with_sampling_interval(Duration::from_millis(10));
    controller.apply_measurement(request).await.unwrap();

    let setpoints = handle.writes_to(Register::SetPotential);
    assert_eq!(setpoints.len(), 11);
    assert!(close(setpoints[9], 0.45, 1e-9));
    assert!(close(*setpoints.last().unwrap(), 0.5, 1e-9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_length_cycles_are_skipped_without_writes() {
    let (controller, handle) = rig();
    let request = MeasurementRequest::new(
        "CV",
        json!({"start": 0.0, "vertex": 0.0, "end": 0.01, "scan_rate": 0.5, "cycles": 2}),
        0,
        SinkDescriptor::Memory,
    )
    .with_sampling_interval(Duration::from_millis(10));
    controller.apply_measurement(request).await.unwrap();

    // Only the trailing 0 -> 0.01 leg reaches the instrument.
    let setpoints = handle.writes_to(Register::SetPotential);
    assert_eq!(setpoints.len(), 3);
    for (written, expected) in setpoints.iter().zip([0.0, 0.005, 0.01]) {
        assert!(close(*written, expected, 1e-9));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn step_sequence_applies_currents_in_order() {
    let (controller, handle) = rig();
    let request = MeasurementRequest::new(
        "STEPSEQ",
        json!({"currents": [0.002, 0.01, 0.05], "step_duration": 0.03}),
        0,
        SinkDescriptor::Memory,
    );
    let dataset = controller.apply_measurement(request).await.unwrap();

    let currents = handle.writes_to(Register::SetCurrent);
    assert_eq!(currents.len(), 3);
    for (written, expected) in currents.iter().zip([0.002, 0.01, 0.05]) {
        assert!(close(*written, expected, 1e-9));
    }
    assert!(dataset.path.is_none());
    assert_eq!(
        handle.last_write(Register::ControlMode),
        Some(1.0),
        "galvanostatic control mode"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn communication_failure_mid_run_flushes_partial_data() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, handle) = rig();
    handle.fail_reads_after(5);

    let started = Instant::now();
    let request = MeasurementRequest::new(
        "CA",
        json!({"potential": 0.3, "duration": 5}),
        2,
        SinkDescriptor::Csv {
            folder: dir.path().to_path_buf(),
            file_name: Some("failing.csv".into()),
        },
    );
    let err = controller.apply_measurement(request).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3), "abort must not wait out the run");

    assert!(matches!(err, DaqError::RunFailed { .. }));
    assert!(matches!(err.cause(), DaqError::Communication(_)));
    let partial = err.partial_dataset().expect("partial data is flushed");
    assert_eq!(handle.reads_served(), 5);
    assert_eq!(partial.len(), 5);
    assert_eq!(partial.header.status, RunStatus::Aborted);

    let (header, samples) = read_dataset(dir.path().join("failing.csv")).unwrap();
    assert_eq!(header.status, RunStatus::Aborted);
    assert!(header.error.is_some());
    assert_eq!(samples, partial.samples);

    assert_eq!(handle.last_write(Register::CellSwitch), Some(0.0));
    assert_eq!(
        handle.commands().last(),
        Some(&(DeviceCommand::TestStop, 1))
    );
    assert_eq!(controller.state(), ExperimentState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_request_aborts_with_partial_dataset() {
    let (controller, handle) = rig();
    let running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let request =
                MeasurementRequest::new("OCP", json!({"duration": 30}), 0, SinkDescriptor::Memory);
            controller.apply_measurement(request).await
        })
    };

    let mut states = controller.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        while *states.borrow_and_update() != ExperimentState::Running {
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("run reaches Running");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped_at = Instant::now();
    controller.stop();
    let err = running.await.unwrap().unwrap_err();
    assert!(stopped_at.elapsed() < Duration::from_secs(1));

    assert!(matches!(err.cause(), DaqError::Aborted));
    let partial = err.partial_dataset().unwrap();
    assert!(!partial.is_empty());
    assert_eq!(partial.header.status, RunStatus::Aborted);
    assert_eq!(
        partial.header.error.as_deref(),
        Some("Experiment aborted by stop request")
    );
    assert!(handle
        .commands()
        .contains(&(DeviceCommand::TestStop, 1)));
    assert_eq!(controller.state(), ExperimentState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_run_while_busy_is_rejected() {
    let (controller, _handle) = rig();
    let running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let request =
                MeasurementRequest::new("OCP", json!({"duration": 30}), 0, SinkDescriptor::Memory);
            controller.apply_measurement(request).await
        })
    };

    let mut states = controller.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        while *states.borrow_and_update() != ExperimentState::Running {
            states.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let second = MeasurementRequest::new("OCP", json!({"duration": 1}), 0, SinkDescriptor::Memory);
    assert!(matches!(
        controller.apply_measurement(second).await,
        Err(DaqError::Busy)
    ));
    assert!(matches!(controller.reset_device().await, Err(DaqError::Busy)));

    controller.stop();
    assert!(running.await.unwrap().is_err());

    // The guard is released once the run is over.
    controller.zero_sensor().await.unwrap();
}

#[tokio::test]
async fn invalid_tia_gain_is_rejected_before_any_write() {
    let (controller, handle) = rig();
    let request = MeasurementRequest::new(
        "CA",
        json!({"potential": 0.1, "duration": 1}),
        7,
        SinkDescriptor::Memory,
    );
    let err = controller.apply_measurement(request).await.unwrap_err();
    assert!(matches!(err, DaqError::InvalidParameter { ref key, .. } if key == "tia_gain"));
    assert!(err.is_pre_flight());
    assert!(handle.writes().is_empty());
    assert!(handle.commands().is_empty());
    assert_eq!(controller.state(), ExperimentState::Idle);
}

#[tokio::test]
async fn invalid_parameters_never_reach_the_instrument() {
    let (controller, handle) = rig();

    let unknown = MeasurementRequest::new("CA", json!({"potential": 0.1, "duration": 1, "speed": 2}), 0, SinkDescriptor::Memory);
    assert!(matches!(
        controller.apply_measurement(unknown).await,
        Err(DaqError::InvalidParameter { key, .. }) if key == "speed"
    ));

    let out_of_range = MeasurementRequest::new("CA", json!({"potential": 6.0, "duration": 1}), 0, SinkDescriptor::Memory);
    assert!(matches!(
        controller.apply_measurement(out_of_range).await,
        Err(DaqError::InvalidWaveform(_))
    ));

    let bad_mode = MeasurementRequest::new("EIS", json!({}), 0, SinkDescriptor::Memory);
    assert!(matches!(
        controller.apply_measurement(bad_mode).await,
        Err(DaqError::InvalidParameter { key, .. }) if key == "mode"
    ));

    assert!(handle.writes().is_empty());
    assert!(handle.commands().is_empty());
}

#[tokio::test]
async fn rejected_tia_gain_fails_fast() {
    let (controller, handle) = rig();
    handle.reject_writes_to(Register::TiaGainSelect);
    let request = MeasurementRequest::new("OCP", json!({"duration": 1}), 4, SinkDescriptor::Memory);
    let err = controller.apply_measurement(request).await.unwrap_err();
    assert!(matches!(err, DaqError::Communication(_)));
    assert!(err.partial_dataset().is_none());
    assert!(handle.writes_to(Register::ControlMode).is_empty());
    assert_eq!(controller.state(), ExperimentState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reduction_policy_is_recorded_and_applied() {
    let (controller, _handle) = rig_with(ControllerOptions {
        reduction: Some(ReductionPolicy::MovingAverage { window: 4 }),
        ..options()
    });
    let request = MeasurementRequest::new("CP", json!({"current": 0.0001, "duration": 0.1}), 0, SinkDescriptor::Memory);
    let dataset = controller.apply_measurement(request).await.unwrap();

    assert_eq!(
        dataset.header.reduction,
        Some(ReductionPolicy::MovingAverage { window: 4 })
    );
    assert!(!dataset.is_empty());
    assert!(dataset.samples.windows(2).all(|w| w[0].time_s < w[1].time_s));
}
