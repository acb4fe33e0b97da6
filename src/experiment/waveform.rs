//! Waveform generation: validated parameters to an ordered list of segments.
//!
//! Everything here is pure. Setpoints are in SI units (V for potentiostatic
//! modes, A for galvanostatic ones), durations in seconds. Ramps are not sent
//! to the instrument as ramps; the controller realises them as a dense series
//! of interpolated step updates, see [`Segment::ramp_updates`].

use crate::error::{AppResult, DaqError};
use crate::experiment::schema::{MeasurementParams, ModeName, MAX_DURATION_S};
use crate::hardware::{ControlKind, Register};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Float noise tolerated when counting ramp updates.
const COUNT_EPSILON: f64 = 1e-9;

/// How the setpoint moves from a segment's start value to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Jump to the target and hold it.
    Step,
    /// Move linearly from `start` to `target` over the duration.
    Ramp,
}

/// One constant- or ramping-target interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Value at the beginning of the segment (equals `target` for steps).
    pub start: f64,
    /// Value held (step) or reached (ramp) by the end of the segment.
    pub target: f64,
    /// Seconds
    pub duration: f64,
    /// How the value moves from `start` to `target`.
    pub transition: Transition,
}

impl Segment {
    /// Hold `target` for `duration` seconds.
    pub fn step(target: f64, duration: f64) -> Self {
        Self {
            start: target,
            target,
            duration,
            transition: Transition::Step,
        }
    }

    /// Sweep linearly from `start` to `target` over `duration` seconds.
    pub fn ramp(start: f64, target: f64, duration: f64) -> Self {
        Self {
            start,
            target,
            duration,
            transition: Transition::Ramp,
        }
    }

    /// Segment length as a [`Duration`], saturating for out-of-range values.
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration).unwrap_or(Duration::MAX)
    }

    /// Interpolated value at `elapsed` seconds into the segment.
    pub fn value_at(&self, elapsed: f64) -> f64 {
        match self.transition {
            Transition::Step => self.target,
            Transition::Ramp => {
                if self.duration <= 0.0 {
                    return self.target;
                }
                let fraction = (elapsed / self.duration).clamp(0.0, 1.0);
                self.start + (self.target - self.start) * fraction
            }
        }
    }

    /// Number of interpolated updates needed to realise this segment.
    ///
    /// A step needs one write. A ramp needs `ceil(D / dt)` writes, at offsets
    /// `k * dt` for `k = 0..n`; its endpoint is not among them (see
    /// [`Waveform::closes_ramp`]).
    pub fn update_count(&self, interval: Duration) -> u64 {
        if self.duration <= 0.0 {
            return 0;
        }
        match self.transition {
            Transition::Step => 1,
            Transition::Ramp => {
                let dt = interval.as_secs_f64();
                if dt <= 0.0 {
                    return 1;
                }
                ((self.duration / dt) - COUNT_EPSILON).ceil().max(1.0) as u64
            }
        }
    }

    /// `(offset from segment start, setpoint)` pairs realising the segment.
    pub fn ramp_updates(&self, interval: Duration) -> impl Iterator<Item = (Duration, f64)> + '_ {
        let count = self.update_count(interval);
        (0..count).map(move |k| {
            let offset = interval.saturating_mul(k.min(u64::from(u32::MAX)) as u32);
            (offset, self.value_at(offset.as_secs_f64()))
        })
    }
}

/// Complete computed waveform of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waveform {
    /// Mode the waveform was built for
    pub mode: ModeName,
    /// Controlled quantity, selects the setpoint register
    pub control: ControlKind,
    /// Spacing of ramp updates
    pub update_interval: Duration,
    /// Segments in execution order
    pub segments: Vec<Segment>,
}

impl Waveform {
    /// Register receiving setpoints, `None` for open circuit.
    pub fn setpoint_register(&self) -> Option<Register> {
        self.control.setpoint_register()
    }

    /// Sum of segment durations in seconds.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Number of setpoint writes the controller will issue.
    pub fn planned_writes(&self) -> u64 {
        if self.setpoint_register().is_none() {
            return 0;
        }
        self.segments
            .iter()
            .enumerate()
            .fold(0u64, |total, (index, segment)| {
                let closing = u64::from(self.closes_ramp(index));
                total
                    .saturating_add(segment.update_count(self.update_interval))
                    .saturating_add(closing)
            })
    }

    /// Whether the ramp at `index` ends with an explicit write of its target.
    ///
    /// A ramp's endpoint is written by the next leg when that leg is a ramp
    /// starting where this one ends. Otherwise the driver writes it once the
    /// ramp's duration has elapsed.
    pub fn closes_ramp(&self, index: usize) -> bool {
        let Some(segment) = self.segments.get(index) else {
            return false;
        };
        if segment.transition != Transition::Ramp || segment.duration <= 0.0 {
            return false;
        }
        let next = self.segments[index + 1..].iter().find(|s| s.duration > 0.0);
        !matches!(next, Some(next) if next.transition == Transition::Ramp && next.start == segment.target)
    }
}

/// Compute the segment sequence for validated parameters.
///
/// `sample_interval` is the spacing of ramp updates. Fails with
/// [`DaqError::InvalidWaveform`] when a value is non-finite, a setpoint lies
/// outside the driven register's physical range, or the total duration is zero.
pub fn build_segments(params: &MeasurementParams, sample_interval: Duration) -> AppResult<Waveform> {
    if sample_interval.is_zero() {
        return Err(DaqError::InvalidWaveform(
            "ramp update interval must be > 0".to_string(),
        ));
    }

    let segments = match params {
        MeasurementParams::Ca(p) => vec![Segment::step(p.potential, p.duration)],
        MeasurementParams::Cp(p) => vec![Segment::step(p.current, p.duration)],
        MeasurementParams::Ocp(p) => vec![Segment::step(0.0, p.duration)],
        MeasurementParams::Lsv(p) => vec![sweep_leg(p.start, p.end, p.scan_rate)],
        MeasurementParams::Cv(p) => {
            let mut legs = Vec::with_capacity(2 * p.cycles as usize + 1);
            for _ in 0..p.cycles {
                legs.push(sweep_leg(p.start, p.vertex, p.scan_rate));
                legs.push(sweep_leg(p.vertex, p.start, p.scan_rate));
            }
            if p.end != p.start {
                legs.push(sweep_leg(p.start, p.end, p.scan_rate));
            }
            legs
        }
        MeasurementParams::Pstep(p) => steps(&p.potentials, p.duration),
        MeasurementParams::Stepseq(p) => steps(&p.currents, p.duration),
        MeasurementParams::Gs(p) => steps(&linspace(p.start, p.end, p.num_steps), p.step_duration),
        MeasurementParams::Gcv(p) => {
            let mut levels = Vec::new();
            for _ in 0..p.cycles {
                levels.extend(linspace(p.start, p.vertex, p.num_steps));
                levels.extend(linspace(p.vertex, p.start, p.num_steps));
            }
            if p.end != p.start {
                levels.extend(linspace(p.start, p.end, p.num_steps));
            }
            steps(&levels, p.step_duration)
        }
    };

    let waveform = Waveform {
        mode: params.mode(),
        control: params.control(),
        update_interval: sample_interval,
        segments,
    };
    check(&waveform)?;
    Ok(waveform)
}

fn sweep_leg(from: f64, to: f64, scan_rate: f64) -> Segment {
    Segment::ramp(from, to, (to - from).abs() / scan_rate)
}

fn steps(levels: &[f64], duration: f64) -> Vec<Segment> {
    levels.iter().map(|&level| Segment::step(level, duration)).collect()
}

/// `n` equally spaced values from `from` to `to`, both included.
fn linspace(from: f64, to: f64, n: u32) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![from],
        _ => {
            let last = f64::from(n - 1);
            (0..n)
                .map(|i| from + (to - from) * f64::from(i) / last)
                .collect()
        }
    }
}

fn check(waveform: &Waveform) -> AppResult<()> {
    let register = waveform.setpoint_register();

    for (index, segment) in waveform.segments.iter().enumerate() {
        if !segment.duration.is_finite() || segment.duration < 0.0 {
            return Err(DaqError::InvalidWaveform(format!(
                "segment {index} has invalid duration {} s",
                segment.duration
            )));
        }
        if segment.duration > MAX_DURATION_S {
            return Err(DaqError::InvalidWaveform(format!(
                "segment {index} lasts {} s, longer than the {MAX_DURATION_S} s limit",
                segment.duration
            )));
        }
        let Some(register) = register else {
            continue;
        };
        let spec = register.spec();
        for value in [segment.start, segment.target] {
            if !spec.in_range(value) {
                return Err(DaqError::InvalidWaveform(format!(
                    "segment {index} setpoint {value} {} is outside the {register} range [{}, {}]",
                    spec.unit, spec.min, spec.max
                )));
            }
        }
    }

    let total = waveform.total_duration();
    if !total.is_finite() || total <= 0.0 {
        return Err(DaqError::InvalidWaveform(format!(
            "{} waveform has zero total duration",
            waveform.mode
        )));
    }
    if total > MAX_DURATION_S {
        return Err(DaqError::InvalidWaveform(format!(
            "{} waveform lasts {total} s, longer than the {MAX_DURATION_S} s limit",
            waveform.mode
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::schema::{self, CaParams, CvParams, LsvParams};
    use serde_json::json;

    const DT: Duration = Duration::from_millis(10);

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn ca_is_a_single_step() {
        for (potential, duration) in [(0.5, 10.0), (-1.2, 0.25), (3.9, 3600.0)] {
            let params = MeasurementParams::Ca(CaParams { potential, duration });
            let waveform = build_segments(&params, DT).unwrap();
            assert_eq!(waveform.segments, vec![Segment::step(potential, duration)]);
            assert_eq!(waveform.setpoint_register(), Some(Register::SetPotential));
        }
    }

    #[test]
    fn cv_legs_alternate_and_end_with_a_partial_leg() {
        let params = MeasurementParams::Cv(CvParams {
            start: -0.25,
            vertex: 1.8,
            end: 0.0,
            scan_rate: 0.1,
            cycles: 3,
        });
        let waveform = build_segments(&params, DT).unwrap();
        let legs = &waveform.segments;
        assert_eq!(legs.len(), 2 * 3 + 1);

        for leg in legs {
            assert_eq!(leg.transition, Transition::Ramp);
            assert!(close(leg.duration, (leg.target - leg.start).abs() / 0.1));
        }
        for pair in legs.windows(2) {
            let first = pair[0].target - pair[0].start;
            let second = pair[1].target - pair[1].start;
            assert!(first.signum() != second.signum(), "legs must alternate");
            assert!(close(pair[0].target, pair[1].start), "legs must be continuous");
        }
        let last = legs.last().unwrap();
        assert!(close(last.start, -0.25) && close(last.target, 0.0));
        assert!(close(legs[0].duration, 20.5));
    }

    #[test]
    fn cv_returning_to_start_has_no_trailing_leg() {
        let params = MeasurementParams::Cv(CvParams {
            start: 0.0,
            vertex: 1.0,
            end: 0.0,
            scan_rate: 0.5,
            cycles: 2,
        });
        assert_eq!(build_segments(&params, DT).unwrap().segments.len(), 4);
    }

    #[test]
    fn stepseq_keeps_list_order() {
        let params = schema::validate(
            ModeName::Stepseq,
            &json!({"currents": [0.002, 0.01, 0.05], "duration": 5}),
        )
        .unwrap();
        let waveform = build_segments(&params, DT).unwrap();
        assert_eq!(
            waveform.segments,
            vec![
                Segment::step(0.002, 5.0),
                Segment::step(0.01, 5.0),
                Segment::step(0.05, 5.0),
            ]
        );
        assert_eq!(waveform.setpoint_register(), Some(Register::SetCurrent));
        assert_eq!(waveform.planned_writes(), 3);
    }

    #[test]
    fn gs_is_an_inclusive_staircase() {
        let params = schema::validate(
            ModeName::Gs,
            &json!({"start": 0.0, "end": 0.004, "num_steps": 5, "step_duration": 2}),
        )
        .unwrap();
        let targets: Vec<f64> = build_segments(&params, DT)
            .unwrap()
            .segments
            .iter()
            .map(|s| s.target)
            .collect();
        let expected = [0.0, 0.001, 0.002, 0.003, 0.004];
        assert_eq!(targets.len(), expected.len());
        assert!(targets.iter().zip(expected).all(|(a, b)| close(*a, b)));
    }

    #[test]
    fn gcv_appends_end_leg_only_when_end_differs() {
        let base = json!({"start": 0.0, "vertex": 0.002, "num_steps": 3, "step_duration": 1, "cycles": 2});
        let params = schema::validate(ModeName::Gcv, &base).unwrap();
        assert_eq!(build_segments(&params, DT).unwrap().segments.len(), 2 * 2 * 3);

        let mut with_end = base.clone();
        with_end["end"] = json!(0.001);
        let params = schema::validate(ModeName::Gcv, &with_end).unwrap();
        let segments = build_segments(&params, DT).unwrap().segments;
        assert_eq!(segments.len(), 2 * 2 * 3 + 3);
        assert!(close(segments.last().unwrap().target, 0.001));
    }

    #[test]
    fn ocp_drives_nothing() {
        let params = schema::validate(ModeName::Ocp, &json!({"duration": 30})).unwrap();
        let waveform = build_segments(&params, DT).unwrap();
        assert_eq!(waveform.segments.len(), 1);
        assert_eq!(waveform.setpoint_register(), None);
        assert_eq!(waveform.planned_writes(), 0);
        assert!(close(waveform.total_duration(), 30.0));
    }

    #[test]
    fn out_of_range_setpoint_is_rejected_at_build_time() {
        let params = MeasurementParams::Ca(CaParams {
            potential: 5.0,
            duration: 1.0,
        });
        let err = build_segments(&params, DT).unwrap_err();
        assert!(matches!(err, DaqError::InvalidWaveform(msg) if msg.contains("SET_POTENTIAL")));

        let params = schema::validate(
            ModeName::Stepseq,
            &json!({"currents": [0.01, 0.5], "duration": 1}),
        )
        .unwrap();
        assert!(matches!(
            build_segments(&params, DT),
            Err(DaqError::InvalidWaveform(_))
        ));
    }

    #[test]
    fn degenerate_sweep_is_rejected() {
        let params = MeasurementParams::Lsv(LsvParams {
            start: 0.3,
            end: 0.3,
            scan_rate: 0.1,
        });
        assert!(matches!(
            build_segments(&params, DT),
            Err(DaqError::InvalidWaveform(msg)) if msg.contains("zero total duration")
        ));
    }

    #[test]
    fn ramp_updates_are_evenly_spaced_and_interpolated() {
        let leg = Segment::ramp(0.0, 1.0, 0.05);
        let updates: Vec<_> = leg.ramp_updates(DT).collect();
        assert_eq!(updates.len(), 5);
        for (k, (offset, value)) in updates.iter().enumerate() {
            assert_eq!(*offset, DT * k as u32);
            assert!(close(*value, k as f64 * 0.2));
        }
    }

    #[test]
    fn ramp_with_fractional_interval_count_rounds_up() {
        let leg = Segment::ramp(1.0, 0.0, 0.025);
        assert_eq!(leg.update_count(DT), 3);
        let last = leg.ramp_updates(DT).last().unwrap();
        assert!(close(last.1, 0.2));
    }

    #[test]
    fn sweep_closes_on_its_end_value() {
        let params = MeasurementParams::Lsv(LsvParams {
            start: 0.0,
            end: 0.5,
            scan_rate: 0.1,
        });
        let waveform = build_segments(&params, DT).unwrap();
        let leg = waveform.segments[0];
        let last_update = leg.ramp_updates(DT).last().unwrap().1;
        assert!(close(last_update, 0.499));
        assert!(waveform.closes_ramp(0));
        assert_eq!(waveform.planned_writes(), leg.update_count(DT) + 1);
    }

    #[test]
    fn continuing_cv_legs_leave_the_endpoint_to_the_next_leg() {
        let params = MeasurementParams::Cv(CvParams {
            start: 0.0,
            vertex: 0.5,
            end: 0.0,
            scan_rate: 0.5,
            cycles: 2,
        });
        let waveform = build_segments(&params, DT).unwrap();
        let closing: Vec<bool> = (0..waveform.segments.len())
            .map(|i| waveform.closes_ramp(i))
            .collect();
        assert_eq!(closing, vec![false, false, false, true]);
        assert_eq!(waveform.planned_writes(), 4 * 100 + 1);
    }

    #[test]
    fn zero_duration_legs_are_skipped_when_closing() {
        let params = MeasurementParams::Cv(CvParams {
            start: 0.0,
            vertex: 0.0,
            end: 0.01,
            scan_rate: 0.5,
            cycles: 1,
        });
        let waveform = build_segments(&params, DT).unwrap();
        assert_eq!(waveform.segments.len(), 3);
        assert_eq!(waveform.segments[0].update_count(DT), 0);
        assert!(!waveform.closes_ramp(0));
        assert!(waveform.closes_ramp(2));
        assert_eq!(waveform.planned_writes(), 3);
    }

    #[test]
    fn vanishing_scan_rate_is_rejected_instead_of_overflowing() {
        let cv = schema::validate(
            ModeName::Cv,
            &json!({"start": -0.25, "vertex": 1.8, "end": 0, "scan_rate": 1e-20, "cycles": 1}),
        )
        .unwrap();
        assert!(matches!(
            build_segments(&cv, DT),
            Err(DaqError::InvalidWaveform(msg)) if msg.contains("limit")
        ));

        let lsv = schema::validate(
            ModeName::Lsv,
            &json!({"start": 0, "end": 0.5, "scan_rate": 1e-20}),
        )
        .unwrap();
        assert!(matches!(
            build_segments(&lsv, DT),
            Err(DaqError::InvalidWaveform(_))
        ));
    }

    #[test]
    fn total_duration_is_bounded() {
        let params = schema::validate(
            ModeName::Pstep,
            &json!({"potentials": [0.1, 0.2, 0.3], "duration": 50_000}),
        )
        .unwrap();
        assert!(matches!(
            build_segments(&params, DT),
            Err(DaqError::InvalidWaveform(msg)) if msg.contains("PSTEP waveform lasts")
        ));
    }

    #[test]
    fn oversized_duration_saturates() {
        assert_eq!(Segment::step(0.0, 1e30).duration(), Duration::MAX);
        assert_eq!(Segment::step(0.0, 1.5).duration(), Duration::from_millis(1500));
    }

    #[test]
    fn zero_duration_segment_needs_no_update() {
        assert_eq!(Segment::step(1.0, 0.0).update_count(DT), 0);
        assert_eq!(Segment::ramp(1.0, 1.0, 0.0).update_count(DT), 0);
    }
}
