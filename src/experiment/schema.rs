//! Measurement modes and their parameter contracts.
//!
//! Raw parameters arrive as a JSON object (from a CLI, a GUI or a script).
//! [`validate`] checks them against the mode's declared [`ParamSpec`]s and
//! produces a strongly typed [`MeasurementParams`] variant. Nothing here touches
//! the instrument.
//!
//! ```
//! use potentiostat_daq::experiment::schema::{self, MeasurementParams, ModeName};
//! use serde_json::json;
//!
//! let params = schema::validate(ModeName::Ca, &json!({"value": 0.5, "duration": 10}))?;
//! assert!(matches!(params, MeasurementParams::Ca(p) if p.potential == 0.5));
//! # Ok::<(), potentiostat_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::ControlKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Longest accepted single duration, in seconds (one day).
pub const MAX_DURATION_S: f64 = 86_400.0;
/// Longest accepted setpoint list.
pub const MAX_LIST_LEN: usize = 10_000;

/// Named measurement modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModeName {
    /// Chronoamperometry
    Ca,
    /// Linear sweep voltammetry
    Lsv,
    /// Cyclic voltammetry
    Cv,
    /// Potential steps
    Pstep,
    /// Chronopotentiometry
    Cp,
    /// Galvanostatic staircase
    Gs,
    /// Galvanostatic cyclic staircase
    Gcv,
    /// Current step sequence
    Stepseq,
    /// Open-circuit potential
    Ocp,
}

impl ModeName {
    /// Every mode, in listing order.
    pub const ALL: [ModeName; 9] = [
        ModeName::Ca,
        ModeName::Lsv,
        ModeName::Cv,
        ModeName::Pstep,
        ModeName::Cp,
        ModeName::Gs,
        ModeName::Gcv,
        ModeName::Stepseq,
        ModeName::Ocp,
    ];

    /// Upper-case wire name, e.g. `"CV"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ModeName::Ca => "CA",
            ModeName::Lsv => "LSV",
            ModeName::Cv => "CV",
            ModeName::Pstep => "PSTEP",
            ModeName::Cp => "CP",
            ModeName::Gs => "GS",
            ModeName::Gcv => "GCV",
            ModeName::Stepseq => "STEPSEQ",
            ModeName::Ocp => "OCP",
        }
    }

    /// Which quantity the instrument drives in this mode.
    pub fn control(self) -> ControlKind {
        match self {
            ModeName::Ca | ModeName::Lsv | ModeName::Cv | ModeName::Pstep => {
                ControlKind::Potentiostatic
            }
            ModeName::Cp | ModeName::Gs | ModeName::Gcv | ModeName::Stepseq => {
                ControlKind::Galvanostatic
            }
            ModeName::Ocp => ControlKind::OpenCircuit,
        }
    }

    /// One-line description used by `describe_mode`.
    pub fn summary(self) -> &'static str {
        match self {
            ModeName::Ca => "Constant potential held for a fixed duration",
            ModeName::Lsv => "Single linear potential sweep",
            ModeName::Cv => "Triangular potential sweep repeated for a number of cycles",
            ModeName::Pstep => "Sequence of potential steps with a common duration",
            ModeName::Cp => "Constant current held for a fixed duration",
            ModeName::Gs => "Equally spaced current staircase",
            ModeName::Gcv => "Cyclic current staircase",
            ModeName::Stepseq => "Sequence of current steps with a common duration",
            ModeName::Ocp => "Open-circuit potential monitoring, nothing driven",
        }
    }
}

impl fmt::Display for ModeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModeName {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ModeName::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                DaqError::invalid_parameter(
                    "mode",
                    format!(
                        "unknown mode '{s}', expected one of: {}",
                        ModeName::ALL.map(ModeName::as_str).join(", ")
                    ),
                )
            })
    }
}

// ---------------------------------------------------------------------------
// Typed parameter records
// ---------------------------------------------------------------------------

/// Chronoamperometry: one potential held for `duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaParams {
    /// V
    pub potential: f64,
    /// s
    pub duration: f64,
}

/// Linear sweep voltammetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsvParams {
    /// Initial potential (V)
    pub start: f64,
    /// Final potential (V)
    pub end: f64,
    /// V/s
    pub scan_rate: f64,
}

/// Cyclic voltammetry. Each cycle sweeps start to vertex and back; a final
/// leg then moves to `end` when it differs from `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvParams {
    /// Initial potential (V)
    pub start: f64,
    /// Reversal potential (V)
    pub vertex: f64,
    /// Final potential (V)
    pub end: f64,
    /// V/s
    pub scan_rate: f64,
    /// Number of cycles, at least one
    pub cycles: u32,
}

/// Potential steps sharing one hold time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PstepParams {
    /// Step potentials in order (V)
    pub potentials: Vec<f64>,
    /// Hold time of each step (s)
    pub duration: f64,
}

/// Chronopotentiometry: one current held for `duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpParams {
    /// A
    pub current: f64,
    /// s
    pub duration: f64,
}

/// Galvanostatic staircase from `start` to `end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GsParams {
    /// First current (A)
    pub start: f64,
    /// Last current (A)
    pub end: f64,
    /// Number of steps, both ends included
    pub num_steps: u32,
    /// Hold time of each step (s)
    pub step_duration: f64,
}

/// Cyclic galvanostatic staircase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcvParams {
    /// Initial current (A)
    pub start: f64,
    /// Reversal current (A)
    pub vertex: f64,
    /// Final current (A), `start` when omitted
    pub end: f64,
    /// Steps per leg, both ends included
    pub num_steps: u32,
    /// Hold time of each step (s)
    pub step_duration: f64,
    /// Number of cycles, at least one
    pub cycles: u32,
}

/// Current steps sharing one hold time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSeqParams {
    /// Step currents in order (A)
    pub currents: Vec<f64>,
    /// Hold time of each step (s)
    pub duration: f64,
}

/// Open-circuit monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcpParams {
    /// Monitoring time (s)
    pub duration: f64,
}

/// Validated, normalized parameters, one variant per mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "UPPERCASE")]
pub enum MeasurementParams {
    /// Chronoamperometry
    Ca(CaParams),
    /// Linear sweep voltammetry
    Lsv(LsvParams),
    /// Cyclic voltammetry
    Cv(CvParams),
    /// Potential steps
    Pstep(PstepParams),
    /// Chronopotentiometry
    Cp(CpParams),
    /// Galvanostatic staircase
    Gs(GsParams),
    /// Galvanostatic cyclic staircase
    Gcv(GcvParams),
    /// Current step sequence
    Stepseq(StepSeqParams),
    /// Open-circuit potential
    Ocp(OcpParams),
}

impl MeasurementParams {
    /// Mode these parameters belong to.
    pub fn mode(&self) -> ModeName {
        match self {
            MeasurementParams::Ca(_) => ModeName::Ca,
            MeasurementParams::Lsv(_) => ModeName::Lsv,
            MeasurementParams::Cv(_) => ModeName::Cv,
            MeasurementParams::Pstep(_) => ModeName::Pstep,
            MeasurementParams::Cp(_) => ModeName::Cp,
            MeasurementParams::Gs(_) => ModeName::Gs,
            MeasurementParams::Gcv(_) => ModeName::Gcv,
            MeasurementParams::Stepseq(_) => ModeName::Stepseq,
            MeasurementParams::Ocp(_) => ModeName::Ocp,
        }
    }

    /// Controlled quantity of the mode.
    pub fn control(&self) -> ControlKind {
        self.mode().control()
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Finite float
    Number,
    /// Whole number
    Integer,
    /// Non-empty list of floats
    NumberList,
}

/// Numeric bounds of a parameter (of every element, for lists).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    /// Lower bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// `min` itself is excluded
    pub min_exclusive: bool,
    /// Upper bound, inclusive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Bounds {
    /// Any finite value.
    pub const FINITE: Bounds = Bounds {
        min: None,
        min_exclusive: false,
        max: None,
    };

    const fn positive_up_to(max: f64) -> Bounds {
        Bounds {
            min: Some(0.0),
            min_exclusive: true,
            max: Some(max),
        }
    }

    const fn inclusive(min: f64, max: f64) -> Bounds {
        Bounds {
            min: Some(min),
            min_exclusive: false,
            max: Some(max),
        }
    }

    fn check(&self, value: f64) -> Result<(), String> {
        if !value.is_finite() {
            return Err(format!("{value} is not a finite number"));
        }
        if let Some(min) = self.min {
            if self.min_exclusive && value <= min {
                return Err(format!("{value} must be > {min}"));
            }
            if !self.min_exclusive && value < min {
                return Err(format!("{value} must be >= {min}"));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(format!("{value} must be <= {max}"));
            }
        }
        Ok(())
    }
}

const DURATION: Bounds = Bounds::positive_up_to(MAX_DURATION_S);
const SCAN_RATE: Bounds = Bounds::positive_up_to(10.0);
const CYCLES: Bounds = Bounds::inclusive(1.0, 1000.0);
const NUM_STEPS: Bounds = Bounds::inclusive(2.0, 10_000.0);

/// Declaration of one mode parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamSpec {
    /// Canonical key
    pub name: &'static str,
    /// Alternative keys accepted on input
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub aliases: &'static [&'static str],
    /// Value type
    pub kind: ParamKind,
    /// SI unit, empty for counts
    pub unit: &'static str,
    /// Must be present in the request
    pub required: bool,
    /// Human-readable default of an optional parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<&'static str>,
    /// Accepted range
    pub bounds: Bounds,
    /// Short human-readable description
    pub description: &'static str,
}

impl ParamSpec {
    const fn new(
        name: &'static str,
        kind: ParamKind,
        unit: &'static str,
        bounds: Bounds,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            aliases: &[],
            kind,
            unit,
            required: true,
            default: None,
            bounds,
            description,
        }
    }

    const fn aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    const fn optional(mut self, default: &'static str) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    fn accepts(&self, key: &str) -> bool {
        self.name == key || self.aliases.contains(&key)
    }
}

use ParamKind::{Integer, Number, NumberList};

const CA_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("potential", Number, "V", Bounds::FINITE, "Applied potential")
        .aliases(&["value"]),
    ParamSpec::new("duration", Number, "s", DURATION, "Hold time"),
];

const LSV_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("start", Number, "V", Bounds::FINITE, "Initial potential"),
    ParamSpec::new("end", Number, "V", Bounds::FINITE, "Final potential"),
    ParamSpec::new("scan_rate", Number, "V/s", SCAN_RATE, "Sweep rate"),
];

const CV_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("start", Number, "V", Bounds::FINITE, "Initial potential"),
    ParamSpec::new("vertex", Number, "V", Bounds::FINITE, "Reversal potential"),
    ParamSpec::new("end", Number, "V", Bounds::FINITE, "Final potential"),
    ParamSpec::new("scan_rate", Number, "V/s", SCAN_RATE, "Sweep rate"),
    ParamSpec::new("cycles", Integer, "", CYCLES, "Number of start-vertex-start cycles"),
];

const PSTEP_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("potentials", NumberList, "V", Bounds::FINITE, "Step potentials, in order"),
    ParamSpec::new("duration", Number, "s", DURATION, "Hold time of each step")
        .aliases(&["step_duration"]),
];

const CP_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("current", Number, "A", Bounds::FINITE, "Applied current"),
    ParamSpec::new("duration", Number, "s", DURATION, "Hold time"),
];

const GS_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("start", Number, "A", Bounds::FINITE, "First current"),
    ParamSpec::new("end", Number, "A", Bounds::FINITE, "Last current"),
    ParamSpec::new("num_steps", Integer, "", NUM_STEPS, "Number of steps, ends included"),
    ParamSpec::new("step_duration", Number, "s", DURATION, "Hold time of each step"),
];

const GCV_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("start", Number, "A", Bounds::FINITE, "Initial current"),
    ParamSpec::new("vertex", Number, "A", Bounds::FINITE, "Reversal current"),
    ParamSpec::new("end", Number, "A", Bounds::FINITE, "Final current").optional("start"),
    ParamSpec::new("num_steps", Integer, "", NUM_STEPS, "Steps per leg, ends included"),
    ParamSpec::new("step_duration", Number, "s", DURATION, "Hold time of each step"),
    ParamSpec::new("cycles", Integer, "", CYCLES, "Number of start-vertex-start cycles"),
];

const STEPSEQ_PARAMS: &[ParamSpec] = &[
    ParamSpec::new("currents", NumberList, "A", Bounds::FINITE, "Step currents, in order"),
    ParamSpec::new("duration", Number, "s", DURATION, "Hold time of each step")
        .aliases(&["step_duration"]),
];

const OCP_PARAMS: &[ParamSpec] = &[ParamSpec::new(
    "duration",
    Number,
    "s",
    DURATION,
    "Monitoring time",
)];

/// Parameter declarations of `mode`.
pub fn param_specs(mode: ModeName) -> &'static [ParamSpec] {
    match mode {
        ModeName::Ca => CA_PARAMS,
        ModeName::Lsv => LSV_PARAMS,
        ModeName::Cv => CV_PARAMS,
        ModeName::Pstep => PSTEP_PARAMS,
        ModeName::Cp => CP_PARAMS,
        ModeName::Gs => GS_PARAMS,
        ModeName::Gcv => GCV_PARAMS,
        ModeName::Stepseq => STEPSEQ_PARAMS,
        ModeName::Ocp => OCP_PARAMS,
    }
}

/// Introspection record returned by [`describe_mode`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeDescription {
    /// Described mode
    pub mode: ModeName,
    /// Controlled quantity
    pub control: ControlKind,
    /// One-line description
    pub summary: &'static str,
    /// Parameter declarations, in request order
    pub params: &'static [ParamSpec],
}

/// All supported modes.
pub fn list_modes() -> Vec<ModeName> {
    ModeName::ALL.to_vec()
}

/// Parameter contract of one mode.
pub fn describe_mode(mode: ModeName) -> ModeDescription {
    ModeDescription {
        mode,
        control: mode.control(),
        summary: mode.summary(),
        params: param_specs(mode),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate raw parameters for `mode`.
///
/// Fails with [`DaqError::InvalidParameter`] naming the key on a missing
/// required key, a wrong type, an out-of-bounds value or an unknown key.
pub fn validate(mode: ModeName, raw: &Value) -> AppResult<MeasurementParams> {
    let Some(object) = raw.as_object() else {
        return Err(DaqError::invalid_parameter(
            "params",
            format!("expected a JSON object, got {}", json_type(raw)),
        ));
    };
    let r = ParamReader::new(mode, object)?;

    let params = match mode {
        ModeName::Ca => MeasurementParams::Ca(CaParams {
            potential: r.number("potential")?,
            duration: r.number("duration")?,
        }),
        ModeName::Lsv => MeasurementParams::Lsv(LsvParams {
            start: r.number("start")?,
            end: r.number("end")?,
            scan_rate: r.number("scan_rate")?,
        }),
        ModeName::Cv => MeasurementParams::Cv(CvParams {
            start: r.number("start")?,
            vertex: r.number("vertex")?,
            end: r.number("end")?,
            scan_rate: r.number("scan_rate")?,
            cycles: r.integer("cycles")?,
        }),
        ModeName::Pstep => MeasurementParams::Pstep(PstepParams {
            potentials: r.list("potentials")?,
            duration: r.number("duration")?,
        }),
        ModeName::Cp => MeasurementParams::Cp(CpParams {
            current: r.number("current")?,
            duration: r.number("duration")?,
        }),
        ModeName::Gs => MeasurementParams::Gs(GsParams {
            start: r.number("start")?,
            end: r.number("end")?,
            num_steps: r.integer("num_steps")?,
            step_duration: r.number("step_duration")?,
        }),
        ModeName::Gcv => {
            let start = r.number("start")?;
            MeasurementParams::Gcv(GcvParams {
                start,
                vertex: r.number("vertex")?,
                end: r.optional_number("end")?.unwrap_or(start),
                num_steps: r.integer("num_steps")?,
                step_duration: r.number("step_duration")?,
                cycles: r.integer("cycles")?,
            })
        }
        ModeName::Stepseq => MeasurementParams::Stepseq(StepSeqParams {
            currents: r.list("currents")?,
            duration: r.number("duration")?,
        }),
        ModeName::Ocp => MeasurementParams::Ocp(OcpParams {
            duration: r.number("duration")?,
        }),
    };

    Ok(params)
}

/// Parse the mode name, then [`validate`].
pub fn validate_named(mode: &str, raw: &Value) -> AppResult<MeasurementParams> {
    validate(mode.parse()?, raw)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reads declared parameters out of a raw object.
///
/// Unknown keys and alias conflicts are rejected up front, so every key that
/// survives construction belongs to exactly one declared parameter.
struct ParamReader<'a> {
    mode: ModeName,
    specs: &'static [ParamSpec],
    raw: &'a Map<String, Value>,
}

impl<'a> ParamReader<'a> {
    fn new(mode: ModeName, raw: &'a Map<String, Value>) -> AppResult<Self> {
        let specs = param_specs(mode);
        let mut seen = HashSet::new();
        let mut keys: Vec<&String> = raw.keys().collect();
        keys.sort();
        for key in keys {
            let Some(spec) = specs.iter().find(|spec| spec.accepts(key)) else {
                return Err(DaqError::invalid_parameter(
                    key.as_str(),
                    format!(
                        "unknown parameter for {mode}, expected: {}",
                        specs.iter().map(|s| s.name).collect::<Vec<_>>().join(", ")
                    ),
                ));
            };
            if !seen.insert(spec.name) {
                return Err(DaqError::invalid_parameter(
                    spec.name,
                    "given more than once (directly and through an alias)",
                ));
            }
        }
        Ok(Self { mode, specs, raw })
    }

    fn spec(&self, name: &str) -> AppResult<&'static ParamSpec> {
        self.specs
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| {
                DaqError::invalid_parameter(name, format!("not a parameter of {}", self.mode))
            })
    }

    fn lookup(&self, spec: &ParamSpec) -> Option<&'a Value> {
        std::iter::once(spec.name)
            .chain(spec.aliases.iter().copied())
            .find_map(|key| self.raw.get(key))
    }

    fn fetch(&self, name: &str) -> AppResult<(&'static ParamSpec, Option<&'a Value>)> {
        let spec = self.spec(name)?;
        Ok((spec, self.lookup(spec)))
    }

    fn require(spec: &ParamSpec, value: Option<&'a Value>) -> AppResult<&'a Value> {
        value.ok_or_else(|| DaqError::invalid_parameter(spec.name, "missing required parameter"))
    }

    fn as_number(spec: &ParamSpec, value: &Value) -> AppResult<f64> {
        let number = value.as_f64().ok_or_else(|| {
            DaqError::invalid_parameter(
                spec.name,
                format!("expected a number, got {}", json_type(value)),
            )
        })?;
        spec.bounds
            .check(number)
            .map_err(|reason| DaqError::invalid_parameter(spec.name, reason))?;
        Ok(number)
    }

    fn number(&self, name: &str) -> AppResult<f64> {
        let (spec, value) = self.fetch(name)?;
        Self::as_number(spec, Self::require(spec, value)?)
    }

    fn optional_number(&self, name: &str) -> AppResult<Option<f64>> {
        let (spec, value) = self.fetch(name)?;
        value.map(|v| Self::as_number(spec, v)).transpose()
    }

    fn integer(&self, name: &str) -> AppResult<u32> {
        let (spec, value) = self.fetch(name)?;
        let value = Self::require(spec, value)?;
        let number = Self::as_number(spec, value)?;
        if number.fract() != 0.0 {
            return Err(DaqError::invalid_parameter(
                spec.name,
                format!("expected an integer, got {number}"),
            ));
        }
        // Bounds already keep the value well inside u32.
        Ok(number as u32)
    }

    fn list(&self, name: &str) -> AppResult<Vec<f64>> {
        let (spec, value) = self.fetch(name)?;
        let value = Self::require(spec, value)?;
        let items = value.as_array().ok_or_else(|| {
            DaqError::invalid_parameter(
                spec.name,
                format!("expected a list of numbers, got {}", json_type(value)),
            )
        })?;
        if items.is_empty() {
            return Err(DaqError::invalid_parameter(spec.name, "list must not be empty"));
        }
        if items.len() > MAX_LIST_LEN {
            return Err(DaqError::invalid_parameter(
                spec.name,
                format!("{} entries exceed the limit of {MAX_LIST_LEN}", items.len()),
            ));
        }
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                Self::as_number(spec, item).map_err(|e| match e {
                    DaqError::InvalidParameter { key, reason } => DaqError::InvalidParameter {
                        key,
                        reason: format!("entry {index}: {reason}"),
                    },
                    other => other,
                })
            })
            .collect()
    }
}
