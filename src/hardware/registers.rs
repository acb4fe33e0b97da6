//! Register map of the potentiostat.
//!
//! Every value register holds a signed 32-bit code spread over two 16-bit Modbus
//! words (high word first). A linear scale converts codes to SI units. The set is
//! fixed; the instrument exposes nothing else to this crate apart from the command
//! register used by [`DeviceCommand`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of the two-word `[command, parameter]` command register.
pub const COMMAND_REGISTER: u16 = 0x4F00;

/// Number of 16-bit words occupied by one value register.
pub const WORDS_PER_REGISTER: u16 = 2;

/// Access mode of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Measurement or status, never written
    Read,
    /// Setpoint, never read back
    Write,
    /// Configuration that can be read back
    ReadWrite,
}

impl Access {
    /// May be the target of a 0x03 read.
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    /// May be the target of a 0x10 write.
    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Physical unit of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    /// Potential
    Volt,
    /// Current
    Ampere,
    /// Index, flag or bit field.
    Dimensionless,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Volt => write!(f, "V"),
            Unit::Ampere => write!(f, "A"),
            Unit::Dimensionless => write!(f, "-"),
        }
    }
}

/// Static description of one register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterSpec {
    /// Upper-case register name, used in logs and errors.
    pub name: &'static str,
    /// Address of the high word.
    pub address: u16,
    /// Read/write capability
    pub access: Access,
    /// Physical unit
    pub unit: Unit,
    /// SI units per device code.
    pub scale: f64,
    /// Lowest physical value accepted by the instrument.
    pub min: f64,
    /// Highest physical value accepted by the instrument.
    pub max: f64,
}

impl RegisterSpec {
    /// Whether `value` lies inside the declared physical range.
    pub fn in_range(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }

    /// Clamp `value` into the physical range.
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Convert an SI value (already in range) to the device code.
    pub fn to_code(&self, value: f64) -> i32 {
        (value / self.scale).round() as i32
    }

    /// Convert a device code to SI units.
    pub fn from_code(&self, code: i32) -> f64 {
        f64::from(code) * self.scale
    }
}

/// The registers the experiment engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Register {
    /// Measured cell potential
    ReadPotential,
    /// Measured cell current
    ReadCurrent,
    /// Instrument status bits
    StatusFlags,
    /// Potentiostatic setpoint
    SetPotential,
    /// Galvanostatic setpoint
    SetCurrent,
    /// [`TiaGain`] index
    TiaGainSelect,
    /// [`ControlKind`] code
    ControlMode,
    /// Cell connection, 1 = connected
    CellSwitch,
}

impl Register {
    /// Every register, ordered by address.
    pub const ALL: [Register; 8] = [
        Register::ReadPotential,
        Register::ReadCurrent,
        Register::StatusFlags,
        Register::SetPotential,
        Register::SetCurrent,
        Register::TiaGainSelect,
        Register::ControlMode,
        Register::CellSwitch,
    ];

    /// Static description of this register.
    pub const fn spec(self) -> RegisterSpec {
        match self {
            Register::ReadPotential => RegisterSpec {
                name: "READ_POTENTIAL",
                address: 0x0100,
                access: Access::Read,
                unit: Unit::Volt,
                scale: 1e-6,
                min: -4.0,
                max: 4.0,
            },
            Register::ReadCurrent => RegisterSpec {
                name: "READ_CURRENT",
                address: 0x0102,
                access: Access::Read,
                unit: Unit::Ampere,
                scale: 1e-10,
                min: -0.2,
                max: 0.2,
            },
            Register::StatusFlags => RegisterSpec {
                name: "STATUS_FLAGS",
                address: 0x0104,
                access: Access::Read,
                unit: Unit::Dimensionless,
                scale: 1.0,
                min: 0.0,
                max: 65535.0,
            },
            Register::SetPotential => RegisterSpec {
                name: "SET_POTENTIAL",
                address: 0x0200,
                access: Access::Write,
                unit: Unit::Volt,
                scale: 1e-6,
                min: -4.0,
                max: 4.0,
            },
            Register::SetCurrent => RegisterSpec {
                name: "SET_CURRENT",
                address: 0x0202,
                access: Access::Write,
                unit: Unit::Ampere,
                scale: 1e-10,
                min: -0.1,
                max: 0.1,
            },
            Register::TiaGainSelect => RegisterSpec {
                name: "TIA_GAIN_SELECT",
                address: 0x0204,
                access: Access::ReadWrite,
                unit: Unit::Dimensionless,
                scale: 1.0,
                min: 0.0,
                max: 4.0,
            },
            Register::ControlMode => RegisterSpec {
                name: "CONTROL_MODE",
                address: 0x0206,
                access: Access::ReadWrite,
                unit: Unit::Dimensionless,
                scale: 1.0,
                min: 0.0,
                max: 2.0,
            },
            Register::CellSwitch => RegisterSpec {
                name: "CELL_SWITCH",
                address: 0x0208,
                access: Access::ReadWrite,
                unit: Unit::Dimensionless,
                scale: 1.0,
                min: 0.0,
                max: 1.0,
            },
        }
    }

    /// Register whose high word lives at `address`.
    pub fn from_address(address: u16) -> Option<Register> {
        Register::ALL
            .into_iter()
            .find(|reg| reg.spec().address == address)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().name)
    }
}

/// Split a 32-bit code into two Modbus words, high word first.
pub fn code_to_words(code: i32) -> [u16; 2] {
    let raw = code as u32;
    [(raw >> 16) as u16, (raw & 0xFFFF) as u16]
}

/// Join two Modbus words (high word first) into a 32-bit code.
pub fn words_to_code(words: [u16; 2]) -> i32 {
    ((u32::from(words[0]) << 16) | u32::from(words[1])) as i32
}

/// Transimpedance amplifier gain, selecting the current measurement range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TiaGain {
    /// 1 kΩ
    R1k = 0,
    /// 10 kΩ
    R10k = 1,
    /// 100 kΩ
    R100k = 2,
    /// 1 MΩ
    R1M = 3,
    /// 10 MΩ
    R10M = 4,
}

impl TiaGain {
    /// Every gain, lowest feedback resistance first.
    pub const ALL: [TiaGain; 5] = [
        TiaGain::R1k,
        TiaGain::R10k,
        TiaGain::R100k,
        TiaGain::R1M,
        TiaGain::R10M,
    ];

    /// Value written to TIA_GAIN_SELECT.
    pub fn index(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TiaGain {
    type Error = u8;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        TiaGain::ALL
            .into_iter()
            .find(|gain| gain.index() == index)
            .ok_or(index)
    }
}

/// Value written to CONTROL_MODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// Potential is driven, current is measured.
    Potentiostatic = 0,
    /// Current is driven, potential is measured.
    Galvanostatic = 1,
    /// Nothing is driven; the cell is left at high impedance.
    OpenCircuit = 2,
}

impl ControlKind {
    /// Value written to CONTROL_MODE.
    pub fn code(self) -> f64 {
        f64::from(self as u8)
    }

    /// Register that carries this control kind's setpoint.
    pub fn setpoint_register(self) -> Option<Register> {
        match self {
            ControlKind::Potentiostatic => Some(Register::SetPotential),
            ControlKind::Galvanostatic => Some(Register::SetCurrent),
            ControlKind::OpenCircuit => None,
        }
    }
}

/// Instrument commands written to [`COMMAND_REGISTER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Re-zero the current sensor
    SensorZero,
    /// Soft reset
    Reset,
    /// Restore factory settings
    LoadDefaults,
    /// End the running test and release the cell
    TestStop,
    /// Drop buffered samples
    ClearFifo,
    /// Persist the current configuration
    ConfigSave,
}

impl DeviceCommand {
    /// Command word.
    pub fn code(self) -> u16 {
        match self {
            DeviceCommand::SensorZero => 0xE0,
            DeviceCommand::Reset => 0xE1,
            DeviceCommand::LoadDefaults => 0xE2,
            DeviceCommand::TestStop => 0xE7,
            DeviceCommand::ClearFifo => 0xE8,
            DeviceCommand::ConfigSave => 0xF0,
        }
    }

    /// Inverse of [`DeviceCommand::code`].
    pub fn from_code(code: u16) -> Option<DeviceCommand> {
        [
            DeviceCommand::SensorZero,
            DeviceCommand::Reset,
            DeviceCommand::LoadDefaults,
            DeviceCommand::TestStop,
            DeviceCommand::ClearFifo,
            DeviceCommand::ConfigSave,
        ]
        .into_iter()
        .find(|cmd| cmd.code() == code)
    }
}
