//! Simulated potentiostat for headless runs and tests.
//!
//! `MockPotentiostat` implements [`Transport`] and answers real Modbus RTU frames,
//! so everything above the transport (codec, retries, register scaling) runs
//! exactly as it does against hardware. The simulated cell is a resistor in
//! series with a constant rest potential:
//!
//! - potentiostatic: `I = (E_set - E_rest) / R`
//! - galvanostatic: `E = E_rest + I_set * R`
//! - open circuit or cell switched off: `E = E_rest`, `I = 0`
//!
//! A [`MockHandle`] shares the simulator state for inspection and failure
//! injection:
//!
//! - `fail_reads_after(n)`: after `n` successful reads every read times out
//! - `reject_writes_to(reg)`: writes to `reg` get an exception reply
//! - `corrupt_next_response()`: the next reply has a broken CRC
//!
//! # Example
//!
//! ```
//! use potentiostat_daq::hardware::{DeviceLink, MockPotentiostat, Register};
//!
//! let mock = MockPotentiostat::new(1);
//! let handle = mock.handle();
//! let mut link = DeviceLink::new(Box::new(mock), 1);
//! link.write_register(Register::TiaGainSelect, 3.0)?;
//! assert_eq!(handle.last_write(Register::TiaGainSelect), Some(3.0));
//! # Ok::<(), potentiostat_daq::error::DaqError>(())
//! ```

use crate::hardware::modbus::{self, Request};
use crate::hardware::registers::{
    code_to_words, words_to_code, ControlKind, DeviceCommand, Register, COMMAND_REGISTER,
    WORDS_PER_REGISTER,
};
use crate::hardware::transport::Transport;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const ILLEGAL_DATA_VALUE: u8 = 0x03;

struct MockState {
    codes: HashMap<u16, i32>,
    rest_potential: f64,
    resistance: f64,
    writes: Vec<(Register, f64)>,
    commands: Vec<(DeviceCommand, u16)>,
    reads_served: u64,
    fail_reads_after: Option<u64>,
    rejected: HashSet<u16>,
    corrupt_next: bool,
}

impl MockState {
    fn new() -> Self {
        Self {
            codes: HashMap::new(),
            rest_potential: 0.25,
            resistance: 1_000.0,
            writes: Vec::new(),
            commands: Vec::new(),
            reads_served: 0,
            fail_reads_after: None,
            rejected: HashSet::new(),
            corrupt_next: false,
        }
    }

    fn value(&self, register: Register) -> f64 {
        let spec = register.spec();
        spec.from_code(self.codes.get(&spec.address).copied().unwrap_or(0))
    }

    fn cell_on(&self) -> bool {
        self.value(Register::CellSwitch) >= 1.0
    }

    fn control(&self) -> ControlKind {
        match self.value(Register::ControlMode).round() as i64 {
            1 => ControlKind::Galvanostatic,
            2 => ControlKind::OpenCircuit,
            _ => ControlKind::Potentiostatic,
        }
    }

    /// Measured (potential, current) of the simulated cell.
    fn measure(&self) -> (f64, f64) {
        if !self.cell_on() {
            return (self.rest_potential, 0.0);
        }
        match self.control() {
            ControlKind::Potentiostatic => {
                let e = self.value(Register::SetPotential);
                (e, (e - self.rest_potential) / self.resistance)
            }
            ControlKind::Galvanostatic => {
                let i = self.value(Register::SetCurrent);
                (self.rest_potential + i * self.resistance, i)
            }
            ControlKind::OpenCircuit => (self.rest_potential, 0.0),
        }
    }

    fn register_words(&self, address: u16) -> Option<[u16; 2]> {
        let register = Register::from_address(address)?;
        let (potential, current) = self.measure();
        let code = match register {
            Register::ReadPotential => Register::ReadPotential
                .spec()
                .to_code(Register::ReadPotential.spec().clamp(potential)),
            Register::ReadCurrent => Register::ReadCurrent
                .spec()
                .to_code(Register::ReadCurrent.spec().clamp(current)),
            Register::StatusFlags => i32::from(self.cell_on()),
            other => self.codes.get(&other.spec().address).copied().unwrap_or(0),
        };
        Some(code_to_words(code))
    }

    fn serve(&mut self, slave: u8, request: Request) -> Option<Vec<u8>> {
        match request {
            Request::Read { start, count, .. } => {
                if let Some(limit) = self.fail_reads_after {
                    if self.reads_served >= limit {
                        trace!("mock: swallowing read request");
                        return None;
                    }
                }
                let mut words = Vec::with_capacity(usize::from(count));
                let mut address = start;
                while address < start + count {
                    match self.register_words(address) {
                        Some(pair) => words.extend_from_slice(&pair),
                        None => {
                            return Some(modbus::exception_response(
                                slave,
                                modbus::READ_HOLDING_REGISTERS,
                                ILLEGAL_DATA_ADDRESS,
                            ))
                        }
                    }
                    address += WORDS_PER_REGISTER;
                }
                words.truncate(usize::from(count));
                self.reads_served += 1;
                Some(modbus::read_response(slave, &words))
            }
            Request::Write { start, words, .. } => {
                if self.rejected.contains(&start) {
                    return Some(modbus::exception_response(
                        slave,
                        modbus::WRITE_MULTIPLE_REGISTERS,
                        ILLEGAL_DATA_VALUE,
                    ));
                }
                if start == COMMAND_REGISTER && words.len() == 2 {
                    let Some(command) = DeviceCommand::from_code(words[0]) else {
                        return Some(modbus::exception_response(
                            slave,
                            modbus::WRITE_MULTIPLE_REGISTERS,
                            ILLEGAL_DATA_VALUE,
                        ));
                    };
                    self.apply_command(command, words[1]);
                    return Some(modbus::write_response(slave, start, 2));
                }
                match Register::from_address(start) {
                    Some(register) if register.spec().access.writable() && words.len() == 2 => {
                        let code = words_to_code([words[0], words[1]]);
                        self.codes.insert(start, code);
                        self.writes.push((register, register.spec().from_code(code)));
                        Some(modbus::write_response(slave, start, 2))
                    }
                    _ => Some(modbus::exception_response(
                        slave,
                        modbus::WRITE_MULTIPLE_REGISTERS,
                        ILLEGAL_DATA_ADDRESS,
                    )),
                }
            }
        }
    }

    fn apply_command(&mut self, command: DeviceCommand, parameter: u16) {
        debug!(command = ?command, parameter, "mock: command");
        self.commands.push((command, parameter));
        match command {
            DeviceCommand::Reset | DeviceCommand::LoadDefaults => self.codes.clear(),
            DeviceCommand::TestStop => {
                self.codes.insert(Register::CellSwitch.spec().address, 0);
            }
            DeviceCommand::SensorZero | DeviceCommand::ClearFifo | DeviceCommand::ConfigSave => {}
        }
    }
}

/// Simulated instrument speaking Modbus RTU.
pub struct MockPotentiostat {
    slave: u8,
    state: Arc<Mutex<MockState>>,
    pending: VecDeque<u8>,
}

impl MockPotentiostat {
    /// Create a simulator answering as Modbus unit `slave`.
    pub fn new(slave: u8) -> Self {
        Self {
            slave,
            state: Arc::new(Mutex::new(MockState::new())),
            pending: VecDeque::new(),
        }
    }

    /// Handle for inspection and failure injection.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Transport for MockPotentiostat {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let handle = self.handle();
        let mut state = handle.lock();

        let request = match modbus::parse_request(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "mock: ignoring undecodable request");
                return Ok(());
            }
        };
        let addressed = match &request {
            Request::Read { slave, .. } | Request::Write { slave, .. } => *slave,
        };
        if addressed != self.slave {
            return Ok(());
        }

        if let Some(mut reply) = state.serve(self.slave, request) {
            if state.corrupt_next {
                state.corrupt_next = false;
                if let Some(last) = reply.last_mut() {
                    *last ^= 0xFF;
                }
            }
            self.pending.extend(reply);
        }
        Ok(())
    }

    fn receive_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.pending.len() < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "mock potentiostat did not answer",
            ));
        }
        let n = buf.len();
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "mock potentiostat".to_string()
    }
}

/// Shared view of a [`MockPotentiostat`]'s state.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the simulated rest (open-circuit) potential in volts.
    pub fn set_rest_potential(&self, volts: f64) {
        self.lock().rest_potential = volts;
    }

    /// Set the simulated cell resistance in ohms.
    pub fn set_resistance(&self, ohms: f64) {
        self.lock().resistance = ohms;
    }

    /// After `successful` more reads, every read request goes unanswered.
    pub fn fail_reads_after(&self, successful: u64) {
        let mut state = self.lock();
        state.fail_reads_after = Some(state.reads_served + successful);
    }

    /// Answer writes to `register` with an exception reply.
    pub fn reject_writes_to(&self, register: Register) {
        self.lock().rejected.insert(register.spec().address);
    }

    /// Break the CRC of the next reply.
    pub fn corrupt_next_response(&self) {
        self.lock().corrupt_next = true;
    }

    /// Every accepted register write, in order, in SI units.
    pub fn writes(&self) -> Vec<(Register, f64)> {
        self.lock().writes.clone()
    }

    /// Accepted writes to one register, in order.
    pub fn writes_to(&self, register: Register) -> Vec<f64> {
        self.lock()
            .writes
            .iter()
            .filter(|(reg, _)| *reg == register)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Most recent accepted write to `register`.
    pub fn last_write(&self, register: Register) -> Option<f64> {
        self.writes_to(register).last().copied()
    }

    /// Every accepted command, in order.
    pub fn commands(&self) -> Vec<(DeviceCommand, u16)> {
        self.lock().commands.clone()
    }

    /// Number of read requests answered.
    pub fn reads_served(&self) -> u64 {
        self.lock().reads_served
    }
}
