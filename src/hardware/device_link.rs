//! Exclusive, serialized access to the instrument's register map.
//!
//! [`DeviceLink`] is the blocking, single-owner view: every call is one complete
//! Modbus transaction (plus bounded retries) and touches the wire; nothing is
//! cached. [`SharedDeviceLink`] is the cloneable async handle the controller and
//! the acquisition loop share. It holds the link behind a `tokio::sync::Mutex`
//! and runs each operation on a blocking thread, so at most one transaction is
//! ever in flight on the serial port.

use crate::config::DeviceSettings;
use crate::error::{AppResult, DaqError};
use crate::hardware::modbus::{self, FrameError, MAX_READ_COUNT};
use crate::hardware::registers::{
    code_to_words, words_to_code, DeviceCommand, Register, COMMAND_REGISTER, WORDS_PER_REGISTER,
};
use crate::hardware::transport::Transport;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Blocking register-level access to one instrument.
pub struct DeviceLink {
    transport: Box<dyn Transport>,
    slave: u8,
    max_retries: u32,
    transactions: u64,
    retries: u64,
}

impl DeviceLink {
    /// Create a link talking to Modbus unit `slave` over `transport`.
    pub fn new(transport: Box<dyn Transport>, slave: u8) -> Self {
        Self {
            transport,
            slave,
            max_retries: DEFAULT_MAX_RETRIES,
            transactions: 0,
            retries: 0,
        }
    }

    /// Create a link using the `[device]` configuration section.
    pub fn from_settings(transport: Box<dyn Transport>, settings: &DeviceSettings) -> Self {
        Self::new(transport, settings.slave_address).with_max_retries(settings.max_retries)
    }

    /// Set how many times a failed transaction is repeated before giving up.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Number of transactions put on the wire, including retries.
    pub fn transaction_count(&self) -> u64 {
        self.transactions
    }

    /// Number of retried transactions.
    pub fn retry_count(&self) -> u64 {
        self.retries
    }

    /// Write an SI value to `register`.
    ///
    /// Values outside the register's physical range are clamped before
    /// transmission. Returns the value actually written.
    #[instrument(level = "trace", skip(self))]
    pub fn write_register(&mut self, register: Register, value: f64) -> AppResult<f64> {
        let spec = register.spec();
        if !spec.access.writable() {
            return Err(DaqError::invalid_parameter(
                "register",
                format!("{register} is read-only"),
            ));
        }
        if !value.is_finite() {
            return Err(DaqError::invalid_parameter(
                "register",
                format!("refusing to write non-finite value {value} to {register}"),
            ));
        }

        let clamped = spec.clamp(value);
        if clamped != value {
            warn!(
                register = %register,
                requested = value,
                written = clamped,
                unit = %spec.unit,
                "Setpoint clamped to register range"
            );
        }

        let code = spec.to_code(clamped);
        let words = code_to_words(code);
        self.write_words(&format!("write {register}"), spec.address, &words)?;
        trace!(register = %register, value = clamped, code, "register written");
        Ok(spec.from_code(code))
    }

    /// Read `register` and convert to SI units.
    pub fn read_register(&mut self, register: Register) -> AppResult<f64> {
        let values = self.read_registers(&[register])?;
        values
            .into_iter()
            .next()
            .ok_or_else(|| DaqError::Communication(format!("no value returned for {register}")))
    }

    /// Read several registers in as few transactions as possible.
    ///
    /// Registers whose addresses fit inside one Modbus read window are fetched
    /// in a single transaction. Values come back in the order requested.
    pub fn read_registers(&mut self, registers: &[Register]) -> AppResult<Vec<f64>> {
        if let Some(register) = registers.iter().find(|reg| !reg.spec().access.readable()) {
            return Err(DaqError::invalid_parameter(
                "register",
                format!("{register} is write-only"),
            ));
        }
        let Some(first) = registers.iter().map(|reg| reg.spec().address).min() else {
            return Ok(Vec::new());
        };
        let last = registers
            .iter()
            .map(|reg| reg.spec().address + WORDS_PER_REGISTER)
            .max()
            .unwrap_or(first + WORDS_PER_REGISTER);
        let span = last - first;

        if span > MAX_READ_COUNT {
            let mut values = Vec::with_capacity(registers.len());
            for register in registers {
                values.push(self.read_register(*register)?);
            }
            return Ok(values);
        }

        let label = registers
            .iter()
            .map(|reg| reg.spec().name)
            .collect::<Vec<_>>()
            .join("+");
        let slave = self.slave;
        let words = self.transact(&format!("read {label}"), |transport| {
            transport.send(&modbus::read_request(slave, first, span))?;
            modbus::receive_read_response(transport, slave, span)
        })?;

        Ok(registers
            .iter()
            .map(|reg| {
                let spec = reg.spec();
                let offset = usize::from(spec.address - first);
                spec.from_code(words_to_code([words[offset], words[offset + 1]]))
            })
            .collect())
    }

    /// Issue an instrument command through the command register.
    pub fn send_command(&mut self, command: DeviceCommand, parameter: u16) -> AppResult<()> {
        debug!(command = ?command, parameter, "Sending device command");
        self.write_words(
            &format!("command {command:?}"),
            COMMAND_REGISTER,
            &[command.code(), parameter],
        )
    }

    /// Short description of the underlying transport.
    pub fn describe(&self) -> String {
        format!("{} (unit {})", self.transport.describe(), self.slave)
    }

    fn write_words(&mut self, operation: &str, address: u16, words: &[u16]) -> AppResult<()> {
        let slave = self.slave;
        let count = words.len() as u16;
        self.transact(operation, |transport| {
            transport.send(&modbus::write_request(slave, address, words))?;
            modbus::receive_write_response(transport, slave, address, count)
        })
    }

    /// Run one request/response exchange with bounded retries.
    fn transact<T>(
        &mut self,
        operation: &str,
        mut exchange: impl FnMut(&mut dyn Transport) -> Result<T, FrameError>,
    ) -> AppResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.transactions += 1;
            let error = match exchange(self.transport.as_mut()) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retriable() || attempt > self.max_retries {
                warn!(
                    operation,
                    attempt,
                    error = %error,
                    "Transaction failed, giving up"
                );
                return Err(DaqError::Communication(format!(
                    "{operation} failed after {attempt} attempt(s): {error}"
                )));
            }

            self.retries += 1;
            debug!(operation, attempt, error = %error, "Transaction failed, retrying");
            if let Err(e) = self.transport.discard_input() {
                debug!(error = %e, "Could not discard pending input");
            }
        }
    }
}

/// Cloneable async handle to a [`DeviceLink`].
///
/// Both the driving path and the sampling path hold one of these. Every call
/// locks the link for exactly one logical operation; there is no queueing
/// priority, so either side may briefly wait for the other.
#[derive(Clone)]
pub struct SharedDeviceLink {
    inner: Arc<Mutex<DeviceLink>>,
}

impl SharedDeviceLink {
    /// Share `link` between the driving and sampling paths.
    pub fn new(link: DeviceLink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(link)),
        }
    }

    /// Run `operation` against the locked link on a blocking thread.
    pub async fn with_link<T, F>(&self, operation: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DeviceLink) -> AppResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut link = inner.blocking_lock();
            operation(&mut link)
        })
        .await
        .map_err(|e| DaqError::Communication(format!("serial I/O task failed: {e}")))?
    }

    /// See [`DeviceLink::write_register`].
    pub async fn write_register(&self, register: Register, value: f64) -> AppResult<f64> {
        self.with_link(move |link| link.write_register(register, value))
            .await
    }

    /// See [`DeviceLink::read_register`].
    pub async fn read_register(&self, register: Register) -> AppResult<f64> {
        self.with_link(move |link| link.read_register(register)).await
    }

    /// See [`DeviceLink::read_registers`].
    pub async fn read_registers(&self, registers: Vec<Register>) -> AppResult<Vec<f64>> {
        self.with_link(move |link| link.read_registers(&registers))
            .await
    }

    /// See [`DeviceLink::send_command`].
    pub async fn send_command(&self, command: DeviceCommand, parameter: u16) -> AppResult<()> {
        self.with_link(move |link| link.send_command(command, parameter))
            .await
    }

    /// `(transactions, retries)` so far.
    pub async fn counters(&self) -> (u64, u64) {
        let link = self.inner.lock().await;
        (link.transaction_count(), link.retry_count())
    }

    /// Description of the underlying transport.
    pub async fn describe(&self) -> String {
        self.inner.lock().await.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPotentiostat;
    use tracing_test::traced_test;

    fn link_with_mock() -> (DeviceLink, crate::hardware::mock::MockHandle) {
        let mock = MockPotentiostat::new(1);
        let handle = mock.handle();
        (DeviceLink::new(Box::new(mock), 1), handle)
    }

    #[test]
    fn every_call_advances_the_transaction_counter() {
        let (mut link, _handle) = link_with_mock();
        link.write_register(Register::TiaGainSelect, 2.0).unwrap();
        link.read_register(Register::TiaGainSelect).unwrap();
        link.read_register(Register::TiaGainSelect).unwrap();
        assert_eq!(link.transaction_count(), 3);
        assert_eq!(link.retry_count(), 0);
    }

    #[test]
    fn reads_potential_and_current_in_one_transaction() {
        let (mut link, handle) = link_with_mock();
        handle.set_rest_potential(0.3);
        let values = link
            .read_registers(&[Register::ReadPotential, Register::ReadCurrent])
            .unwrap();
        assert_eq!(link.transaction_count(), 1);
        assert!((values[0] - 0.3).abs() < 1e-6);
        assert!(values[1].abs() < 1e-9);
    }

    #[traced_test]
    #[test]
    fn clamps_out_of_range_setpoint_before_transmission() {
        let (mut link, handle) = link_with_mock();
        let written = link.write_register(Register::SetPotential, 7.5).unwrap();
        assert!((written - 4.0).abs() < 1e-9);
        let sent = handle.last_write(Register::SetPotential).unwrap();
        assert!((sent - 4.0).abs() < 1e-9);
        assert!(logs_contain("Setpoint clamped"));
    }

    #[test]
    fn rejects_access_mode_violations_without_touching_the_wire() {
        let (mut link, _handle) = link_with_mock();
        assert!(matches!(
            link.write_register(Register::ReadCurrent, 0.0),
            Err(DaqError::InvalidParameter { .. })
        ));
        assert!(matches!(
            link.read_register(Register::SetPotential),
            Err(DaqError::InvalidParameter { .. })
        ));
        assert!(matches!(
            link.write_register(Register::SetPotential, f64::NAN),
            Err(DaqError::InvalidParameter { .. })
        ));
        assert_eq!(link.transaction_count(), 0);
    }

    #[test]
    fn retries_are_bounded() {
        let (link, handle) = link_with_mock();
        let mut link = link.with_max_retries(2);
        handle.fail_reads_after(0);
        let err = link.read_register(Register::ReadPotential).unwrap_err();
        assert!(matches!(err, DaqError::Communication(_)));
        assert_eq!(link.transaction_count(), 3);
        assert_eq!(link.retry_count(), 2);
    }

    #[test]
    fn recovers_from_a_single_corrupted_reply() {
        let (mut link, handle) = link_with_mock();
        handle.corrupt_next_response();
        link.write_register(Register::CellSwitch, 1.0).unwrap();
        assert_eq!(link.retry_count(), 1);
        assert_eq!(handle.last_write(Register::CellSwitch), Some(1.0));
    }

    #[test]
    fn device_rejection_is_not_retried() {
        let (mut link, handle) = link_with_mock();
        handle.reject_writes_to(Register::TiaGainSelect);
        let err = link.write_register(Register::TiaGainSelect, 1.0).unwrap_err();
        assert!(matches!(err, DaqError::Communication(msg) if msg.contains("exception")));
        assert_eq!(link.transaction_count(), 1);
    }

    #[test]
    fn commands_use_the_command_register() {
        let (mut link, handle) = link_with_mock();
        link.send_command(DeviceCommand::ClearFifo, 1).unwrap();
        assert_eq!(handle.commands(), vec![(DeviceCommand::ClearFifo, 1)]);
    }

    #[tokio::test]
    async fn shared_link_serializes_operations() {
        let (link, handle) = link_with_mock();
        let shared = SharedDeviceLink::new(link);
        let a = shared.clone();
        let b = shared.clone();
        let (ra, rb) = tokio::join!(
            a.write_register(Register::SetPotential, 0.5),
            b.read_registers(vec![Register::ReadPotential, Register::ReadCurrent])
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(shared.counters().await, (2, 0));
        let sent = handle.last_write(Register::SetPotential).unwrap();
        assert!((sent - 0.5).abs() < 1e-9);
    }
}
