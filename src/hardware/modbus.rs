//! Modbus RTU frame building and parsing.
//!
//! Only the two functions the potentiostat firmware implements are supported:
//!
//! - `0x03` read holding registers
//! - `0x10` write multiple registers
//!
//! Frames end with a CRC-16/MODBUS checksum, low byte first. Exception replies
//! (`function | 0x80`) carry a one-byte exception code.
//!
//! # Example: read READ_POTENTIAL and READ_CURRENT in one request
//!
//! ```
//! use potentiostat_daq::hardware::modbus;
//!
//! let frame = modbus::read_request(1, 0x0100, 4);
//! assert_eq!(&frame[..6], &[0x01, 0x03, 0x01, 0x00, 0x00, 0x04]);
//! assert!(modbus::validate_crc(&frame));
//! ```

use crate::hardware::transport::Transport;
use crc::{Crc, CRC_16_MODBUS};
use std::io;
use thiserror::Error;
use tracing::trace;

/// Function code: read holding registers.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Function code: write multiple registers.
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Largest register count a single read may request.
pub const MAX_READ_COUNT: u16 = 125;

const EXCEPTION_FLAG: u8 = 0x80;
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Failure while exchanging one frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Timeout or port failure.
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Checksum of the reply did not match.
    #[error("CRC mismatch in response")]
    Crc,

    /// Reply of unexpected length, address or function.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Modbus exception reply.
    #[error("device returned exception code {code:#04x} for function {function:#04x}")]
    Exception {
        /// Function code of the request
        function: u8,
        /// Exception code
        code: u8,
    },
}

impl FrameError {
    /// Whether repeating the same request can reasonably succeed.
    ///
    /// An exception reply means the instrument understood and refused the request.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, FrameError::Exception { .. })
    }
}

/// A decoded request, as seen by the slave side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// 0x03, read holding registers
    Read {
        /// Unit id
        slave: u8,
        /// First word address
        start: u16,
        /// Number of words
        count: u16,
    },
    /// 0x10, write multiple registers
    Write {
        /// Unit id
        slave: u8,
        /// First word address
        start: u16,
        /// Words to store
        words: Vec<u16>,
    },
}

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Append the CRC of the current contents, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Validate the trailing CRC of a complete frame.
pub fn validate_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (data, received) = frame.split_at(frame.len() - 2);
    crc16(data).to_le_bytes() == received
}

/// Build a "read holding registers" request.
pub fn read_request(slave: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build a "write multiple registers" request.
pub fn write_request(slave: u8, start: u16, words: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + words.len() * 2);
    frame.push(slave);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&(words.len() as u16).to_be_bytes());
    frame.push((words.len() * 2) as u8);
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Build the reply to a read request.
pub fn read_response(slave: u8, words: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + words.len() * 2);
    frame.push(slave);
    frame.push(READ_HOLDING_REGISTERS);
    frame.push((words.len() * 2) as u8);
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Build the reply to a write request (echo of start and count).
pub fn write_response(slave: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build an exception reply.
pub fn exception_response(slave: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave, function | EXCEPTION_FLAG, code];
    append_crc(&mut frame);
    frame
}

/// Decode a complete request frame (slave side).
pub fn parse_request(frame: &[u8]) -> Result<Request, FrameError> {
    if frame.len() < 8 {
        return Err(FrameError::Malformed(format!(
            "request too short: {} bytes",
            frame.len()
        )));
    }
    if !validate_crc(frame) {
        return Err(FrameError::Crc);
    }
    let slave = frame[0];
    let start = u16::from_be_bytes([frame[2], frame[3]]);
    let count = u16::from_be_bytes([frame[4], frame[5]]);
    match frame[1] {
        READ_HOLDING_REGISTERS => Ok(Request::Read {
            slave,
            start,
            count,
        }),
        WRITE_MULTIPLE_REGISTERS => {
            let byte_count = usize::from(frame[6]);
            let payload = &frame[7..frame.len() - 2];
            if byte_count != payload.len() || byte_count != usize::from(count) * 2 {
                return Err(FrameError::Malformed(format!(
                    "write declares {count} registers / {byte_count} bytes, carries {} bytes",
                    payload.len()
                )));
            }
            let words = payload
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(Request::Write {
                slave,
                start,
                words,
            })
        }
        other => Err(FrameError::Malformed(format!(
            "unsupported function {other:#04x}"
        ))),
    }
}

/// Receive and decode the reply to a read request.
pub fn receive_read_response(
    transport: &mut dyn Transport,
    slave: u8,
    count: u16,
) -> Result<Vec<u16>, FrameError> {
    let mut frame = receive_header(transport, slave, READ_HOLDING_REGISTERS)?;

    let mut byte_count = [0u8; 1];
    transport.receive_exact(&mut byte_count)?;
    frame.push(byte_count[0]);
    if usize::from(byte_count[0]) != usize::from(count) * 2 {
        return Err(FrameError::Malformed(format!(
            "expected {} data bytes, device announced {}",
            usize::from(count) * 2,
            byte_count[0]
        )));
    }

    let mut rest = vec![0u8; usize::from(byte_count[0]) + 2];
    transport.receive_exact(&mut rest)?;
    frame.extend_from_slice(&rest);
    trace!(frame = ?frame, "received read response");

    if !validate_crc(&frame) {
        return Err(FrameError::Crc);
    }
    Ok(frame[3..frame.len() - 2]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Receive and check the reply to a write request.
pub fn receive_write_response(
    transport: &mut dyn Transport,
    slave: u8,
    start: u16,
    count: u16,
) -> Result<(), FrameError> {
    let mut frame = receive_header(transport, slave, WRITE_MULTIPLE_REGISTERS)?;

    let mut rest = [0u8; 6];
    transport.receive_exact(&mut rest)?;
    frame.extend_from_slice(&rest);
    trace!(frame = ?frame, "received write response");

    if !validate_crc(&frame) {
        return Err(FrameError::Crc);
    }
    let echoed_start = u16::from_be_bytes([frame[2], frame[3]]);
    let echoed_count = u16::from_be_bytes([frame[4], frame[5]]);
    if echoed_start != start || echoed_count != count {
        return Err(FrameError::Malformed(format!(
            "write echo mismatch: sent {start:#06x}/{count}, got {echoed_start:#06x}/{echoed_count}"
        )));
    }
    Ok(())
}

/// Read the address/function pair, turning exception replies into errors.
fn receive_header(
    transport: &mut dyn Transport,
    slave: u8,
    function: u8,
) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; 2];
    transport.receive_exact(&mut header)?;

    if header[1] == function | EXCEPTION_FLAG {
        let mut rest = [0u8; 3];
        transport.receive_exact(&mut rest)?;
        let frame = [header[0], header[1], rest[0], rest[1], rest[2]];
        if !validate_crc(&frame) {
            return Err(FrameError::Crc);
        }
        return Err(FrameError::Exception {
            function,
            code: rest[0],
        });
    }
    if header[0] != slave {
        return Err(FrameError::Malformed(format!(
            "reply from slave {} while talking to {slave}",
            header[0]
        )));
    }
    if header[1] != function {
        return Err(FrameError::Malformed(format!(
            "expected function {function:#04x}, got {:#04x}",
            header[1]
        )));
    }
    Ok(header.to_vec())
}
