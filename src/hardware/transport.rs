//! Byte-level transport seam between the Modbus codec and the physical link.

use std::io;

/// A point-to-point, half-duplex byte link.
///
/// Implementations are blocking; callers run them on a blocking thread
/// (see [`crate::hardware::SharedDeviceLink`]).
pub trait Transport: Send {
    /// Transmit one complete frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Fill `buf` completely or fail with [`io::ErrorKind::TimedOut`].
    fn receive_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Drop any unread input, e.g. the tail of a garbled reply before a retry.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}
