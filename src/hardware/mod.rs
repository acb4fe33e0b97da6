//! Instrument access: register map, Modbus RTU framing, transports and the
//! shared device link.
//!
//! Leaves first: [`registers`] describes what can be read and written,
//! [`modbus`] frames it, a [`Transport`] moves the bytes (real serial port or
//! [`MockPotentiostat`]), and [`DeviceLink`] ties the three together.

pub mod device_link;
pub mod mock;
pub mod modbus;
pub mod registers;
pub mod serial;
pub mod transport;

pub use device_link::{DeviceLink, SharedDeviceLink, DEFAULT_MAX_RETRIES};
pub use mock::{MockHandle, MockPotentiostat};
pub use registers::{ControlKind, DeviceCommand, Register, RegisterSpec, TiaGain};
pub use serial::{SerialTransport, SerialTransportBuilder};
pub use transport::Transport;
