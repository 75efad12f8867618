//! Hardware device integration
//!
//! A single physical signing device is reached through a [`DeviceTransport`];
//! [`DeviceSession`] owns the connection and serializes access to it.

pub mod emulator;
pub mod session;
pub mod transport;

pub use emulator::EmulatedDevice;
pub use session::{DeviceSession, SessionHandle, SessionState, SessionStats};
pub use transport::{DeviceAccount, DeviceFault, DeviceHandle, DeviceTransport};
