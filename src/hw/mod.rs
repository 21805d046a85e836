//! Device transports behind trait seams.
//!
//! Handlers own exactly one transport each; every blocking call is bounded by
//! a timeout below the handler stop window so workers observe shutdown
//! promptly. Tests substitute scripted fakes for the traits.

pub mod can;
pub mod i2c;
pub mod serial;

pub use can::{CanBus, CanFrame, SocketCan};
pub use i2c::{I2cBus, LinuxI2c, SharedI2cBus};
pub use serial::{NmeaSource, SerialNmea};
