//! # Ryder Serial Driver
//!
//! Host-side driver for the Ryder hardware wallet (or its simulator) over a
//! USB-serial link.
//!
//! This library provides:
//! - A request/response protocol engine for the device's escape-sequenced
//!   wire format
//! - A strictly ordered command queue with head-of-queue cancellation and a
//!   watchdog on device responses
//! - An advisory lock layer for multi-command sequences
//! - Connection supervision with automatic reconnection
//! - Device enumeration by USB vendor/product identifiers
//!
//! ## Example
//!
//! ```rust,ignore
//! use ryder_serial::{Command, DriverConfig, RyderSerial};
//!
//! let ryder = RyderSerial::new("/dev/ttyUSB0", DriverConfig::default());
//! ryder.open();
//!
//! // Ask the device for its firmware info.
//! let info = ryder.send(Command::Info).wait()?;
//! println!("info: {:02x?}", info.output());
//! ```

mod channel;
mod commands;
mod driver;
mod engine;
mod error;
mod events;
mod lock;
mod queue;
mod response;
pub mod serial;

pub use channel::{Channel, SerialChannel, TcpChannel};
pub use commands::Command;
pub use driver::{DriverConfig, IntoCommandBytes, RyderSerial};
pub use error::{DeviceError, DriverError};
pub use events::DeviceEvent;
pub use queue::Completion;
pub use response::{is_control_byte, Response};

use std::time::Duration;

/// Default baud rate for device communication
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default delay between reconnection attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// How long the driver waits for response progress before failing the
/// command in flight
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(5000);

/// USB vendor id of the Ryder device
pub const RYDER_VID: u16 = 0x10c4;

/// USB product id of the Ryder device
pub const RYDER_PID: u16 = 0xea60;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::commands::Command;
    pub use crate::driver::{DriverConfig, RyderSerial};
    pub use crate::error::{DeviceError, DriverError};
    pub use crate::events::DeviceEvent;
    pub use crate::response::Response;
    pub use crate::serial::{list_ports, ryder_ports, PortInfo};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
