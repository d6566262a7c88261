//! Driver errors

use thiserror::Error;

/// Errors reported by the device itself as a single response byte.
///
/// The device numbers these descending from 255.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unknown command")]
    UnknownCommand,

    #[error("device not initialized")]
    NotInitialized,

    #[error("device memory error")]
    MemoryError,

    #[error("app domain too long")]
    AppDomainTooLong,

    #[error("app domain invalid")]
    AppDomainInvalid,

    #[error("mnemonic too long")]
    MnemonicTooLong,

    #[error("mnemonic invalid")]
    MnemonicInvalid,

    #[error("failed to generate mnemonic")]
    GenerateMnemonic,

    #[error("input timeout")]
    InputTimeout,

    #[error("not implemented")]
    NotImplemented,
}

impl DeviceError {
    /// Map a wire byte in the error range to its named error.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            255 => Some(DeviceError::UnknownCommand),
            254 => Some(DeviceError::NotInitialized),
            253 => Some(DeviceError::MemoryError),
            252 => Some(DeviceError::AppDomainTooLong),
            251 => Some(DeviceError::AppDomainInvalid),
            250 => Some(DeviceError::MnemonicTooLong),
            249 => Some(DeviceError::MnemonicInvalid),
            248 => Some(DeviceError::GenerateMnemonic),
            247 => Some(DeviceError::InputTimeout),
            246 => Some(DeviceError::NotImplemented),
            _ => None,
        }
    }

    /// The wire byte the device sends for this error.
    pub fn byte(&self) -> u8 {
        match self {
            DeviceError::UnknownCommand => 255,
            DeviceError::NotInitialized => 254,
            DeviceError::MemoryError => 253,
            DeviceError::AppDomainTooLong => 252,
            DeviceError::AppDomainInvalid => 251,
            DeviceError::MnemonicTooLong => 250,
            DeviceError::MnemonicInvalid => 249,
            DeviceError::GenerateMnemonic => 248,
            DeviceError::InputTimeout => 247,
            DeviceError::NotImplemented => 246,
        }
    }
}

/// Errors that can fail a command completion or a driver operation.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("device error: {0}")]
    Device(DeviceError),

    #[error("unknown response byte {0:#04x}")]
    UnknownResponse(u8),

    #[error("not connected to device")]
    Disconnected,

    #[error("watchdog timeout")]
    WatchdogTimeout,

    #[error("command cleared")]
    Cleared,

    #[error("device locked")]
    Locked,

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
