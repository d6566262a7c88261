//! Response wire format
//!
//! The device answers every command with a response record. Most records are
//! a single status byte; output records bracket a variable-length payload
//! with `RESPONSE_OUTPUT` … `RESPONSE_OUTPUT_END` and use
//! `RESPONSE_ESC_SEQUENCE` as a one-byte escape so any payload byte can be
//! carried literally.

use serde::{Deserialize, Serialize};

/// Command accepted.
pub const RESPONSE_OK: u8 = 1;

/// Device wants more input for the command in progress.
pub const RESPONSE_SEND_INPUT: u8 = 2;

/// User rejected the request on the device.
pub const RESPONSE_REJECTED: u8 = 3;

/// Start of a multi-byte output record.
pub const RESPONSE_OUTPUT: u8 = 4;

/// End of a multi-byte output record.
pub const RESPONSE_OUTPUT_END: u8 = 5;

/// The next byte is literal payload, not a control byte.
pub const RESPONSE_ESC_SEQUENCE: u8 = 6;

/// The device is waiting for the user to confirm on-device.
pub const RESPONSE_WAIT_USER_CONFIRM: u8 = 10;

/// The device is locked.
pub const RESPONSE_LOCKED: u8 = 11;

/// Whether a byte is part of the control alphabet and must be escaped to be
/// transmitted literally inside an output record.
pub fn is_control_byte(byte: u8) -> bool {
    matches!(byte, 1..=6 | 10 | 11) || byte >= 246
}

/// A completed response to a single command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The device acknowledged the command (`RESPONSE_OK`).
    Ok,
    /// The device wants further input (`RESPONSE_SEND_INPUT`).
    SendInput,
    /// The user rejected the request (`RESPONSE_REJECTED`).
    Rejected,
    /// The collected bytes of an output record, with escapes removed.
    Output(Vec<u8>),
}

impl Response {
    /// The single-byte status code, if this response carries one.
    pub fn code(&self) -> Option<u8> {
        match self {
            Response::Ok => Some(RESPONSE_OK),
            Response::SendInput => Some(RESPONSE_SEND_INPUT),
            Response::Rejected => Some(RESPONSE_REJECTED),
            Response::Output(_) => None,
        }
    }

    /// The output payload, if this response is an output record.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            Response::Output(data) => Some(data),
            _ => None,
        }
    }
}
