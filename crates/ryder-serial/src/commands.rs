//! Device commands
//!
//! Command opcodes understood by the Ryder firmware. The driver treats them
//! as opaque bytes; what each command does (and what payload it expects) is
//! defined by the firmware.

use serde::{Deserialize, Serialize};

/// Commands accepted by the Ryder device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Wake the device
    Wake,

    /// Query firmware version and device state
    Info,

    /// Begin interactive device setup
    Setup,

    /// Restore a wallet from a seed
    RestoreFromSeed,

    /// Restore a wallet from a mnemonic phrase
    RestoreFromMnemonic,

    /// Erase the device
    Erase,

    /// Export the owner public key
    ExportOwnerKey,

    /// Export the owner private key
    ExportOwnerKeyPrivateKey,

    /// Export an app public key
    ExportAppKey,

    /// Export an app private key
    ExportAppKeyPrivateKey,

    /// Export the owner and app private keys in one response
    ExportOwnerAppKeyPrivateKey,

    /// Export all public identities
    ExportPublicIdentities,

    /// Export a single public identity
    ExportPublicIdentity,

    /// Begin an encryption session
    StartEncrypt,

    /// Begin a decryption session
    StartDecrypt,

    /// Cancel the operation in progress on the device
    Cancel,
}

impl Command {
    /// Get the single-byte opcode sent on the wire.
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Wake => 1,
            Command::Info => 2,
            Command::Setup => 10,
            Command::RestoreFromSeed => 11,
            Command::RestoreFromMnemonic => 12,
            Command::Erase => 13,
            Command::ExportOwnerKey => 18,
            Command::ExportOwnerKeyPrivateKey => 19,
            Command::ExportAppKey => 20,
            Command::ExportAppKeyPrivateKey => 21,
            Command::ExportOwnerAppKeyPrivateKey => 23,
            Command::ExportPublicIdentities => 30,
            Command::ExportPublicIdentity => 31,
            Command::StartEncrypt => 40,
            Command::StartDecrypt => 41,
            Command::Cancel => 100,
        }
    }

    /// Look a command up by its opcode.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            1 => Some(Command::Wake),
            2 => Some(Command::Info),
            10 => Some(Command::Setup),
            11 => Some(Command::RestoreFromSeed),
            12 => Some(Command::RestoreFromMnemonic),
            13 => Some(Command::Erase),
            18 => Some(Command::ExportOwnerKey),
            19 => Some(Command::ExportOwnerKeyPrivateKey),
            20 => Some(Command::ExportAppKey),
            21 => Some(Command::ExportAppKeyPrivateKey),
            23 => Some(Command::ExportOwnerAppKeyPrivateKey),
            30 => Some(Command::ExportPublicIdentities),
            31 => Some(Command::ExportPublicIdentity),
            40 => Some(Command::StartEncrypt),
            41 => Some(Command::StartDecrypt),
            100 => Some(Command::Cancel),
            _ => None,
        }
    }
}
