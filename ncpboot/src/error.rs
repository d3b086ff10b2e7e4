//! Error types for ncpboot.

use std::io;
use thiserror::Error;

/// Result type for ncpboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ncpboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed EBL stream or record.
    #[error("Invalid EBL: {0}")]
    InvalidEbl(String),

    /// Malformed application image (AAT missing or inconsistent).
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// More bytes arrived than the staging buffer can hold.
    #[error("Staging buffer full: {buffered} buffered + {incoming} incoming > {capacity}")]
    BuffersFull {
        /// Bytes already waiting in the staging buffer.
        buffered: usize,
        /// Bytes in the rejected chunk.
        incoming: usize,
        /// Staging buffer capacity.
        capacity: usize,
    },

    /// Flash erase/write primitive failed.
    #[error("Flash error: {0}")]
    Flash(String),

    /// Image CRC does not match the value stored in the AAT.
    #[error("Image checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC stored in the AAT.
        expected: u32,
        /// CRC computed over flash.
        actual: u32,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Bootloader handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Xmodem transfer error.
    #[error("Xmodem error: {0}")]
    Xmodem(String),

    /// Receiver cancelled the transfer.
    #[error("Transfer cancelled by receiver")]
    Cancelled,

    /// Operation interrupted by the embedding application.
    #[error("Interrupted")]
    Interrupted,

    /// Protocol error (framing, unexpected packet).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device answered a DFU command with a non-zero result code.
    #[error("Device rejected {command}: result {code:#06x}")]
    DeviceStatus {
        /// Command name.
        command: &'static str,
        /// BGAPI result code.
        code: u16,
    },

    /// No usable serial port found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a read timeout on the transport.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
