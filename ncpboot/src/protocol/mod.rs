//! Wire protocols.
//!
//! - [`crc`]: CRC-16/CCITT and CRC-32 primitives.
//! - [`xmodem`]: Xmodem-CRC sender used by standalone bootloaders.
//! - [`bgapi`]: BGAPI packet framing and the UART DFU command class.

pub mod bgapi;
pub mod crc;
pub mod xmodem;

pub use bgapi::{DfuClient, DfuCommand, DfuEvent, Packet};
pub use xmodem::{XmodemConfig, XmodemSender, XmodemState};
