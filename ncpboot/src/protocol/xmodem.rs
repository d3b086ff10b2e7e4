//! Xmodem-CRC sender.
//!
//! Streams an arbitrary byte sequence to a receiver in fixed 128-byte blocks,
//! stop-and-wait, with CRC-16 error detection.
//!
//! ## Block format
//!
//! ```text
//! +-----+-----+------+--------------+--------+--------+
//! | SOH | SEQ | ~SEQ |  DATA (128)  | CRC hi | CRC lo |
//! +-----+-----+------+--------------+--------+--------+
//! | 1   | 1   | 1    |     128      | 1      | 1      |
//! +-----+-----+------+--------------+--------+--------+
//! ```
//!
//! The CRC is CRC-16/CCITT seeded with 0 over the data bytes only. A final
//! partial block is padded with `0xFF` so unwritten flash stays erased.
//!
//! ## State machine
//!
//! ```text
//! Uninitialized --init(false)--> StartTransmission --'C'--> Sending
//! Uninitialized --init(true)---------------------------->  Sending
//! Sending --send_data(.., finished)--> EOT/ACK --> Uninitialized
//! ```

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use log::{debug, trace};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Xmodem control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Data bytes per block.
pub const DATA_SIZE: usize = 128;

/// SOH + block number + complement.
pub const HEADER_SIZE: usize = 3;

/// CRC high + low.
pub const FOOTER_SIZE: usize = 2;

/// Bytes on the wire per block.
pub const FULL_BLOCK_SIZE: usize = HEADER_SIZE + DATA_SIZE + FOOTER_SIZE;

/// Padding byte for the final partial block.
pub const PAD_BYTE: u8 = 0xFF;

/// Default number of transmissions per block.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Xmodem configuration options.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// How long to wait for the initial 'C' from the receiver.
    pub handshake_timeout: Duration,
    /// How long to wait for a block or EOT response.
    pub response_timeout: Duration,
    /// Transmissions per block before giving up (NAK responses).
    pub max_retries: u32,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(5),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Sender state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemState {
    /// No transfer in progress.
    Uninitialized,
    /// Waiting for the receiver's 'C' before the first block.
    StartTransmission,
    /// Blocks may be sent.
    Sending,
}

/// Xmodem transfer handler.
///
/// Owns the block accumulator and sequence number for one transfer; the
/// transport is borrowed for its lifetime.
pub struct XmodemSender<'a, P: Read + Write> {
    port: &'a mut P,
    config: XmodemConfig,
    state: XmodemState,
    buff_finger: usize,
    data_buff: [u8; DATA_SIZE],
    block_num: u8,
    blocks_sent: usize,
}

impl<'a, P: Read + Write> XmodemSender<'a, P> {
    /// Create a new sender with default configuration.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, XmodemConfig::default())
    }

    /// Create a new sender with custom configuration.
    pub fn with_config(port: &'a mut P, config: XmodemConfig) -> Self {
        Self {
            port,
            config,
            state: XmodemState::Uninitialized,
            buff_finger: 0,
            data_buff: [PAD_BYTE; DATA_SIZE],
            block_num: 1,
            blocks_sent: 0,
        }
    }

    /// Prepare for a new transfer.
    ///
    /// With `start_immediately` the receiver is assumed ready (links without
    /// an initial handshake, e.g. SPI); otherwise the first
    /// [`send_data`](Self::send_data) waits for a 'C'.
    pub fn init(&mut self, start_immediately: bool) {
        self.state = if start_immediately {
            XmodemState::Sending
        } else {
            XmodemState::StartTransmission
        };
        self.buff_finger = 0;
        self.block_num = 1;
        self.blocks_sent = 0;
    }

    /// Current state.
    pub fn state(&self) -> XmodemState {
        self.state
    }

    /// Number of blocks acknowledged so far in this transfer.
    pub fn blocks_sent(&self) -> usize {
        self.blocks_sent
    }

    /// Send a chunk of data of any length.
    ///
    /// Data is cut into 128-byte blocks; a trailing partial block is kept
    /// until more data arrives or `finished` is set, in which case it is
    /// padded, sent, and the transfer is closed with EOT.
    ///
    /// Any failure after the handshake ends the transfer; the sender must be
    /// [`init`](Self::init)ed again before it accepts more data.
    pub fn send_data(&mut self, data: &[u8], finished: bool) -> Result<()> {
        if self.state == XmodemState::StartTransmission {
            self.wait_for(
                control::C,
                self.config
                    .handshake_timeout,
            )
            .map_err(|e| match e {
                Error::Timeout(_) => Error::HandshakeFailed("no 'C' from receiver".into()),
                other => other,
            })?;
            debug!("Received 'C', sending");
            self.state = XmodemState::Sending;
        }

        if self.state != XmodemState::Sending {
            return Err(Error::Xmodem("transfer not initialized".into()));
        }

        let sent = self.stream(data, finished);
        if sent.is_err() {
            // A failed block leaves the transfer unrecoverable; require init().
            self.buff_finger = 0;
            self.state = XmodemState::Uninitialized;
        }
        sent
    }

    fn stream(&mut self, data: &[u8], finished: bool) -> Result<()> {
        for &byte in data {
            self.data_buff[self.buff_finger] = byte;
            self.buff_finger += 1;
            if self.buff_finger >= DATA_SIZE {
                self.flush_block()?;
            }
        }

        if finished {
            if self.buff_finger != 0 {
                self.data_buff[self.buff_finger..].fill(PAD_BYTE);
                self.buff_finger = DATA_SIZE;
                debug!("Final block {}", self.block_num);
                self.flush_block()?;
            }
            self.send_eot()?;
            self.state = XmodemState::Uninitialized;
        }

        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let block = self.data_buff;
        self.send_block(self.block_num, &block)?;
        self.buff_finger = 0;
        self.block_num = self
            .block_num
            .wrapping_add(1);
        self.blocks_sent += 1;
        Ok(())
    }

    /// Build the 133-byte wire frame for one block.
    pub fn build_block(block_num: u8, data: &[u8; DATA_SIZE]) -> [u8; FULL_BLOCK_SIZE] {
        let mut frame = [0u8; FULL_BLOCK_SIZE];
        frame[0] = control::SOH;
        frame[1] = block_num;
        frame[2] = !block_num;
        frame[HEADER_SIZE..HEADER_SIZE + DATA_SIZE].copy_from_slice(data);

        let crc = crc16_xmodem(data);
        frame[HEADER_SIZE + DATA_SIZE] = (crc >> 8) as u8;
        frame[HEADER_SIZE + DATA_SIZE + 1] = (crc & 0xFF) as u8;
        frame
    }

    /// Send one block and wait for it to be acknowledged.
    ///
    /// A NAK triggers retransmission up to `max_retries` transmissions in
    /// total. Stray 'C' characters left over from the handshake are skipped.
    pub fn send_block(&mut self, block_num: u8, data: &[u8; DATA_SIZE]) -> Result<()> {
        let frame = Self::build_block(block_num, data);
        let mut status = control::NAK;
        let mut attempts = 0;

        while status == control::NAK && attempts < self.config.max_retries {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            trace!("Sending block {block_num} (attempt {})", attempts + 1);
            self.port
                .write_all(&frame)?;
            self.port
                .flush()?;
            attempts += 1;

            status = self.next_response()?;
            while status == control::C {
                status = self.next_response()?;
            }

            if status == control::NAK {
                debug!("Block {block_num} NAKed");
            }
        }

        match status {
            control::ACK => {
                trace!("Block {block_num} ACKed");
                Ok(())
            },
            control::CAN => Err(Error::Cancelled),
            control::NAK => Err(Error::Xmodem(format!(
                "block {block_num} not acknowledged after {attempts} attempts"
            ))),
            other => Err(Error::Xmodem(format!(
                "block {block_num}: unexpected response 0x{other:02X}"
            ))),
        }
    }

    fn send_eot(&mut self) -> Result<()> {
        debug!("Sending EOT");
        self.port
            .write_all(&[control::EOT])?;
        self.port
            .flush()?;
        self.wait_for(
            control::ACK,
            self.config
                .response_timeout,
        )
        .map_err(|e| match e {
            Error::Timeout(_) => Error::Xmodem("EOT not acknowledged".into()),
            other => other,
        })?;
        debug!("EOT ACKed");
        Ok(())
    }

    /// Read a single byte from the transport.
    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(Error::Timeout("read_byte: no data".into())),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::Timeout("read_byte: timeout".into()))
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Wait up to `timeout` for any byte.
    fn read_byte_within(&mut self, timeout: Duration) -> Result<u8> {
        let start = Instant::now();
        loop {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            match self.read_byte() {
                Ok(b) => return Ok(b),
                Err(e) if e.is_timeout() && start.elapsed() < timeout => {},
                Err(e) => return Err(e),
            }
        }
    }

    fn next_response(&mut self) -> Result<u8> {
        self.read_byte_within(
            self.config
                .response_timeout,
        )
    }

    /// Wait for a specific byte, discarding anything else.
    fn wait_for(&mut self, expected: u8, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.read_byte_within(timeout.saturating_sub(start.elapsed())) {
                Ok(b) if b == expected => return Ok(()),
                Ok(b) => trace!("Waiting for 0x{expected:02X}, got 0x{b:02X}"),
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Timeout(format!("waiting for 0x{expected:02X}")))
    }
}
