//! BGAPI packet framing and the DFU command class.
//!
//! Every packet starts with a 4-byte header followed by up to 2047 payload
//! bytes. Multi-byte payload fields are little-endian.
//!
//! ```text
//! +-----------+-------+-------+--------+-------------------+
//! | type|hlen | llen  | class | method | payload (len B)   |
//! +-----------+-------+-------+--------+-------------------+
//! ```
//!
//! `type|hlen` is `0x20` for commands and responses or `0xA0` for events,
//! OR-ed with the top three bits of the payload length.
//!
//! DFU class (`0x00`):
//!
//! | Method | Command               | Command payload  | Response  |
//! |--------|-----------------------|------------------|-----------|
//! | `0x00` | `reset`               | `u8 dfu`         | none      |
//! | `0x01` | `flash_set_address`   | `u32 address`    | `u16 result` |
//! | `0x02` | `flash_upload`        | `u8 len`, bytes  | `u16 result` |
//! | `0x03` | `flash_upload_finish` |                  | `u16 result` |
//!
//! | Event  | Name               | Payload       |
//! |--------|--------------------|---------------|
//! | `0x00` | `dfu_boot`         | `u32 version` |
//! | `0x01` | `dfu_boot_failure` | `u16 reason`  |

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};
use std::io::{Read, Write};

/// Header byte of a command or response with a payload under 256 bytes.
pub const MESSAGE_TYPE_COMMAND: u8 = 0x20;
/// Header byte of an event.
pub const MESSAGE_TYPE_EVENT: u8 = 0xA0;
/// Header size in bytes.
pub const HEADER_SIZE: usize = 4;
/// Largest payload the 11-bit length field can describe.
pub const MAX_PAYLOAD: usize = 0x7FF;
/// DFU command class.
pub const CLASS_DFU: u8 = 0x00;
/// Largest data field of a `flash_upload` command.
pub const MAX_UPLOAD_DATA: usize = 255;
/// Data bytes per `flash_upload` sent by [`DfuClient`].
pub const UPLOAD_CHUNK_SIZE: usize = 128;
/// Version reported in the `dfu_boot` event.
pub const BOOTLOADER_VERSION: u32 = 5;

/// DFU command method identifiers.
pub mod method {
    /// `dfu_reset`
    pub const RESET: u8 = 0x00;
    /// `dfu_flash_set_address`
    pub const FLASH_SET_ADDRESS: u8 = 0x01;
    /// `dfu_flash_upload`
    pub const FLASH_UPLOAD: u8 = 0x02;
    /// `dfu_flash_upload_finish`
    pub const FLASH_UPLOAD_FINISH: u8 = 0x03;
}

/// DFU event identifiers.
pub mod event {
    /// `dfu_boot`
    pub const BOOT: u8 = 0x00;
    /// `dfu_boot_failure`
    pub const BOOT_FAILURE: u8 = 0x01;
}

/// BGAPI result codes used by the DFU class.
pub mod result {
    /// Success.
    pub const SUCCESS: u16 = 0x0000;
    /// Hardware failure (flash controller).
    pub const HARDWARE: u16 = 0x018D;
    /// Staging buffer cannot take the chunk.
    pub const BUFFERS_FULL: u16 = 0x018E;
    /// Image CRC check failed.
    pub const IMAGE_CHECKSUM_ERROR: u16 = 0x0B03;

    /// Readable name for a result code.
    pub fn name(code: u16) -> &'static str {
        match code {
            SUCCESS => "success",
            HARDWARE => "hardware",
            BUFFERS_FULL => "buffers_full",
            IMAGE_CHECKSUM_ERROR => "image_checksum_error",
            _ => "unknown",
        }
    }
}

/// Packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Event (`true`) or command/response (`false`).
    pub event: bool,
    /// Payload length.
    pub len: u16,
    /// Command class.
    pub class: u8,
    /// Method or event identifier.
    pub method: u8,
}

impl Header {
    /// Encode into the 4-byte wire form.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let base = if self.event {
            MESSAGE_TYPE_EVENT
        } else {
            MESSAGE_TYPE_COMMAND
        };
        [
            base | ((self.len >> 8) as u8 & 0x07),
            self.len as u8,
            self.class,
            self.method,
        ]
    }

    /// Decode the 4-byte wire form.
    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Result<Self> {
        if bytes[0] & 0x78 != MESSAGE_TYPE_COMMAND {
            return Err(Error::Protocol(format!("invalid message type byte {:#04x}", bytes[0])));
        }
        Ok(Self {
            event: bytes[0] & 0x80 != 0,
            len: (u16::from(bytes[0] & 0x07) << 8) | u16::from(bytes[1]),
            class: bytes[2],
            method: bytes[3],
        })
    }
}

/// A framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header.
    pub header: Header,
    /// Payload, `header.len` bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a command or response packet.
    pub fn new(class: u8, method: u8, payload: Vec<u8>) -> Result<Self> {
        Self::build(false, class, method, payload)
    }

    /// Build an event packet.
    pub fn event(class: u8, method: u8, payload: Vec<u8>) -> Result<Self> {
        Self::build(true, class, method, payload)
    }

    fn build(event: bool, class: u8, method: u8, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD}",
                payload.len()
            )));
        }
        Ok(Self {
            header: Header {
                event,
                len: payload.len() as u16,
                class,
                method,
            },
            payload,
        })
    }

    /// Encode header and payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Write the packet to `port`.
    pub fn write_to<W: Write + ?Sized>(&self, port: &mut W) -> Result<()> {
        port.write_all(&self.to_bytes())?;
        port.flush()?;
        Ok(())
    }
}

fn read_payload<R: Read + ?Sized>(port: &mut R, first: u8) -> Result<Packet> {
    let mut rest = [0u8; HEADER_SIZE - 1];
    port.read_exact(&mut rest)?;
    let header = Header::from_bytes([first, rest[0], rest[1], rest[2]])?;
    let mut payload = vec![0u8; usize::from(header.len)];
    port.read_exact(&mut payload)?;
    Ok(Packet { header, payload })
}

fn read_u8<R: Read + ?Sized>(port: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    port.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Read one command packet as the device does: bytes are discarded until
/// the `0x20` sync byte.
pub fn read_command<R: Read + ?Sized>(port: &mut R) -> Result<Packet> {
    loop {
        let byte = read_u8(port)?;
        if byte == MESSAGE_TYPE_COMMAND {
            return read_payload(port, byte);
        }
        trace!("Discarding non-sync byte {byte:#04x}");
    }
}

/// Read one response or event packet as the host does.
pub fn read_reply<R: Read + ?Sized>(port: &mut R) -> Result<Packet> {
    loop {
        let byte = read_u8(port)?;
        if byte & 0x78 == MESSAGE_TYPE_COMMAND {
            return read_payload(port, byte);
        }
        trace!("Discarding non-sync byte {byte:#04x}");
    }
}

/// A decoded DFU class command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuCommand {
    /// Reboot, into DFU mode when `dfu` is set.
    Reset {
        /// Stay in the bootloader after the reset.
        dfu: bool,
    },
    /// Begin an upload.
    FlashSetAddress(u32),
    /// Upload a chunk of EBL bytes.
    FlashUpload(Vec<u8>),
    /// End the upload and validate the image.
    FlashUploadFinish,
}

impl DfuCommand {
    /// Method identifier.
    pub fn method(&self) -> u8 {
        match self {
            Self::Reset { .. } => method::RESET,
            Self::FlashSetAddress(_) => method::FLASH_SET_ADDRESS,
            Self::FlashUpload(_) => method::FLASH_UPLOAD,
            Self::FlashUploadFinish => method::FLASH_UPLOAD_FINISH,
        }
    }

    /// Command name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "dfu_reset",
            Self::FlashSetAddress(_) => "dfu_flash_set_address",
            Self::FlashUpload(_) => "dfu_flash_upload",
            Self::FlashUploadFinish => "dfu_flash_upload_finish",
        }
    }

    /// Encode as a packet.
    pub fn to_packet(&self) -> Result<Packet> {
        let payload = match self {
            Self::Reset { dfu } => vec![u8::from(*dfu)],
            Self::FlashSetAddress(address) => address.to_le_bytes().to_vec(),
            Self::FlashUpload(data) => {
                let len = u8::try_from(data.len()).map_err(|_| {
                    Error::Protocol(format!(
                        "upload chunk of {} bytes exceeds {MAX_UPLOAD_DATA}",
                        data.len()
                    ))
                })?;
                let mut payload = Vec::with_capacity(data.len() + 1);
                payload.push(len);
                payload.extend_from_slice(data);
                payload
            },
            Self::FlashUploadFinish => Vec::new(),
        };
        Packet::new(CLASS_DFU, self.method(), payload)
    }

    /// Decode a command packet. Returns `None` for packets outside the DFU
    /// command set.
    pub fn from_packet(packet: &Packet) -> Result<Option<Self>> {
        let Header {
            event, class, method: id, ..
        } = packet.header;
        if event || class != CLASS_DFU {
            return Ok(None);
        }
        let p = &packet.payload;
        let short = |need: usize| {
            Error::Protocol(format!(
                "method {id:#04x} payload needs {need} bytes, got {}",
                p.len()
            ))
        };

        let command = match id {
            method::RESET => Self::Reset {
                dfu: *p.first().ok_or_else(|| short(1))? != 0,
            },
            method::FLASH_SET_ADDRESS => {
                if p.len() < 4 {
                    return Err(short(4));
                }
                Self::FlashSetAddress(LittleEndian::read_u32(p))
            },
            method::FLASH_UPLOAD => {
                let len = usize::from(*p.first().ok_or_else(|| short(1))?);
                if p.len() < len + 1 {
                    return Err(short(len + 1));
                }
                Self::FlashUpload(p[1..=len].to_vec())
            },
            method::FLASH_UPLOAD_FINISH => Self::FlashUploadFinish,
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// DFU class events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuEvent {
    /// Bootloader started and waits for commands.
    Boot {
        /// Bootloader version.
        version: u32,
    },
    /// Application image failed validation at boot.
    BootFailure {
        /// BGAPI result code.
        reason: u16,
    },
}

impl DfuEvent {
    /// Encode as a packet.
    pub fn to_packet(self) -> Result<Packet> {
        match self {
            Self::Boot { version } => {
                Packet::event(CLASS_DFU, event::BOOT, version.to_le_bytes().to_vec())
            },
            Self::BootFailure { reason } => Packet::event(
                CLASS_DFU,
                event::BOOT_FAILURE,
                reason.to_le_bytes().to_vec(),
            ),
        }
    }

    /// Decode an event packet. Returns `None` for other packets.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let h = packet.header;
        if !h.event || h.class != CLASS_DFU {
            return None;
        }
        let p = &packet.payload;
        match h.method {
            event::BOOT if p.len() >= 4 => Some(Self::Boot {
                version: LittleEndian::read_u32(p),
            }),
            event::BOOT_FAILURE if p.len() >= 2 => Some(Self::BootFailure {
                reason: LittleEndian::read_u16(p),
            }),
            _ => None,
        }
    }
}

/// Build a DFU response packet carrying `result`.
pub fn response(method: u8, result: u16) -> Result<Packet> {
    Packet::new(CLASS_DFU, method, result.to_le_bytes().to_vec())
}

/// Result code of a DFU response packet.
pub fn response_result(packet: &Packet) -> Option<(u8, u16)> {
    let h = packet.header;
    if h.event || h.class != CLASS_DFU || packet.payload.len() < 2 {
        return None;
    }
    Some((h.method, LittleEndian::read_u16(&packet.payload)))
}

/// Host side of the UART DFU protocol.
pub struct DfuClient<'a, P: Read + Write> {
    port: &'a mut P,
    bytes_uploaded: usize,
}

impl<'a, P: Read + Write> DfuClient<'a, P> {
    /// Wrap a connected transport.
    pub fn new(port: &'a mut P) -> Self {
        Self {
            port,
            bytes_uploaded: 0,
        }
    }

    /// Bytes accepted by the device so far.
    pub fn bytes_uploaded(&self) -> usize {
        self.bytes_uploaded
    }

    fn send(&mut self, command: &DfuCommand) -> Result<()> {
        trace!("-> {}", command.name());
        command
            .to_packet()?
            .write_to(self.port)
    }

    /// Reboot into DFU mode and wait for the `dfu_boot` event.
    pub fn enter_dfu(&mut self) -> Result<u32> {
        self.send(&DfuCommand::Reset { dfu: true })?;
        self.wait_boot()
    }

    /// Wait for the `dfu_boot` event; returns the bootloader version.
    pub fn wait_boot(&mut self) -> Result<u32> {
        loop {
            let packet = read_reply(self.port)?;
            match DfuEvent::from_packet(&packet) {
                Some(DfuEvent::Boot { version }) => {
                    debug!("Bootloader version {version} ready");
                    return Ok(version);
                },
                Some(DfuEvent::BootFailure { reason }) => {
                    warn!(
                        "Device reported boot failure {reason:#06x} ({})",
                        result::name(reason)
                    );
                },
                None => trace!("Ignoring packet {:?} while waiting for boot", packet.header),
            }
        }
    }

    fn command(&mut self, command: &DfuCommand) -> Result<()> {
        self.send(command)?;
        let wanted = command.method();
        loop {
            let packet = read_reply(self.port)?;
            if let Some((method, code)) = response_result(&packet) {
                if method != wanted {
                    return Err(Error::Protocol(format!(
                        "response to method {method:#04x} while waiting for {}",
                        command.name()
                    )));
                }
                if code != result::SUCCESS {
                    return Err(Error::DeviceStatus {
                        command: command.name(),
                        code,
                    });
                }
                return Ok(());
            }
            trace!("Ignoring packet {:?}", packet.header);
        }
    }

    /// Start an upload session.
    pub fn set_address(&mut self, address: u32) -> Result<()> {
        self.command(&DfuCommand::FlashSetAddress(address))
    }

    /// Upload `data` in [`UPLOAD_CHUNK_SIZE`] chunks.
    pub fn upload(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(UPLOAD_CHUNK_SIZE) {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            self.command(&DfuCommand::FlashUpload(chunk.to_vec()))?;
            self.bytes_uploaded += chunk.len();
        }
        Ok(())
    }

    /// Finish the upload; fails if the device rejects the image.
    pub fn finish(&mut self) -> Result<()> {
        self.command(&DfuCommand::FlashUploadFinish)
    }

    /// Reset the device into the application.
    pub fn reset(&mut self) -> Result<()> {
        self.send(&DfuCommand::Reset { dfu: false })
    }
}
