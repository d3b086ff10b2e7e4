//! Host-side bootload orchestration.
//!
//! Sends a byte range of a local image file to a device bootloader:
//!
//! 1. start bootloader communications through a [`BootloaderLink`],
//! 2. stream the slice in 128-byte reads over Xmodem or BGAPI DFU,
//! 3. reboot the device whether or not the transfer worked.
//!
//! ```rust,no_run
//! use ncpboot::bootload::{BootloadOptions, PassiveLink, WHOLE_FILE, bootload_image};
//! use ncpboot::port::{NativePort, SerialConfig};
//!
//! fn main() -> ncpboot::Result<()> {
//!     let mut port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     bootload_image(
//!         &mut PassiveLink,
//!         &mut port,
//!         "app.ebl",
//!         0,
//!         WHOLE_FILE,
//!         &BootloadOptions::default(),
//!         &mut |sent, total| println!("{sent}/{total}"),
//!     )
//! }
//! ```

use crate::error::{Error, Result};
use crate::protocol::bgapi::DfuClient;
use crate::protocol::xmodem::{XmodemConfig, XmodemSender};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// `length` value meaning "from `offset` to the end of the file".
pub const WHOLE_FILE: u32 = 0xFFFF_FFFF;

/// Bytes read from the image file per step.
pub const TRANSFER_BLOCK_SIZE: usize = 128;

/// Progress percentage step used by [`PercentageReporter::default`].
pub const PERCENTAGE_UPDATE: u8 = 5;

/// Prompt printed by the standalone bootloader menu.
pub const MENU_PROMPT: &[u8] = b"BL >";

/// Transfer protocol spoken to the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransferProtocol {
    /// Xmodem-CRC (standalone and NCP serial bootloaders).
    #[default]
    Xmodem,
    /// BGAPI UART DFU.
    Bgapi,
}

impl std::fmt::Display for TransferProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xmodem => write!(f, "xmodem"),
            Self::Bgapi => write!(f, "bgapi"),
        }
    }
}

/// Transfer options.
#[derive(Debug, Clone, Default)]
pub struct BootloadOptions {
    /// Protocol to use.
    pub protocol: TransferProtocol,
    /// Skip the Xmodem 'C' handshake (receiver already waiting).
    pub start_immediately: bool,
    /// Xmodem timing and retry settings.
    pub xmodem: XmodemConfig,
}

/// How bootloader communications are started and ended.
pub trait BootloaderLink {
    /// Bring the device to the point where it accepts an image.
    fn start<P: Read + Write>(&mut self, port: &mut P) -> Result<()>;

    /// Leave the bootloader after a transfer attempt.
    fn reboot<P: Read + Write>(&mut self, port: &mut P) -> Result<()>;
}

/// The device is already waiting for an image and reboots on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveLink;

impl BootloaderLink for PassiveLink {
    fn start<P: Read + Write>(&mut self, _port: &mut P) -> Result<()> {
        Ok(())
    }

    fn reboot<P: Read + Write>(&mut self, _port: &mut P) -> Result<()> {
        Ok(())
    }
}

/// Drives the text menu of a standalone bootloader.
///
/// ```text
/// 1. upload ebl
/// 2. run
/// 3. ebl info
/// BL >
/// ```
#[derive(Debug, Clone)]
pub struct MenuLink {
    /// How long to wait for the prompt.
    pub prompt_timeout: Duration,
}

impl Default for MenuLink {
    fn default() -> Self {
        Self {
            prompt_timeout: Duration::from_secs(5),
        }
    }
}

impl MenuLink {
    const UPLOAD: u8 = b'1';
    const RUN: u8 = b'2';

    fn wait_prompt<P: Read + Write>(&self, port: &mut P) -> Result<()> {
        port.write_all(b"\r")?;
        port.flush()?;

        let start = Instant::now();
        let mut seen = Vec::new();
        let mut byte = [0u8; 1];
        while start.elapsed() < self.prompt_timeout {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            match port.read(&mut byte) {
                Ok(1) => {
                    seen.push(byte[0]);
                    if seen.ends_with(MENU_PROMPT) {
                        debug!("Bootloader prompt received");
                        return Ok(());
                    }
                },
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::HandshakeFailed(format!(
            "no bootloader prompt within {:?}",
            self.prompt_timeout
        )))
    }

    fn select<P: Read + Write>(&self, port: &mut P, key: u8) -> Result<()> {
        self.wait_prompt(port)?;
        port.write_all(&[key])?;
        port.flush()?;
        Ok(())
    }
}

impl BootloaderLink for MenuLink {
    fn start<P: Read + Write>(&mut self, port: &mut P) -> Result<()> {
        self.select(port, Self::UPLOAD)
    }

    fn reboot<P: Read + Write>(&mut self, port: &mut P) -> Result<()> {
        self.select(port, Self::RUN)
    }
}

/// Emits a percentage each time progress advances by at least `step`.
#[derive(Debug, Clone)]
pub struct PercentageReporter {
    step: u8,
    last: Option<u8>,
}

impl Default for PercentageReporter {
    fn default() -> Self {
        Self::new(PERCENTAGE_UPDATE)
    }
}

impl PercentageReporter {
    /// Reporter printing every `step` percent.
    pub fn new(step: u8) -> Self {
        Self { step, last: None }
    }

    /// Feed progress; returns the percentage when it should be shown.
    pub fn update(&mut self, done: u64, total: u64) -> Option<u8> {
        let percent = if total == 0 {
            0
        } else if done >= total {
            100
        } else {
            (done * 100 / total) as u8
        };
        let due = match self.last {
            None => true,
            Some(last) => percent >= self.step && percent >= last.saturating_add(self.step),
        };
        if due {
            self.last = Some(percent);
            Some(percent)
        } else {
            None
        }
    }
}

/// Resolve `length`, expanding [`WHOLE_FILE`] against the file size.
pub fn resolve_length(file_size: u64, offset: u32, length: u32) -> Result<u32> {
    if u64::from(offset) > file_size {
        return Err(Error::InvalidImage(format!(
            "offset {offset:#x} is past the end of the {file_size}-byte file"
        )));
    }
    if length != WHOLE_FILE {
        return Ok(length);
    }
    u32::try_from(file_size - u64::from(offset))
        .map_err(|_| Error::InvalidImage(format!("file of {file_size} bytes is too large")))
}

/// Bootload `length` bytes of `path` starting at `offset`.
///
/// The link is always asked to reboot the device after the transfer, and the
/// call fails if either the transfer or the reboot failed.
pub fn bootload_image<L, P>(
    link: &mut L,
    port: &mut P,
    path: impl AsRef<Path>,
    offset: u32,
    length: u32,
    options: &BootloadOptions,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()>
where
    L: BootloaderLink,
    P: Read + Write,
{
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let length = resolve_length(file.metadata()?.len(), offset, length)?;

    info!("Starting bootloader communications");
    link.start(port)?;

    info!(
        "Transferring {} bytes ({:#x}..{:#x}) of {} over {}",
        length,
        offset,
        u64::from(offset) + u64::from(length),
        path.display(),
        options.protocol
    );
    let transferred = transfer(port, &mut file, offset, length, options, progress);
    if let Err(e) = &transferred {
        warn!("Transfer failed: {e}");
    } else {
        info!("Transfer completed");
    }

    let rebooted = reboot(link, port, options);
    if let Err(e) = &rebooted {
        warn!("Reboot failed: {e}");
    }
    transferred.and(rebooted)
}

fn reboot<L: BootloaderLink, P: Read + Write>(
    link: &mut L,
    port: &mut P,
    options: &BootloadOptions,
) -> Result<()> {
    let reset = match options.protocol {
        TransferProtocol::Bgapi => DfuClient::new(port).reset(),
        TransferProtocol::Xmodem => Ok(()),
    };
    let rebooted = link.reboot(port);
    reset.and(rebooted)
}

fn transfer<P: Read + Write>(
    port: &mut P,
    file: &mut File,
    offset: u32,
    length: u32,
    options: &BootloadOptions,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let total = u64::from(length);
    if total == 0 {
        debug!("Empty slice, nothing to send");
        return Ok(());
    }
    file.seek(SeekFrom::Start(u64::from(offset)))?;
    let mut reader = file.take(total);
    let mut block = [0u8; TRANSFER_BLOCK_SIZE];
    let mut sent = 0u64;
    progress(0, total);

    match options.protocol {
        TransferProtocol::Xmodem => {
            let mut xmodem = XmodemSender::with_config(port, options.xmodem.clone());
            xmodem.init(options.start_immediately);
            while sent < total {
                let len = (total - sent).min(TRANSFER_BLOCK_SIZE as u64) as usize;
                read_block(&mut reader, &mut block[..len], u64::from(offset) + sent)?;
                sent += len as u64;
                xmodem.send_data(&block[..len], sent == total)?;
                progress(sent, total);
            }
        },
        TransferProtocol::Bgapi => {
            let mut client = DfuClient::new(port);
            let version = client.enter_dfu()?;
            info!("DFU bootloader version {version}");
            client.set_address(0)?;
            while sent < total {
                let len = (total - sent).min(TRANSFER_BLOCK_SIZE as u64) as usize;
                read_block(&mut reader, &mut block[..len], u64::from(offset) + sent)?;
                client.upload(&block[..len])?;
                sent += len as u64;
                progress(sent, total);
            }
            client.finish()?;
        },
    }
    Ok(())
}

fn read_block<R: Read>(reader: &mut R, buf: &mut [u8], at: u64) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::InvalidImage(format!("image ends before offset {at:#x} + {}", buf.len()))
            },
            _ => Error::Io(e),
        })
}
