//! Serial command loop of the UART DFU bootloader.

use crate::dfu::flash::FlashDevice;
use crate::dfu::session::{BootDecision, DfuSession, Reply};
use crate::error::Result;
use crate::protocol::bgapi::{self, BOOTLOADER_VERSION, DfuCommand, DfuEvent, result};
use log::{debug, trace};
use std::io::{Read, Write};

/// What [`serve_once`] did with the packet it read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    /// A DFU command was handled and answered.
    Handled(Reply),
    /// The command requests an MCU reset; nothing was sent.
    SystemReset,
    /// The packet was not a DFU command and was dropped.
    Ignored,
}

/// Read one command from `port`, dispatch it and write the reply.
pub fn serve_once<P, F>(port: &mut P, session: &mut DfuSession<F>) -> Result<ServeOutcome>
where
    P: Read + Write + ?Sized,
    F: FlashDevice,
{
    let packet = bgapi::read_command(port)?;
    let Some(command) = DfuCommand::from_packet(&packet)? else {
        trace!(
            "Ignoring class {:#04x} method {:#04x}",
            packet.header.class, packet.header.method
        );
        return Ok(ServeOutcome::Ignored);
    };

    let reply = session.handle(&command);
    match reply.to_packet()? {
        Some(out) => {
            out.write_to(port)?;
            Ok(ServeOutcome::Handled(reply))
        },
        None => {
            debug!("System reset requested");
            Ok(ServeOutcome::SystemReset)
        },
    }
}

/// Send the event that announces a boot decision.
///
/// Staying in the bootloader sends `dfu_boot`; a failed image check sends
/// `dfu_boot_failure`. A jump sends nothing.
pub fn announce<P: Write + ?Sized>(port: &mut P, decision: &BootDecision) -> Result<()> {
    let event = match decision {
        BootDecision::StayInBootloader => DfuEvent::Boot {
            version: BOOTLOADER_VERSION,
        },
        BootDecision::ChecksumFailure => DfuEvent::BootFailure {
            reason: result::IMAGE_CHECKSUM_ERROR,
        },
        BootDecision::Jump(_) => return Ok(()),
    };
    event
        .to_packet()?
        .write_to(port)
}
