//! DFU command dispatcher and boot decision.

use crate::dfu::decoder::{EblDecoder, FeedReport};
use crate::dfu::flash::FlashDevice;
use crate::error::Error;
use crate::image::aat::{self, Aat};
use crate::protocol::bgapi::{BOOTLOADER_VERSION, DfuCommand, DfuEvent, Packet, method, response, result};
use log::{debug, info, warn};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Bootloader idle, waiting for `flash_set_address`.
    AwaitCommands,
    /// Upload in progress.
    ActiveUpload,
    /// Last `flash_upload_finish` validated the image.
    Validated,
    /// Last `flash_upload_finish` found a bad image.
    Rejected,
}

/// What the platform should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send a command response with this result code.
    Response {
        /// Method being answered.
        method: u8,
        /// BGAPI result code.
        result: u16,
    },
    /// Send an event.
    Event(DfuEvent),
    /// Reset the MCU; nothing is sent.
    SystemReset,
}

impl Reply {
    /// Packet to put on the wire, if any.
    pub fn to_packet(&self) -> crate::Result<Option<Packet>> {
        match self {
            Self::Response { method, result } => response(*method, *result).map(Some),
            Self::Event(event) => event.to_packet().map(Some),
            Self::SystemReset => Ok(None),
        }
    }
}

/// Register values the platform loads when starting the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handoff {
    /// Initial main stack pointer.
    pub stack_pointer: u32,
    /// Application entry point.
    pub reset_vector: u32,
    /// Vector table base for VTOR.
    pub vector_table: u32,
}

/// Outcome of [`DfuSession::boot_decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// Stay in the bootloader and announce it with `dfu_boot`.
    StayInBootloader,
    /// Image failed validation; announce `dfu_boot_failure` and keep serving.
    ChecksumFailure,
    /// Start the application.
    Jump(Handoff),
}

/// One bootloader session over a flash device.
pub struct DfuSession<F: FlashDevice> {
    flash: F,
    decoder: Option<EblDecoder>,
    state: SessionState,
    last_report: FeedReport,
}

impl<F: FlashDevice> DfuSession<F> {
    /// Start a session owning `flash`.
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            decoder: None,
            state: SessionState::AwaitCommands,
            last_report: FeedReport::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Flash device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Flash device, mutably.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Give the flash device back.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Decoder of the running upload.
    pub fn decoder(&self) -> Option<&EblDecoder> {
        self.decoder.as_ref()
    }

    /// Report of the most recent accepted chunk.
    pub fn last_report(&self) -> FeedReport {
        self.last_report
    }

    /// Start of the application image.
    pub fn application_base(&self) -> u32 {
        self.flash.valid_range().start
    }

    /// Whether the bootloader is expected to stay up (upload started).
    pub fn is_active(&self) -> bool {
        self.state != SessionState::AwaitCommands
    }

    /// Dispatch one command.
    pub fn handle(&mut self, command: &DfuCommand) -> Reply {
        debug!("Handling {}", command.name());
        match command {
            DfuCommand::FlashSetAddress(address) => {
                debug!("Upload started (address field {address:#x})");
                self.decoder = Some(EblDecoder::new(self.flash.page_size()));
                self.last_report = FeedReport::default();
                self.state = SessionState::ActiveUpload;
                Self::respond(method::FLASH_SET_ADDRESS, result::SUCCESS)
            },
            DfuCommand::FlashUpload(data) => {
                let code = self.upload(data);
                Self::respond(method::FLASH_UPLOAD, code)
            },
            DfuCommand::FlashUploadFinish => {
                let code = self.finish();
                Self::respond(method::FLASH_UPLOAD_FINISH, code)
            },
            DfuCommand::Reset { dfu: true } => {
                self.decoder = None;
                self.state = SessionState::AwaitCommands;
                Reply::Event(DfuEvent::Boot {
                    version: BOOTLOADER_VERSION,
                })
            },
            DfuCommand::Reset { dfu: false } => Reply::SystemReset,
        }
    }

    fn respond(method: u8, result: u16) -> Reply {
        Reply::Response { method, result }
    }

    fn upload(&mut self, data: &[u8]) -> u16 {
        // An upload without flash_set_address starts a fresh stream.
        self.state = SessionState::ActiveUpload;
        let page_size = self.flash.page_size();
        let decoder = self
            .decoder
            .get_or_insert_with(|| EblDecoder::new(page_size));

        match decoder.feed(&mut self.flash, data) {
            Ok(report) => {
                self.last_report = report;
                result::SUCCESS
            },
            Err(e @ Error::BuffersFull { .. }) => {
                warn!("{e}");
                result::BUFFERS_FULL
            },
            Err(e) => {
                warn!("Upload chunk failed: {e}");
                result::HARDWARE
            },
        }
    }

    fn finish(&mut self) -> u16 {
        let base = self.application_base();
        match aat::verify_image_crc(&self.flash, base) {
            Ok(aat) => {
                info!(
                    "Image '{}' at {base:#x} validated (crc {:#010x})",
                    aat.image_name(),
                    aat.image_crc
                );
                self.state = SessionState::Validated;
                result::SUCCESS
            },
            Err(e) => {
                warn!("Image at {base:#x} rejected: {e}");
                self.state = SessionState::Rejected;
                result::IMAGE_CHECKSUM_ERROR
            },
        }
    }

    /// Decide what to do after reset.
    ///
    /// `force_dfu` covers the platform reasons to stay in the bootloader
    /// (hardware reset, requested software reset).
    pub fn boot_decision(&self, force_dfu: bool) -> BootDecision {
        let base = self.application_base();
        let first_word = self
            .flash
            .read_u32(base)
            .unwrap_or(0xFFFF_FFFF);
        if force_dfu || first_word == 0xFFFF_FFFF {
            debug!("Staying in bootloader (forced: {force_dfu}, first word {first_word:#010x})");
            return BootDecision::StayInBootloader;
        }

        let table = match Aat::read_from(&self.flash, base) {
            Ok(table) => table,
            Err(e) => {
                warn!("Cannot read address table at {base:#x}: {e}");
                return BootDecision::ChecksumFailure;
            },
        };

        if table.is_factory_image() {
            debug!("Factory image, skipping CRC check");
        } else if let Err(e) = aat::verify_image_crc(&self.flash, base) {
            warn!("Boot image check failed: {e}");
            return BootDecision::ChecksumFailure;
        }

        BootDecision::Jump(Handoff {
            stack_pointer: table.top_of_stack,
            reset_vector: table.reset_vector,
            vector_table: table.vector_table,
        })
    }

    /// Whether the application reset vector points into flash.
    pub fn firmware_is_valid(&self) -> bool {
        let flash_end = self.flash.valid_range().end;
        self.flash
            .read_u32(self.application_base() + 4)
            .is_ok_and(|reset| reset < flash_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::decoder::tests::{BOOTLOADER, PAGE, ebl_image, flash};
    use crate::dfu::flash::MemFlash;
    use crate::image::aat::tests::build_image;
    use crate::image::aat::{IMAGE_CRC_MAGIC, IMAGE_TIMESTAMP_MAGIC};

    fn upload_image(session: &mut DfuSession<MemFlash>, ebl: &[u8]) -> Vec<Reply> {
        let mut replies = vec![session.handle(&DfuCommand::FlashSetAddress(0))];
        for chunk in ebl.chunks(128) {
            replies.push(session.handle(&DfuCommand::FlashUpload(chunk.to_vec())));
        }
        replies.push(session.handle(&DfuCommand::FlashUploadFinish));
        replies
    }

    fn ok(method: u8) -> Reply {
        Reply::Response {
            method,
            result: result::SUCCESS,
        }
    }

    #[test]
    fn test_end_to_end_upload_validates() {
        let image = build_image(PAGE, (BOOTLOADER / PAGE) as u8, (BOOTLOADER / PAGE) as u8 + 2, 11);
        let ebl = ebl_image(BOOTLOADER, &image, 200);
        let mut session = DfuSession::new(flash());

        let replies = upload_image(&mut session, &ebl);
        assert_eq!(replies[0], ok(method::FLASH_SET_ADDRESS));
        assert!(replies[1..replies.len() - 1]
            .iter()
            .all(|r| *r == ok(method::FLASH_UPLOAD)));
        assert_eq!(replies.last(), Some(&ok(method::FLASH_UPLOAD_FINISH)));
        assert_eq!(session.state(), SessionState::Validated);

        let start = BOOTLOADER as usize;
        assert_eq!(&session.flash().as_bytes()[start..start + image.len()], &image[..]);
        assert!(session.firmware_is_valid());

        match session.boot_decision(false) {
            BootDecision::Jump(handoff) => {
                assert_eq!(handoff.stack_pointer, 0x2000_8000);
                assert_eq!(handoff.reset_vector, 0x0000_4101);
                assert_eq!(handoff.vector_table, 0x0000_4000);
            },
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_image_reports_checksum_error() {
        let first = (BOOTLOADER / PAGE) as u8;
        let mut image = build_image(PAGE, first, first + 1, 2);
        image[PAGE as usize + 100] ^= 0x40;
        let ebl = ebl_image(BOOTLOADER, &image, 128);
        let mut session = DfuSession::new(flash());

        let replies = upload_image(&mut session, &ebl);
        assert_eq!(
            replies.last(),
            Some(&Reply::Response {
                method: method::FLASH_UPLOAD_FINISH,
                result: result::IMAGE_CHECKSUM_ERROR,
            })
        );
        assert_eq!(session.state(), SessionState::Rejected);
        assert_eq!(session.boot_decision(false), BootDecision::ChecksumFailure);
    }

    #[test]
    fn test_oversized_chunk_reports_buffers_full() {
        let mut session = DfuSession::new(flash());
        session.handle(&DfuCommand::FlashSetAddress(0));
        let reply = session.handle(&DfuCommand::FlashUpload(vec![0; 2 * PAGE as usize + 1]));
        assert_eq!(
            reply,
            Reply::Response {
                method: method::FLASH_UPLOAD,
                result: result::BUFFERS_FULL,
            }
        );
        assert_eq!(session.decoder().map(EblDecoder::pending), Some(0));
    }

    #[test]
    fn test_flash_failure_reports_hardware_error() {
        let mut session = DfuSession::new(flash());
        session.flash_mut().set_write_protected(true);
        session.handle(&DfuCommand::FlashSetAddress(0));
        let ebl = ebl_image(BOOTLOADER, &[1, 2, 3, 4], 4);
        let reply = session.handle(&DfuCommand::FlashUpload(ebl));
        assert_eq!(
            reply,
            Reply::Response {
                method: method::FLASH_UPLOAD,
                result: result::HARDWARE,
            }
        );
    }

    #[test]
    fn test_reset_commands() {
        let mut session = DfuSession::new(flash());
        session.handle(&DfuCommand::FlashSetAddress(0));
        assert!(session.is_active());

        let reply = session.handle(&DfuCommand::Reset { dfu: true });
        assert_eq!(reply, Reply::Event(DfuEvent::Boot { version: 5 }));
        assert_eq!(session.state(), SessionState::AwaitCommands);
        assert!(session.decoder().is_none());

        let reply = session.handle(&DfuCommand::Reset { dfu: false });
        assert_eq!(reply, Reply::SystemReset);
        assert_eq!(reply.to_packet().unwrap(), None);
    }

    #[test]
    fn test_set_address_restarts_decoder() {
        let mut session = DfuSession::new(flash());
        session.handle(&DfuCommand::FlashSetAddress(0));
        session.handle(&DfuCommand::FlashUpload(vec![0x00, 0x00]));
        assert_eq!(session.decoder().map(EblDecoder::pending), Some(2));

        session.handle(&DfuCommand::FlashSetAddress(0));
        assert_eq!(session.decoder().map(EblDecoder::pending), Some(0));
    }

    #[test]
    fn test_boot_decision_stays_for_blank_or_forced() {
        let session = DfuSession::new(flash());
        assert_eq!(session.boot_decision(false), BootDecision::StayInBootloader);

        let first = (BOOTLOADER / PAGE) as u8;
        let mut flash = flash();
        flash
            .load(BOOTLOADER, &build_image(PAGE, first, first, 4))
            .unwrap();
        let session = DfuSession::new(flash);
        assert_eq!(session.boot_decision(true), BootDecision::StayInBootloader);
        assert!(matches!(session.boot_decision(false), BootDecision::Jump(_)));
    }

    #[test]
    fn test_factory_image_skips_crc() {
        let first = (BOOTLOADER / PAGE) as u8;
        let mut table = crate::image::aat::tests::sample_aat(first, first + 3);
        table.image_crc = IMAGE_CRC_MAGIC;
        table.timestamp = IMAGE_TIMESTAMP_MAGIC;
        let mut flash = flash();
        flash
            .load(BOOTLOADER, &table.to_bytes())
            .unwrap();
        let session = DfuSession::new(flash);
        assert!(matches!(session.boot_decision(false), BootDecision::Jump(_)));
    }
}
