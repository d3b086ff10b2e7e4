//! Installing an image staged in upper flash.
//!
//! An over-the-air update writes the new application somewhere above the
//! running one. At the next reset the bootloader looks for it page by page,
//! copies it over the application area if its CRC holds, and erases the
//! staged table so the copy happens once.

use crate::dfu::flash::FlashDevice;
use crate::error::Result;
use crate::image::aat::{self, Aat, AAT_SIZE};
use log::{debug, info, warn};

/// Result of [`install_staged_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaOutcome {
    /// No staged application image was found.
    NothingStaged,
    /// The staged image was copied over the application.
    Installed {
        /// Address of the staged table.
        source: u32,
        /// Bytes copied.
        length: u32,
    },
    /// The staged image failed its CRC check and was discarded.
    Discarded {
        /// Address of the staged table.
        source: u32,
    },
}

/// Look for a staged application image and install it.
pub fn install_staged_image<F: FlashDevice + ?Sized>(flash: &mut F) -> Result<OtaOutcome> {
    let page_size = flash.page_size();
    let window = flash.valid_range();
    let base = window.start;

    let mut source = base + page_size;
    while source + AAT_SIZE as u32 <= window.end {
        let table = Aat::read_from(flash, source)?;
        let range = table.primary_range();
        if !table.is_application() || u32::from(range.first) * page_size != base {
            source += page_size;
            continue;
        }

        debug!("Staged image table at {source:#x}, pages {}..={}", range.first, range.last);
        let length = (u32::from(range.last) * page_size + page_size).checked_sub(base);
        let outcome = match (aat::verify_image_crc(flash, source), length) {
            (Ok(_), Some(length)) if length > 0 => {
                copy_pages(flash, source, base, length)?;
                info!("Installed staged image from {source:#x} ({length} bytes)");
                OtaOutcome::Installed { source, length }
            },
            (Ok(_), _) => {
                warn!(
                    "Staged image at {source:#x} discarded: page range {}..={} is empty",
                    range.first, range.last
                );
                OtaOutcome::Discarded { source }
            },
            (Err(e), _) => {
                warn!("Staged image at {source:#x} discarded: {e}");
                OtaOutcome::Discarded { source }
            },
        };
        flash.erase_page(source)?;
        return Ok(outcome);
    }

    Ok(OtaOutcome::NothingStaged)
}

fn copy_pages<F: FlashDevice + ?Sized>(flash: &mut F, src: u32, dst: u32, length: u32) -> Result<()> {
    let page_size = flash.page_size();
    let mut page = vec![0u8; page_size as usize];
    let mut offset = 0;
    while offset < length {
        let len = (length - offset).min(page_size) as usize;
        flash.read(src + offset, &mut page[..len])?;
        flash.erase_page(dst + offset)?;
        flash.write_block(dst + offset, &page[..len])?;
        offset += page_size;
    }
    Ok(())
}
