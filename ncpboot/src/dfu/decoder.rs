//! Incremental EBL decoder driving flash programming.
//!
//! Upload chunks arrive in arbitrary sizes. The decoder stages them in a
//! bounded queue, walks the record stream and programs flash as soon as
//! program data is available, so a whole image never needs to be buffered.
//!
//! Record handling:
//!
//! | Record               | Action                                           |
//! |----------------------|--------------------------------------------------|
//! | Header               | 12-byte body, sets the upload pointer            |
//! | EraseProg            | 4-byte address, then data programmed at it      |
//! | End                  | marks the stream complete, body skipped          |
//! | anything else        | skipped, including legacy Prog                   |
//!
//! Program data is flushed in multiples of four bytes except for the tail of
//! a record. Each page is erased before its first write in a session.
//! Writes that fall outside the flash device's programmable window are
//! dropped, the upload pointer still advances, and the dropped byte count is
//! kept in [`EblDecoder::out_of_range_bytes`].

use crate::dfu::flash::FlashDevice;
use crate::error::{Error, Result};
use crate::image::ebl::{
    EblTag, HEADER_ADDRESS_OFFSET, HEADER_BODY_SIZE, PROGRAM_ADDRESS_SIZE, TAG_LENGTH_SIZE,
};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};
use std::collections::VecDeque;

/// Flash writes are aligned to this many bytes, except a record's tail.
const WRITE_ALIGN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Reading the Header body.
    AwaitHeader,
    /// Reading a program record's address.
    AwaitAddress,
    /// Streaming program data to flash.
    AwaitFlashData,
    /// Dropping the rest of the record.
    Pass,
}

/// Outcome of one [`EblDecoder::feed`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    /// Bytes programmed into flash.
    pub programmed: usize,
    /// Program bytes dropped because they fell outside the writable window.
    pub skipped: usize,
    /// Bytes still staged, waiting for the rest of a field.
    pub pending: usize,
    /// An End record has been seen.
    pub end_seen: bool,
}

/// Streaming EBL decoder bound to one upload session.
#[derive(Debug, Clone)]
pub struct EblDecoder {
    tag: EblTag,
    remaining: i32,
    stage: Stage,
    staging: VecDeque<u8>,
    capacity: usize,
    upload_pointer: u32,
    previous_erased_page: Option<u32>,
    out_of_range_bytes: u64,
    programmed_bytes: u64,
    end_seen: bool,
}

impl EblDecoder {
    /// Decoder whose staging queue holds two flash pages.
    pub fn new(page_size: u32) -> Self {
        Self::with_capacity(2 * page_size as usize)
    }

    /// Decoder with an explicit staging capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tag: EblTag::Unknown(0),
            remaining: 0,
            stage: Stage::Pass,
            staging: VecDeque::with_capacity(capacity),
            capacity,
            upload_pointer: 0,
            previous_erased_page: None,
            out_of_range_bytes: 0,
            programmed_bytes: 0,
            end_seen: false,
        }
    }

    /// Current upload pointer.
    pub fn upload_pointer(&self) -> u32 {
        self.upload_pointer
    }

    /// Tag of the record being decoded.
    pub fn current_tag(&self) -> EblTag {
        self.tag
    }

    /// Bytes of the current record not yet consumed.
    pub fn remaining(&self) -> i32 {
        self.remaining
    }

    /// Bytes waiting in the staging queue.
    pub fn pending(&self) -> usize {
        self.staging.len()
    }

    /// Staging queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Program bytes dropped for falling outside the writable window.
    pub fn out_of_range_bytes(&self) -> u64 {
        self.out_of_range_bytes
    }

    /// Program bytes written to flash so far.
    pub fn programmed_bytes(&self) -> u64 {
        self.programmed_bytes
    }

    /// Whether an End record has been decoded.
    pub fn end_seen(&self) -> bool {
        self.end_seen
    }

    /// Stage `bytes` and decode as far as the buffered data allows.
    ///
    /// A chunk that does not fit in the staging queue is rejected whole with
    /// [`Error::BuffersFull`] and leaves the decoder unchanged.
    pub fn feed<F: FlashDevice + ?Sized>(&mut self, flash: &mut F, bytes: &[u8]) -> Result<FeedReport> {
        if self.staging.len() + bytes.len() > self.capacity {
            return Err(Error::BuffersFull {
                buffered: self.staging.len(),
                incoming: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.staging
            .extend(bytes.iter().copied());

        let mut report = FeedReport::default();
        while !self.staging.is_empty() {
            if self.remaining <= 0 && !self.open_record() {
                break;
            }

            match self.stage {
                Stage::AwaitHeader => {
                    if self.staging.len() < HEADER_BODY_SIZE {
                        break;
                    }
                    let body: Vec<u8> = self
                        .staging
                        .drain(..HEADER_BODY_SIZE)
                        .collect();
                    self.upload_pointer = BigEndian::read_u32(&body[HEADER_ADDRESS_OFFSET..]);
                    self.remaining -= HEADER_BODY_SIZE as i32;
                    self.stage = Stage::AwaitFlashData;
                    debug!("EBL header: upload pointer {:#010x}", self.upload_pointer);
                },
                Stage::AwaitAddress => {
                    if self.staging.len() < PROGRAM_ADDRESS_SIZE {
                        break;
                    }
                    let address: Vec<u8> = self
                        .staging
                        .drain(..PROGRAM_ADDRESS_SIZE)
                        .collect();
                    self.upload_pointer = BigEndian::read_u32(&address);
                    self.remaining -= PROGRAM_ADDRESS_SIZE as i32;
                    self.stage = Stage::AwaitFlashData;
                    trace!(
                        "{} record: {} bytes at {:#010x}",
                        self.tag.name(),
                        self.remaining,
                        self.upload_pointer
                    );
                },
                Stage::AwaitFlashData => {
                    let remaining = self.remaining as usize;
                    let mut len = self.staging.len().min(remaining);
                    if len % WRITE_ALIGN != 0 && len != remaining {
                        len -= len % WRITE_ALIGN;
                    }
                    if len == 0 {
                        break;
                    }
                    self.flush(flash, len, &mut report)?;
                },
                Stage::Pass => {
                    let len = self
                        .staging
                        .len()
                        .min(self.remaining as usize);
                    self.staging.drain(..len);
                    self.remaining -= len as i32;
                },
            }
        }

        report.pending = self.staging.len();
        report.end_seen = self.end_seen;
        Ok(report)
    }

    /// Parse the next tag/length prefix. Returns `false` if it is not fully
    /// buffered yet.
    fn open_record(&mut self) -> bool {
        if self.staging.len() < TAG_LENGTH_SIZE {
            return false;
        }
        let prefix: Vec<u8> = self
            .staging
            .drain(..TAG_LENGTH_SIZE)
            .collect();
        self.tag = EblTag::from_u16(BigEndian::read_u16(&prefix[..2]));
        self.remaining = i32::from(BigEndian::read_u16(&prefix[2..]));
        self.stage = match self.tag {
            EblTag::Header => Stage::AwaitHeader,
            EblTag::EraseProg => Stage::AwaitAddress,
            EblTag::End => {
                self.end_seen = true;
                debug!("EBL end record");
                Stage::Pass
            },
            _ => Stage::Pass,
        };
        trace!(
            "EBL record {} ({:#06x}), {} bytes",
            self.tag.name(),
            self.tag.as_u16(),
            self.remaining
        );
        true
    }

    /// Program `len` staged bytes at the upload pointer, page by page.
    fn flush<F: FlashDevice + ?Sized>(
        &mut self,
        flash: &mut F,
        len: usize,
        report: &mut FeedReport,
    ) -> Result<()> {
        let data: Vec<u8> = self
            .staging
            .drain(..len)
            .collect();
        let window = flash.valid_range();
        let page_size = u64::from(flash.page_size());

        let mut offset = 0;
        while offset < len {
            let address = self
                .upload_pointer
                .wrapping_add(offset as u32);
            let page = flash.page_base(address);
            let to_page_end = (u64::from(page) + page_size - u64::from(address)) as usize;
            let segment = (len - offset).min(to_page_end);

            if window.contains(&address) {
                if self.previous_erased_page != Some(page) {
                    trace!("Erasing page {page:#010x}");
                    flash.erase_page(page)?;
                    self.previous_erased_page = Some(page);
                }
                flash.write_block(address, &data[offset..offset + segment])?;
                report.programmed += segment;
                self.programmed_bytes += segment as u64;
            } else {
                warn!(
                    "Dropping {segment} bytes at {address:#010x}: outside writable flash {:#x}..{:#x}",
                    window.start, window.end
                );
                report.skipped += segment;
                self.out_of_range_bytes += segment as u64;
            }
            offset += segment;
        }

        self.upload_pointer = self
            .upload_pointer
            .wrapping_add(len as u32);
        self.remaining -= len as i32;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dfu::flash::MemFlash;
    use crate::image::ebl::{encode_record, header_body, program_payload};

    pub(crate) const PAGE: u32 = 0x800;
    pub(crate) const BOOTLOADER: u32 = 0x4000;
    pub(crate) const FLASH: u32 = 0x10000;

    pub(crate) fn flash() -> MemFlash {
        MemFlash::new(FLASH, PAGE, BOOTLOADER).unwrap()
    }

    /// EBL stream programming `data` at `address` in records of at most
    /// `record_size` bytes.
    pub(crate) fn ebl_image(address: u32, data: &[u8], record_size: usize) -> Vec<u8> {
        let mut image = encode_record(EblTag::Header, &header_body(address)).unwrap();
        let mut at = address;
        for chunk in data.chunks(record_size) {
            image.extend(encode_record(EblTag::EraseProg, &program_payload(at, chunk)).unwrap());
            at += chunk.len() as u32;
        }
        image.extend(encode_record(EblTag::End, &[]).unwrap());
        image
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i * 13 + 7) as u8)
            .collect()
    }

    fn feed_in_chunks(image: &[u8], chunk: usize) -> (MemFlash, EblDecoder) {
        let mut flash = flash();
        let mut decoder = EblDecoder::new(PAGE);
        for part in image.chunks(chunk) {
            decoder
                .feed(&mut flash, part)
                .unwrap();
        }
        (flash, decoder)
    }

    #[test]
    fn test_programs_data_at_record_address() {
        let data = pattern(1000);
        let image = ebl_image(0x4000, &data, 250);
        let (flash, decoder) = feed_in_chunks(&image, 128);

        assert_eq!(&flash.as_bytes()[0x4000..0x4000 + 1000], &data[..]);
        assert_eq!(flash.as_bytes()[0x4000 + 1000], 0xFF);
        assert_eq!(decoder.upload_pointer(), 0x4000 + 1000);
        assert_eq!(decoder.programmed_bytes(), 1000);
        assert!(decoder.end_seen());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_flash_contents() {
        let data = pattern(3 * PAGE as usize + 37);
        let image = ebl_image(0x4100, &data, 301);

        let (reference, _) = feed_in_chunks(&image, 1);
        for chunk in [2, 3, 5, 64, 128, 255, 1024] {
            let (flash, decoder) = feed_in_chunks(&image, chunk);
            assert_eq!(flash.as_bytes(), reference.as_bytes(), "chunk size {chunk}");
            assert!(decoder.end_seen());
        }

        let mut whole = flash();
        let mut decoder = EblDecoder::with_capacity(image.len());
        decoder
            .feed(&mut whole, &image)
            .unwrap();
        assert_eq!(whole.as_bytes(), reference.as_bytes());
    }

    #[test]
    fn test_each_page_erased_once() {
        let mut flash = flash();
        flash
            .load(0x4000, &[0u8; 3 * PAGE as usize])
            .unwrap();
        let data = pattern(3 * PAGE as usize);
        let image = ebl_image(0x4000, &data, 200);

        let mut decoder = EblDecoder::new(PAGE);
        for part in image.chunks(17) {
            decoder
                .feed(&mut flash, part)
                .unwrap();
        }

        let stats = flash.stats();
        assert_eq!(stats.erase_requests, 3);
        assert_eq!(stats.erases, 3);
        assert_eq!(flash.erased_pages(), &[0x4000, 0x4800, 0x5000]);
        assert_eq!(&flash.as_bytes()[0x4000..0x5800], &data[..]);
    }

    #[test]
    fn test_writes_below_bootloader_are_dropped() {
        let data = pattern(64);
        let image = ebl_image(0x1000, &data, 64);
        let (flash, decoder) = feed_in_chunks(&image, 32);

        let stats = flash.stats();
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.erase_requests, 0);
        assert_eq!(decoder.upload_pointer(), 0x1000 + 64);
        assert_eq!(decoder.out_of_range_bytes(), 64);
        assert!(flash.as_bytes().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_writes_past_flash_end_are_dropped() {
        let data = pattern(32);
        let image = ebl_image(FLASH, &data, 32);
        let (flash, decoder) = feed_in_chunks(&image, 40);
        assert_eq!(flash.stats().writes, 0);
        assert_eq!(decoder.out_of_range_bytes(), 32);
        assert_eq!(decoder.upload_pointer(), FLASH + 32);
    }

    #[test]
    fn test_write_straddling_bootloader_boundary_is_split() {
        let data = pattern(16);
        let image = ebl_image(BOOTLOADER - 8, &data, 16);
        let (flash, decoder) = feed_in_chunks(&image, 64);

        assert_eq!(decoder.out_of_range_bytes(), 8);
        assert_eq!(&flash.as_bytes()[BOOTLOADER as usize..BOOTLOADER as usize + 8], &data[8..]);
        assert_eq!(flash.as_bytes()[BOOTLOADER as usize - 1], 0xFF);
    }

    #[test]
    fn test_unknown_and_encrypted_records_are_skipped() {
        let mut image = encode_record(EblTag::Header, &header_body(0x4000)).unwrap();
        image.extend(encode_record(EblTag::Metadata, &[1; 40]).unwrap());
        image.extend(encode_record(EblTag::EncEblData, &[2; 90]).unwrap());
        image.extend(encode_record(EblTag::MfgProg, &program_payload(0x4000, &[3; 8])).unwrap());
        image.extend(encode_record(EblTag::Unknown(0x1234), &[4; 3]).unwrap());
        image.extend(encode_record(EblTag::End, &[]).unwrap());

        let (flash, decoder) = feed_in_chunks(&image, 7);
        assert_eq!(flash.stats().writes, 0);
        assert!(decoder.end_seen());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_legacy_prog_record_is_skipped() {
        let mut image = encode_record(EblTag::Header, &header_body(0x4000)).unwrap();
        image.extend(encode_record(EblTag::Prog, &program_payload(0x4800, &[0xA5; 12])).unwrap());
        image.extend(encode_record(EblTag::End, &[]).unwrap());
        let (flash, decoder) = feed_in_chunks(&image, 5);
        assert_eq!(flash.stats().writes, 0);
        assert_eq!(flash.stats().erase_requests, 0);
        assert!(flash.as_bytes()[0x4800..0x480C].iter().all(|&b| b == 0xFF));
        assert_eq!(decoder.programmed_bytes(), 0);
        assert!(decoder.end_seen());
    }

    #[test]
    fn test_header_record_alone_does_not_erase() {
        let image = encode_record(EblTag::Header, &header_body(0x4000)).unwrap();
        let (flash, decoder) = feed_in_chunks(&image, 3);
        assert_eq!(flash.stats().erase_requests, 0);
        assert_eq!(decoder.upload_pointer(), 0x4000);
    }

    #[test]
    fn test_partial_prefix_waits_for_more_input() {
        let image = ebl_image(0x4000, &pattern(8), 8);
        let mut flash = flash();
        let mut decoder = EblDecoder::new(PAGE);

        let report = decoder
            .feed(&mut flash, &image[..3])
            .unwrap();
        assert_eq!(report.pending, 3);
        assert_eq!(report.programmed, 0);

        let report = decoder
            .feed(&mut flash, &image[3..])
            .unwrap();
        assert_eq!(report.programmed, 8);
        assert!(report.end_seen);
    }

    #[test]
    fn test_unaligned_data_waits_for_word_or_record_end() {
        let image = ebl_image(0x4000, &pattern(10), 10);
        let mut flash = flash();
        let mut decoder = EblDecoder::new(PAGE);

        // Header (16) + EraseProg prefix and address (8) + 6 data bytes.
        let report = decoder
            .feed(&mut flash, &image[..30])
            .unwrap();
        assert_eq!(report.programmed, 4);
        assert_eq!(report.pending, 2);

        let report = decoder
            .feed(&mut flash, &image[30..34])
            .unwrap();
        assert_eq!(report.programmed, 6);
        assert_eq!(decoder.upload_pointer(), 0x4000 + 10);
    }

    #[test]
    fn test_overflow_rejects_chunk_without_side_effects() {
        let mut flash = flash();
        let mut decoder = EblDecoder::with_capacity(8);
        decoder
            .feed(&mut flash, &[0x00, 0x00])
            .unwrap();

        let err = decoder
            .feed(&mut flash, &[0u8; 7])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BuffersFull {
                buffered: 2,
                incoming: 7,
                capacity: 8
            }
        ));
        assert_eq!(decoder.pending(), 2);
        assert!(
            decoder
                .feed(&mut flash, &[0u8; 6])
                .is_ok()
        );
    }

    #[test]
    fn test_flash_failure_propagates() {
        let mut flash = flash();
        flash.set_write_protected(true);
        let mut decoder = EblDecoder::new(PAGE);
        let image = ebl_image(0x4000, &pattern(16), 16);
        assert!(matches!(decoder.feed(&mut flash, &image), Err(Error::Flash(_))));
    }
}
