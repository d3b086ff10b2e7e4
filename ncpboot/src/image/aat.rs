//! Application Address Table (AAT).
//!
//! The AAT is the 128-byte little-endian block at the start of an
//! application image. Its first four words double as the Cortex-M vector
//! table head, and it records the page span and CRC the bootloader verifies
//! before handing off.

use crate::dfu::flash::FlashDevice;
use crate::error::{Error, Result};
use crate::protocol::crc::{CRC32_START, crc32_fill, crc32_update};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the table in bytes.
pub const AAT_SIZE: usize = 128;

/// `type` value of an application image.
pub const APP_ADDRESS_TABLE_TYPE: u16 = 0x0AA7;
/// `type` value of a bootloader image.
pub const BOOTLOADER_ADDRESS_TABLE_TYPE: u16 = 0x0BA7;
/// `type` value of a RAM-executable image.
pub const RAMEXE_ADDRESS_TABLE_TYPE: u16 = 0x0EA7;

/// `image_crc` of a factory-installed image.
pub const IMAGE_CRC_MAGIC: u32 = 0xB173_6D20;
/// `timestamp` of a factory-installed image.
pub const IMAGE_TIMESTAMP_MAGIC: u32 = 0xACE1_35C3;

/// Number of page-range slots in the table.
pub const PAGE_RANGE_COUNT: usize = 6;

/// Unused page-range slots folded into the CRC as erased pages.
const UNUSED_PAGE_RANGES: usize = PAGE_RANGE_COUNT - 1;

mod offset {
    pub const TOP_OF_STACK: usize = 0;
    pub const RESET_VECTOR: usize = 4;
    pub const NMI_HANDLER: usize = 8;
    pub const HARD_FAULT_HANDLER: usize = 12;
    pub const TYPE: usize = 16;
    pub const VERSION: usize = 18;
    pub const VECTOR_TABLE: usize = 20;
    pub const PLAT_INFO: usize = 24;
    pub const MICRO_INFO: usize = 25;
    pub const PHY_INFO: usize = 26;
    pub const AAT_SIZE: usize = 27;
    pub const SOFTWARE_VERSION: usize = 28;
    pub const SOFTWARE_BUILD: usize = 30;
    pub const TIMESTAMP: usize = 32;
    pub const IMAGE_INFO: usize = 36;
    pub const IMAGE_CRC: usize = 68;
    pub const PAGE_RANGES: usize = 72;
    pub const SIMEE_BOTTOM: usize = 84;
    pub const CUSTOMER_APPLICATION_VERSION: usize = 88;
    pub const INTERNAL_STORAGE_BOTTOM: usize = 92;
    pub const IMAGE_STAMP: usize = 96;
    pub const FAMILY_INFO: usize = 104;
}

/// Inclusive range of flash page indices covered by an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PageRange {
    /// First page index.
    pub first: u8,
    /// Last page index.
    pub last: u8,
}

impl PageRange {
    /// Unpack the on-flash form: low byte first page, high byte last page.
    pub fn from_raw(raw: u16) -> Self {
        let [first, last] = raw.to_le_bytes();
        Self { first, last }
    }

    /// Pack back into the on-flash form.
    pub fn to_raw(self) -> u16 {
        u16::from_le_bytes([self.first, self.last])
    }

    /// Number of pages in the range (zero when inverted).
    pub fn page_count(self) -> u32 {
        if self.last < self.first {
            0
        } else {
            u32::from(self.last - self.first) + 1
        }
    }
}

/// Decoded Application Address Table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[allow(missing_docs)]
pub struct Aat {
    pub top_of_stack: u32,
    pub reset_vector: u32,
    pub nmi_handler: u32,
    pub hard_fault_handler: u32,
    pub image_type: u16,
    pub version: u16,
    pub vector_table: u32,
    pub plat_info: u8,
    pub micro_info: u8,
    pub phy_info: u8,
    pub aat_size: u8,
    pub software_version: u16,
    pub software_build: u16,
    pub timestamp: u32,
    pub image_info: [u8; 32],
    pub image_crc: u32,
    pub page_ranges: [PageRange; PAGE_RANGE_COUNT],
    pub simee_bottom: u32,
    pub customer_application_version: u32,
    pub internal_storage_bottom: u32,
    pub image_stamp: [u8; 8],
    pub family_info: u32,
}

impl Aat {
    /// Decode a table from the first [`AAT_SIZE`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < AAT_SIZE {
            return Err(Error::InvalidImage(format!(
                "application address table needs {AAT_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let u32_at = |o: usize| LittleEndian::read_u32(&bytes[o..o + 4]);
        let u16_at = |o: usize| LittleEndian::read_u16(&bytes[o..o + 2]);

        let mut image_info = [0u8; 32];
        image_info.copy_from_slice(&bytes[offset::IMAGE_INFO..offset::IMAGE_INFO + 32]);
        let mut image_stamp = [0u8; 8];
        image_stamp.copy_from_slice(&bytes[offset::IMAGE_STAMP..offset::IMAGE_STAMP + 8]);
        let mut page_ranges = [PageRange::default(); PAGE_RANGE_COUNT];
        for (i, range) in page_ranges
            .iter_mut()
            .enumerate()
        {
            *range = PageRange::from_raw(u16_at(offset::PAGE_RANGES + i * 2));
        }

        Ok(Self {
            top_of_stack: u32_at(offset::TOP_OF_STACK),
            reset_vector: u32_at(offset::RESET_VECTOR),
            nmi_handler: u32_at(offset::NMI_HANDLER),
            hard_fault_handler: u32_at(offset::HARD_FAULT_HANDLER),
            image_type: u16_at(offset::TYPE),
            version: u16_at(offset::VERSION),
            vector_table: u32_at(offset::VECTOR_TABLE),
            plat_info: bytes[offset::PLAT_INFO],
            micro_info: bytes[offset::MICRO_INFO],
            phy_info: bytes[offset::PHY_INFO],
            aat_size: bytes[offset::AAT_SIZE],
            software_version: u16_at(offset::SOFTWARE_VERSION),
            software_build: u16_at(offset::SOFTWARE_BUILD),
            timestamp: u32_at(offset::TIMESTAMP),
            image_info,
            image_crc: u32_at(offset::IMAGE_CRC),
            page_ranges,
            simee_bottom: u32_at(offset::SIMEE_BOTTOM),
            customer_application_version: u32_at(offset::CUSTOMER_APPLICATION_VERSION),
            internal_storage_bottom: u32_at(offset::INTERNAL_STORAGE_BOTTOM),
            image_stamp,
            family_info: u32_at(offset::FAMILY_INFO),
        })
    }

    /// Read and decode the table stored at `address`.
    pub fn read_from<F: FlashDevice + ?Sized>(flash: &F, address: u32) -> Result<Self> {
        let mut bytes = [0u8; AAT_SIZE];
        flash.read(address, &mut bytes)?;
        Self::parse(&bytes)
    }

    /// Encode the table into its 128-byte on-flash form.
    pub fn to_bytes(&self) -> [u8; AAT_SIZE] {
        let mut b = [0u8; AAT_SIZE];
        let mut put_u32 = |o: usize, v: u32| LittleEndian::write_u32(&mut b[o..o + 4], v);
        put_u32(offset::TOP_OF_STACK, self.top_of_stack);
        put_u32(offset::RESET_VECTOR, self.reset_vector);
        put_u32(offset::NMI_HANDLER, self.nmi_handler);
        put_u32(offset::HARD_FAULT_HANDLER, self.hard_fault_handler);
        put_u32(offset::VECTOR_TABLE, self.vector_table);
        put_u32(offset::TIMESTAMP, self.timestamp);
        put_u32(offset::IMAGE_CRC, self.image_crc);
        put_u32(offset::SIMEE_BOTTOM, self.simee_bottom);
        put_u32(offset::CUSTOMER_APPLICATION_VERSION, self.customer_application_version);
        put_u32(offset::INTERNAL_STORAGE_BOTTOM, self.internal_storage_bottom);
        put_u32(offset::FAMILY_INFO, self.family_info);

        LittleEndian::write_u16(&mut b[offset::TYPE..], self.image_type);
        LittleEndian::write_u16(&mut b[offset::VERSION..], self.version);
        LittleEndian::write_u16(&mut b[offset::SOFTWARE_VERSION..], self.software_version);
        LittleEndian::write_u16(&mut b[offset::SOFTWARE_BUILD..], self.software_build);
        for (i, range) in self
            .page_ranges
            .iter()
            .enumerate()
        {
            LittleEndian::write_u16(&mut b[offset::PAGE_RANGES + i * 2..], range.to_raw());
        }

        b[offset::PLAT_INFO] = self.plat_info;
        b[offset::MICRO_INFO] = self.micro_info;
        b[offset::PHY_INFO] = self.phy_info;
        b[offset::AAT_SIZE] = self.aat_size;
        b[offset::IMAGE_INFO..offset::IMAGE_INFO + 32].copy_from_slice(&self.image_info);
        b[offset::IMAGE_STAMP..offset::IMAGE_STAMP + 8].copy_from_slice(&self.image_stamp);
        b
    }

    /// Whether this is an application image table.
    pub fn is_application(&self) -> bool {
        self.image_type == APP_ADDRESS_TABLE_TYPE
    }

    /// Readable image type.
    pub fn image_type_name(&self) -> &'static str {
        match self.image_type {
            APP_ADDRESS_TABLE_TYPE => "application",
            BOOTLOADER_ADDRESS_TABLE_TYPE => "bootloader",
            RAMEXE_ADDRESS_TABLE_TYPE => "ramexe",
            _ => "unknown",
        }
    }

    /// Factory images carry both magic values and are booted without a CRC check.
    pub fn is_factory_image(&self) -> bool {
        self.image_crc == IMAGE_CRC_MAGIC && self.timestamp == IMAGE_TIMESTAMP_MAGIC
    }

    /// Image name from `image_info`, up to the first NUL.
    pub fn image_name(&self) -> String {
        let end = self
            .image_info
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.image_info.len());
        String::from_utf8_lossy(&self.image_info[..end]).into_owned()
    }

    /// Primary page span of the image.
    pub fn primary_range(&self) -> PageRange {
        self.page_ranges[0]
    }

    /// Whether the reset vector points inside a flash of `flash_size` bytes.
    pub fn has_valid_reset_vector(&self, flash_size: u32) -> bool {
        self.reset_vector < flash_size
    }
}

/// Compute the image CRC of the image whose table sits at `base`.
///
/// The table itself is folded in as erased bytes, then the rest of its page,
/// then every following page of the primary range, then five erased pages
/// standing for the unused range slots. The stored value is the complement
/// of this accumulator.
pub fn compute_image_crc<F: FlashDevice + ?Sized>(flash: &F, base: u32, aat: &Aat) -> Result<u32> {
    let page_size = flash.page_size();
    let page_len = page_size as usize;
    if page_len < AAT_SIZE {
        return Err(Error::InvalidImage(format!(
            "page size {page_size} smaller than the address table"
        )));
    }

    let mut crc = crc32_fill(CRC32_START, 0xFF, AAT_SIZE);

    let mut page = vec![0u8; page_len];
    flash.read(base + AAT_SIZE as u32, &mut page[..page_len - AAT_SIZE])?;
    crc = crc32_update(crc, &page[..page_len - AAT_SIZE]);

    let range = aat.primary_range();
    let mut address = base + page_size;
    for _ in 1..range.page_count() {
        flash.read(address, &mut page)?;
        crc = crc32_update(crc, &page);
        address += page_size;
    }

    Ok(crc32_fill(crc, 0xFF, page_len * UNUSED_PAGE_RANGES))
}

/// Check the stored CRC of the image whose table sits at `base`.
pub fn verify_image_crc<F: FlashDevice + ?Sized>(flash: &F, base: u32) -> Result<Aat> {
    let aat = Aat::read_from(flash, base)?;
    let crc = compute_image_crc(flash, base, &aat)?;
    if aat.image_crc != !crc {
        return Err(Error::ChecksumMismatch {
            expected: aat.image_crc,
            actual: !crc,
        });
    }
    Ok(aat)
}

/// Like [`verify_image_crc`], over an image held in memory.
///
/// `image` starts with the table; pages missing from the end of the buffer
/// read as erased.
pub fn verify_image_bytes(image: &[u8], page_size: u32) -> Result<Aat> {
    let aat = Aat::parse(image)?;
    let span = aat.primary_range().page_count().max(1) * page_size;
    let mut flash = crate::dfu::flash::MemFlash::new(span, page_size, 0)?;
    let len = image.len().min(span as usize);
    flash.load(0, &image[..len])?;
    verify_image_crc(&flash, 0)
}

/// Compute and store the image CRC for a table at `base` (used when building
/// images).
pub fn stamp_image_crc<F: FlashDevice + ?Sized>(flash: &mut F, base: u32) -> Result<u32> {
    let mut aat = Aat::read_from(flash, base)?;
    aat.image_crc = !compute_image_crc(flash, base, &aat)?;
    let page = flash.page_base(base);
    let mut first_page = vec![0u8; flash.page_size() as usize];
    flash.read(page, &mut first_page)?;
    let at = (base - page) as usize;
    first_page[at..at + AAT_SIZE].copy_from_slice(&aat.to_bytes());
    flash.erase_page(page)?;
    flash.write_block(page, &first_page)?;
    Ok(aat.image_crc)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dfu::flash::MemFlash;

    pub(crate) fn sample_aat(first: u8, last: u8) -> Aat {
        let mut image_info = [0u8; 32];
        image_info[..7].copy_from_slice(b"ncp-app");
        Aat {
            top_of_stack: 0x2000_8000,
            reset_vector: 0x0000_4101,
            nmi_handler: 0x0000_4111,
            hard_fault_handler: 0x0000_4113,
            image_type: APP_ADDRESS_TABLE_TYPE,
            version: 0x0109,
            vector_table: 0x0000_4000,
            plat_info: 4,
            micro_info: 7,
            phy_info: 3,
            aat_size: AAT_SIZE as u8,
            software_version: 0x0200,
            software_build: 42,
            timestamp: 0x5F00_0000,
            image_info,
            image_crc: 0,
            page_ranges: [
                PageRange { first, last },
                PageRange::from_raw(0xFFFF),
                PageRange::from_raw(0xFFFF),
                PageRange::from_raw(0xFFFF),
                PageRange::from_raw(0xFFFF),
                PageRange::from_raw(0xFFFF),
            ],
            simee_bottom: 0xFFFF_FFFF,
            customer_application_version: 7,
            internal_storage_bottom: 0xFFFF_FFFF,
            image_stamp: [1, 2, 3, 4, 5, 6, 7, 8],
            family_info: 0,
        }
    }

    /// Build a stamped application image spanning `first..=last` pages.
    pub(crate) fn build_image(page_size: u32, first: u8, last: u8, seed: u8) -> Vec<u8> {
        let aat = sample_aat(first, last);
        let len = (aat.primary_range().page_count() * page_size) as usize;
        let mut flash = MemFlash::new(len as u32, page_size, 0).unwrap();
        let mut image: Vec<u8> = (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        image[..AAT_SIZE].copy_from_slice(&aat.to_bytes());
        flash.load(0, &image).unwrap();
        stamp_image_crc(&mut flash, 0).unwrap();
        flash.as_bytes().to_vec()
    }

    #[test]
    fn test_parse_reads_little_endian_fields() {
        let aat = sample_aat(8, 10);
        let bytes = aat.to_bytes();
        assert_eq!(&bytes[4..8], &[0x01, 0x41, 0x00, 0x00]);
        assert_eq!(&bytes[16..18], &[0xA7, 0x0A]);
        assert_eq!(&bytes[72..74], &[8, 10]);
        assert_eq!(Aat::parse(&bytes).unwrap(), aat);
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert!(matches!(Aat::parse(&[0u8; 100]), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_image_metadata_helpers() {
        let mut aat = sample_aat(8, 8);
        assert!(aat.is_application());
        assert_eq!(aat.image_type_name(), "application");
        assert_eq!(aat.image_name(), "ncp-app");
        assert!(aat.has_valid_reset_vector(0x40000));
        assert!(!aat.is_factory_image());

        aat.image_crc = IMAGE_CRC_MAGIC;
        assert!(!aat.is_factory_image());
        aat.timestamp = IMAGE_TIMESTAMP_MAGIC;
        assert!(aat.is_factory_image());

        aat.reset_vector = 0x0004_0000;
        assert!(!aat.has_valid_reset_vector(0x40000));
    }

    #[test]
    fn test_page_range_packing() {
        let range = PageRange::from_raw(0x0A08);
        assert_eq!(range, PageRange { first: 8, last: 10 });
        assert_eq!(range.page_count(), 3);
        assert_eq!(range.to_raw(), 0x0A08);
        assert_eq!(PageRange { first: 3, last: 1 }.page_count(), 0);
    }

    #[test]
    fn test_crc_matches_reference_layout() {
        let page_size = 0x800;
        let image = build_image(page_size, 8, 10, 3);
        let page_len = page_size as usize;

        let mut crc = crc32_fill(CRC32_START, 0xFF, AAT_SIZE);
        crc = crc32_update(crc, &image[AAT_SIZE..]);
        crc = crc32_fill(crc, 0xFF, page_len * 5);

        let aat = Aat::parse(&image).unwrap();
        assert_eq!(aat.image_crc, !crc);
        assert!(verify_image_bytes(&image, page_size).is_ok());
    }

    #[test]
    fn test_crc_ignores_table_contents() {
        let page_size = 0x400;
        let image = build_image(page_size, 16, 17, 9);
        let mut edited = image.clone();
        edited[offset::SOFTWARE_BUILD] ^= 0xFF;
        assert!(verify_image_bytes(&edited, page_size).is_ok());
    }

    #[test]
    fn test_corrupted_body_fails_verification() {
        let page_size = 0x400;
        let mut image = build_image(page_size, 16, 18, 1);
        image[page_size as usize + 5] ^= 0x01;
        assert!(matches!(
            verify_image_bytes(&image, page_size),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_on_flash_at_offset() {
        let page_size = 0x800;
        let image = build_image(page_size, 8, 9, 5);
        let mut flash = MemFlash::new(0x8000, page_size, 0x4000).unwrap();
        flash.load(0x4000, &image).unwrap();
        let aat = verify_image_crc(&flash, 0x4000).unwrap();
        assert_eq!(aat.primary_range(), PageRange { first: 8, last: 9 });
    }
}
