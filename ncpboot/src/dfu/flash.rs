//! Flash programming capability.
//!
//! The bootloader core never touches registers; it programs flash through
//! [`FlashDevice`]. [`MemFlash`] emulates NOR flash semantics in memory:
//! erased bytes read `0xFF`, programming can only clear bits, and erase works
//! on whole pages.

use crate::error::{Error, Result};
use std::ops::Range;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xFF;

/// Flash word width used by the programming primitive.
pub const WORD_SIZE: usize = 4;

/// Page-erasable, word-programmable flash.
pub trait FlashDevice {
    /// Erase granularity in bytes.
    fn page_size(&self) -> u32;

    /// Address window the bootloader may program (application area).
    fn valid_range(&self) -> Range<u32>;

    /// Read `buf.len()` bytes starting at `address`.
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()>;

    /// Erase the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> Result<()>;

    /// Program `data` at `address`.
    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Base address of the page containing `address`.
    fn page_base(&self, address: u32) -> u32 {
        address - address % self.page_size()
    }

    /// Read a little-endian word.
    fn read_u32(&self, address: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }
}

/// Operation counters kept by [`MemFlash`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    /// Calls to `erase_page`.
    pub erase_requests: u32,
    /// Erases that actually cleared a non-blank page.
    pub erases: u32,
    /// Calls to `write_block`.
    pub writes: u32,
    /// Bytes passed to `write_block`.
    pub bytes_written: u64,
}

/// In-memory flash.
#[derive(Debug, Clone)]
pub struct MemFlash {
    memory: Vec<u8>,
    page_size: u32,
    bootloader_size: u32,
    write_protected: bool,
    stats: FlashStats,
    erased_pages: Vec<u32>,
}

impl MemFlash {
    /// Create a fully erased flash of `flash_size` bytes.
    ///
    /// The programmable window is `[bootloader_size, flash_size)`.
    pub fn new(flash_size: u32, page_size: u32, bootloader_size: u32) -> Result<Self> {
        if page_size == 0 || flash_size % page_size != 0 {
            return Err(Error::Config(format!(
                "flash size {flash_size:#x} is not a multiple of page size {page_size:#x}"
            )));
        }
        if bootloader_size > flash_size {
            return Err(Error::Config(format!(
                "bootloader size {bootloader_size:#x} exceeds flash size {flash_size:#x}"
            )));
        }
        Ok(Self {
            memory: vec![ERASED; flash_size as usize],
            page_size,
            bootloader_size,
            write_protected: false,
            stats: FlashStats::default(),
            erased_pages: Vec::new(),
        })
    }

    /// Place raw bytes at `address` without counting it as programming.
    pub fn load(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let range = self.span(address, data.len())?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    /// Whole flash contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Total size in bytes.
    pub fn size(&self) -> u32 {
        self.memory.len() as u32
    }

    /// Start of the application area.
    pub fn bootloader_size(&self) -> u32 {
        self.bootloader_size
    }

    /// Operation counters.
    pub fn stats(&self) -> FlashStats {
        self.stats
    }

    /// Pages that were really erased, in order.
    pub fn erased_pages(&self) -> &[u32] {
        &self.erased_pages
    }

    /// Make every subsequent erase/write fail, as a locked controller would.
    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    fn span(&self, address: u32, len: usize) -> Result<Range<usize>> {
        let start = address as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.memory.len())
            .ok_or_else(|| {
                Error::Flash(format!(
                    "access of {len} bytes at {address:#x} beyond flash end {:#x}",
                    self.memory.len()
                ))
            })?;
        Ok(start..end)
    }

    fn check_unlocked(&self, op: &str, address: u32) -> Result<()> {
        if self.write_protected {
            return Err(Error::Flash(format!("{op} at {address:#x}: controller locked")));
        }
        Ok(())
    }
}

impl FlashDevice for MemFlash {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn valid_range(&self) -> Range<u32> {
        self.bootloader_size..self.size()
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.span(address, buf.len())?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn erase_page(&mut self, address: u32) -> Result<()> {
        self.stats.erase_requests += 1;
        self.check_unlocked("erase", address)?;
        let base = self.page_base(address);
        let range = self.span(base, self.page_size as usize)?;

        let page = &mut self.memory[range];
        if page.iter().all(|&b| b == ERASED) {
            log::trace!("Page {base:#x} already blank, erase skipped");
            return Ok(());
        }
        page.fill(ERASED);
        self.stats.erases += 1;
        self.erased_pages.push(base);
        Ok(())
    }

    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.stats.writes += 1;
        self.stats.bytes_written += data.len() as u64;
        self.check_unlocked("write", address)?;
        let range = self.span(address, data.len())?;
        let memory = &mut self.memory[range];

        for (dst, src) in memory
            .chunks_mut(WORD_SIZE)
            .zip(data.chunks(WORD_SIZE))
        {
            let mut word = [ERASED; WORD_SIZE];
            word[..src.len()].copy_from_slice(src);
            for (cell, bits) in dst.iter_mut().zip(word) {
                *cell &= bits;
            }
        }
        Ok(())
    }
}
