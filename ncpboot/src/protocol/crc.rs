//! CRC primitives.
//!
//! Both checksums run a byte at a time so callers can fold them over data
//! that never sits in one buffer (flash pages, streamed blocks).
//!
//! - CRC-16/CCITT, polynomial `0x1021`, non-reflected. Seeded with `0` it is
//!   CRC-16/XMODEM, which is what Xmodem-CRC blocks carry.
//! - CRC-32, reflected polynomial `0xEDB88320`. Image checks seed with
//!   [`CRC32_START`] and compare the stored value against `!crc`.

/// Conventional seed for a fresh CRC-16/CCITT computation.
pub const CRC16_START: u16 = 0xFFFF;

/// Seed for image CRC-32 computations.
pub const CRC32_START: u32 = 0xFFFF_FFFF;

const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

/// Fold one byte into a CRC-16/CCITT value.
#[must_use]
pub fn crc16(byte: u8, crc: u16) -> u16 {
    let mut crc = crc.rotate_left(8);
    crc ^= u16::from(byte);
    crc ^= (crc & 0xFF) >> 4;
    crc ^= crc << 12;
    crc ^= (crc & 0xFF) << 5;
    crc
}

/// CRC-16/XMODEM over a slice (CCITT seeded with 0).
#[must_use]
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter()
        .fold(0, |crc, &b| crc16(b, crc))
}

/// Fold one byte into a reflected CRC-32 accumulator.
#[must_use]
pub fn crc32(byte: u8, accumulator: u32) -> u32 {
    let previous = accumulator >> 8;
    let mut oper = (accumulator ^ u32::from(byte)) & 0xFF;
    for _ in 0..8 {
        oper = if oper & 1 != 0 {
            (oper >> 1) ^ CRC32_POLYNOMIAL
        } else {
            oper >> 1
        };
    }
    previous ^ oper
}

/// Fold a slice into a CRC-32 accumulator.
#[must_use]
pub fn crc32_update(accumulator: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(accumulator, |acc, &b| crc32(b, acc))
}

/// Fold `count` copies of `byte` into a CRC-32 accumulator.
#[must_use]
pub fn crc32_fill(accumulator: u32, byte: u8, count: usize) -> u32 {
    (0..count).fold(accumulator, |acc, _| crc32(byte, acc))
}
