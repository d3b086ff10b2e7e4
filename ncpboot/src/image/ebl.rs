//! EBL firmware container format.
//!
//! An EBL image is a flat sequence of tag/length/value records. All multi-byte
//! fields are big-endian.
//!
//! ```text
//! +---------+------------+----------------------+
//! | tag u16 | length u16 |  payload (length B)  |
//! +---------+------------+----------------------+
//! ```
//!
//! | Tag      | Record             | Payload                                  |
//! |----------|--------------------|------------------------------------------|
//! | `0x0000` | Header             | 12 bytes, program address at bytes 4..8  |
//! | `0xFE01` | Prog               | address (4) + data                       |
//! | `0x02FE` | MfgProg            | address (4) + data                       |
//! | `0xFD03` | EraseProg          | address (4) + data                       |
//! | `0xFC04` | End                | empty                                    |
//! | `0xF608` | Metadata           | opaque                                   |
//! | `0xFB05` | Encrypted header   | opaque                                   |
//! | `0xFA06` | Encryption init    | opaque                                   |
//! | `0xF907` | Encrypted data     | opaque                                   |
//! | `0xF709` | Encryption MAC     | opaque                                   |
//! | `0xF70A` | ECDSA signature    | opaque                                   |
//!
//! The device-side streaming decoder lives in [`crate::dfu::decoder`]; this
//! module parses whole images on the host for inspection.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read};

/// Bytes in a record's tag + length prefix.
pub const TAG_LENGTH_SIZE: usize = 4;

/// Fixed size of the Header record body consumed by the decoder.
pub const HEADER_BODY_SIZE: usize = 12;

/// Size of the address that opens a program record.
pub const PROGRAM_ADDRESS_SIZE: usize = 4;

/// Offset of the program address inside the Header body.
pub const HEADER_ADDRESS_OFFSET: usize = 4;

/// Known EBL record tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum EblTag {
    /// Image header (0x0000).
    Header,
    /// Legacy program data (0xFE01).
    Prog,
    /// Manufacturing token data (0x02FE).
    MfgProg,
    /// Erase then program (0xFD03).
    EraseProg,
    /// End of image (0xFC04).
    End,
    /// Metadata (0xF608).
    Metadata,
    /// Encrypted image header (0xFB05).
    EncHeader,
    /// Encryption init vector (0xFA06).
    EncInit,
    /// Encrypted EBL data (0xF907).
    EncEblData,
    /// Encryption MAC (0xF709).
    EncMac,
    /// ECDSA P-256 signature over the stream (0xF70A).
    EncSignature,
    /// Any other tag value.
    Unknown(u16),
}

impl EblTag {
    /// Decode a raw tag value.
    #[must_use]
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Self::Header,
            0xFE01 => Self::Prog,
            0x02FE => Self::MfgProg,
            0xFD03 => Self::EraseProg,
            0xFC04 => Self::End,
            0xF608 => Self::Metadata,
            0xFB05 => Self::EncHeader,
            0xFA06 => Self::EncInit,
            0xF907 => Self::EncEblData,
            0xF709 => Self::EncMac,
            0xF70A => Self::EncSignature,
            v => Self::Unknown(v),
        }
    }

    /// Raw tag value.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Header => 0x0000,
            Self::Prog => 0xFE01,
            Self::MfgProg => 0x02FE,
            Self::EraseProg => 0xFD03,
            Self::End => 0xFC04,
            Self::Metadata => 0xF608,
            Self::EncHeader => 0xFB05,
            Self::EncInit => 0xFA06,
            Self::EncEblData => 0xF907,
            Self::EncMac => 0xF709,
            Self::EncSignature => 0xF70A,
            Self::Unknown(v) => v,
        }
    }

    /// Human-readable record name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Header => "Header",
            Self::Prog => "Prog",
            Self::MfgProg => "MfgProg",
            Self::EraseProg => "EraseProg",
            Self::End => "End",
            Self::Metadata => "Metadata",
            Self::EncHeader => "EncHeader",
            Self::EncInit => "EncInit",
            Self::EncEblData => "EncEblData",
            Self::EncMac => "EncMac",
            Self::EncSignature => "EncSignature",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Whether the record carries a leading flash address followed by data.
    pub fn carries_program_data(self) -> bool {
        matches!(self, Self::Prog | Self::MfgProg | Self::EraseProg)
    }

    /// Whether the record belongs to the encrypted/signed variant.
    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            Self::EncHeader | Self::EncInit | Self::EncEblData | Self::EncMac | Self::EncSignature
        )
    }
}

/// One decoded EBL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EblRecord {
    /// Record tag.
    pub tag: EblTag,
    /// Declared payload length.
    pub length: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl EblRecord {
    /// Target flash address, for Header and program records.
    pub fn address(&self) -> Option<u32> {
        match self.tag {
            EblTag::Header if self.payload.len() >= HEADER_BODY_SIZE => Some(BigEndian::read_u32(
                &self.payload[HEADER_ADDRESS_OFFSET..HEADER_ADDRESS_OFFSET + 4],
            )),
            t if t.carries_program_data() && self.payload.len() >= PROGRAM_ADDRESS_SIZE => {
                Some(BigEndian::read_u32(&self.payload[..PROGRAM_ADDRESS_SIZE]))
            },
            _ => None,
        }
    }

    /// Program data bytes (payload after the address), for program records.
    pub fn data(&self) -> &[u8] {
        if self
            .tag
            .carries_program_data()
            && self.payload.len() >= PROGRAM_ADDRESS_SIZE
        {
            &self.payload[PROGRAM_ADDRESS_SIZE..]
        } else {
            &[]
        }
    }

    /// Encode this record back to its wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_record(self.tag, &self.payload)
    }
}

/// Encode one record: tag, length, payload.
pub fn encode_record(tag: EblTag, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        Error::InvalidEbl(format!("{} payload of {} bytes", tag.name(), payload.len()))
    })?;
    let mut out = Vec::with_capacity(TAG_LENGTH_SIZE + payload.len());
    out.extend_from_slice(&tag.as_u16().to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Build a Header record body pointing at `address`.
#[must_use]
pub fn header_body(address: u32) -> [u8; HEADER_BODY_SIZE] {
    let mut body = [0u8; HEADER_BODY_SIZE];
    BigEndian::write_u32(
        &mut body[HEADER_ADDRESS_OFFSET..HEADER_ADDRESS_OFFSET + 4],
        address,
    );
    body
}

/// Build a program record payload: address followed by data.
#[must_use]
pub fn program_payload(address: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PROGRAM_ADDRESS_SIZE + data.len());
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

/// A parsed EBL image.
#[derive(Debug, Clone, Default)]
pub struct Ebl {
    /// Records in stream order, up to and including End.
    pub records: Vec<EblRecord>,
    /// Bytes following the End record (file padding).
    pub trailing: usize,
}

impl Ebl {
    /// Parse an EBL image from memory.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut records = Vec::new();

        loop {
            let pos = cursor.position() as usize;
            if pos == data.len() {
                break;
            }
            if data.len() - pos < TAG_LENGTH_SIZE {
                return Err(Error::InvalidEbl(format!(
                    "truncated record header at offset {pos:#x}"
                )));
            }

            let tag = EblTag::from_u16(cursor.read_u16::<BigEndian>()?);
            let length = cursor.read_u16::<BigEndian>()?;
            let mut payload = vec![0u8; usize::from(length)];
            cursor
                .read_exact(&mut payload)
                .map_err(|_| {
                    Error::InvalidEbl(format!(
                        "{} record at offset {pos:#x} declares {length} bytes past end of file",
                        tag.name()
                    ))
                })?;

            let end = tag == EblTag::End;
            records.push(EblRecord {
                tag,
                length,
                payload,
            });
            if end {
                break;
            }
        }

        if records
            .first()
            .is_some_and(|r| r.tag != EblTag::Header && !r.tag.is_encrypted())
        {
            return Err(Error::InvalidEbl("image does not start with a Header record".into()));
        }

        let trailing = data.len() - cursor.position() as usize;
        Ok(Self { records, trailing })
    }

    /// Read and parse an EBL file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Whether the stream is terminated by an End record.
    pub fn is_terminated(&self) -> bool {
        self.records
            .last()
            .is_some_and(|r| r.tag == EblTag::End)
    }

    /// Whether the image uses the encrypted record set.
    pub fn is_encrypted(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.tag.is_encrypted())
    }

    /// Total program data bytes across all program records.
    pub fn program_bytes(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.data().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Vec<u8> {
        let mut image = encode_record(EblTag::Header, &header_body(0x4000)).unwrap();
        image.extend(
            encode_record(
                EblTag::EraseProg,
                &program_payload(0x4000, &[1, 2, 3, 4, 5, 6]),
            )
            .unwrap(),
        );
        image.extend(encode_record(EblTag::Unknown(0x1234), &[9, 9]).unwrap());
        image.extend(encode_record(EblTag::End, &[]).unwrap());
        image
    }

    #[test]
    fn test_tag_round_trip_known_values() {
        for raw in [
            0x0000, 0xFE01, 0x02FE, 0xFD03, 0xFC04, 0xF608, 0xFB05, 0xFA06, 0xF907, 0xF709, 0xF70A,
        ] {
            let tag = EblTag::from_u16(raw);
            assert_ne!(tag, EblTag::Unknown(raw));
            assert_eq!(tag.as_u16(), raw);
        }
        assert_eq!(EblTag::from_u16(0xABCD), EblTag::Unknown(0xABCD));
    }

    #[test]
    fn test_encode_record_is_big_endian() {
        let bytes = encode_record(EblTag::EraseProg, &[0xAA; 4]).unwrap();
        assert_eq!(&bytes[..4], &[0xFD, 0x03, 0x00, 0x04]);
        assert!(encode_record(EblTag::Metadata, &vec![0; 70_000]).is_err());
    }

    #[test]
    fn test_parse_sample_image() {
        let ebl = Ebl::parse(&sample_image()).unwrap();
        assert_eq!(ebl.records.len(), 4);
        assert!(ebl.is_terminated());
        assert!(!ebl.is_encrypted());
        assert_eq!(ebl.records[0].address(), Some(0x4000));
        assert_eq!(ebl.records[1].address(), Some(0x4000));
        assert_eq!(ebl.records[1].data(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(ebl.records[2].address(), None);
        assert_eq!(ebl.program_bytes(), 6);
        assert_eq!(ebl.trailing, 0);
    }

    #[test]
    fn test_parse_counts_trailing_padding() {
        let mut image = sample_image();
        image.extend([0xFF; 7]);
        let ebl = Ebl::parse(&image).unwrap();
        assert_eq!(ebl.trailing, 7);
    }

    #[test]
    fn test_parse_rejects_truncated_payload() {
        let mut image = encode_record(EblTag::Header, &header_body(0)).unwrap();
        image.extend([0xFD, 0x03, 0x00, 0x10, 0x00]);
        assert!(matches!(Ebl::parse(&image), Err(Error::InvalidEbl(_))));
    }

    #[test]
    fn test_parse_rejects_missing_header() {
        let image = encode_record(EblTag::End, &[]).unwrap();
        assert!(matches!(Ebl::parse(&image), Err(Error::InvalidEbl(_))));
    }

    #[test]
    fn test_record_to_bytes_matches_input() {
        let image = sample_image();
        let ebl = Ebl::parse(&image).unwrap();
        let rebuilt: Vec<u8> = ebl
            .records
            .iter()
            .flat_map(|r| r.to_bytes().unwrap())
            .collect();
        assert_eq!(rebuilt, image);
    }
}
