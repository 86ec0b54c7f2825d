//! Datafile marker format.
//!
//! Every marker begins with a fixed 20-byte header followed by its payload:
//!
//! ```text
//! | size: u32 | type: u32 | tick: u64 | crc: u32 | payload ... |
//! ```
//!
//! All fields little-endian. `size` covers header plus payload; markers are
//! placed at 8-byte-aligned offsets, so iteration advances by the aligned
//! size. The checksum is XXH32 over the full marker with the crc field
//! zeroed. A marker whose `size` reads 0 terminates iteration (end of a
//! partially written file).

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::xxh32;

use arbor_types::Tick;

use crate::error::{Error, Result};

/// Size of the fixed marker header in bytes.
pub const MARKER_HEADER_SIZE: usize = 20;

/// Byte offset of the crc field inside the header.
const CRC_OFFSET: usize = 16;

/// Marker types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MarkerType {
    /// First marker of every datafile; payload describes the file.
    DatafileHeader = 10,
    /// Collection header; payload carries the owning collection id.
    ColHeader = 20,
    /// A document (insert, update or replace image).
    Document = 30,
    /// A document removal.
    Remove = 40,
    /// Transaction prologue (reserved).
    Prologue = 50,
    /// Blanked-out region; skipped entirely on iteration.
    Blank = 60,
    /// Final marker of a sealed datafile.
    Footer = 70,
}

impl MarkerType {
    /// Whether this marker type carries document data.
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, MarkerType::Document | MarkerType::Remove)
    }
}

impl TryFrom<u32> for MarkerType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            10 => Ok(Self::DatafileHeader),
            20 => Ok(Self::ColHeader),
            30 => Ok(Self::Document),
            40 => Ok(Self::Remove),
            50 => Ok(Self::Prologue),
            60 => Ok(Self::Blank),
            70 => Ok(Self::Footer),
            other => Err(Error::Corrupted { reason: format!("invalid marker type {other}") }),
        }
    }
}

/// Decoded marker header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerHeader {
    /// Total marker size (header + payload), unaligned.
    pub size: u32,
    /// Marker type.
    pub marker_type: MarkerType,
    /// Tick stamped at write time.
    pub tick: Tick,
    /// XXH32 checksum.
    pub crc: u32,
}

impl MarkerHeader {
    /// Aligned size this marker occupies on disk.
    #[must_use]
    pub fn aligned_size(&self) -> u64 {
        align8(u64::from(self.size))
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.size as usize - MARKER_HEADER_SIZE
    }
}

/// Rounds up to the next multiple of 8.
#[must_use]
pub fn align8(value: u64) -> u64 {
    (value + 7) & !7
}

/// Encodes a complete marker (header + payload + alignment padding).
#[must_use]
pub fn encode_marker(marker_type: MarkerType, tick: Tick, payload: &[u8]) -> Vec<u8> {
    let size = (MARKER_HEADER_SIZE + payload.len()) as u32;
    let total = align8(u64::from(size)) as usize;
    let mut buf = vec![0u8; total];
    buf[0..4].copy_from_slice(&size.to_le_bytes());
    buf[4..8].copy_from_slice(&(marker_type as u32).to_le_bytes());
    buf[8..16].copy_from_slice(&tick.value().to_le_bytes());
    // crc stays zero while hashing
    buf[MARKER_HEADER_SIZE..MARKER_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let crc = xxh32(&buf[..size as usize], 0);
    buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decodes a marker header from the first [`MARKER_HEADER_SIZE`] bytes.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] on a short buffer, an unknown type, or a
/// size smaller than the header.
pub fn decode_header(buf: &[u8]) -> Result<MarkerHeader> {
    if buf.len() < MARKER_HEADER_SIZE {
        return Err(Error::Corrupted {
            reason: format!("marker header truncated: {} bytes", buf.len()),
        });
    }
    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let raw_type = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let tick = u64::from_le_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]);
    let crc = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
    if (size as usize) < MARKER_HEADER_SIZE {
        return Err(Error::Corrupted { reason: format!("marker size {size} below header size") });
    }
    Ok(MarkerHeader { size, marker_type: MarkerType::try_from(raw_type)?, tick: Tick::new(tick), crc })
}

/// Verifies the checksum of a complete marker buffer.
#[must_use]
pub fn verify_crc(marker: &[u8], header: &MarkerHeader) -> bool {
    if marker.len() < header.size as usize {
        return false;
    }
    let mut copy = marker[..header.size as usize].to_vec();
    copy[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&[0, 0, 0, 0]);
    xxh32(&copy, 0) == header.crc
}

/// Payload of a [`MarkerType::DatafileHeader`] marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatafileHeaderPayload {
    /// Datafile format version.
    pub version: u32,
    /// Maximal size the file was created with.
    pub maximal_size: u64,
    /// The file's id.
    pub fid: u64,
}

/// Payload of a [`MarkerType::ColHeader`] marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColHeaderPayload {
    /// Id of the owning collection.
    pub cid: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(20), 24);
        assert_eq!(align8(25), 32);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let payload = b"some document bytes";
        let buf = encode_marker(MarkerType::Document, Tick::new(42), payload);
        assert_eq!(buf.len() % 8, 0);
        let header = decode_header(&buf).unwrap();
        assert_eq!(header.marker_type, MarkerType::Document);
        assert_eq!(header.tick, Tick::new(42));
        assert_eq!(header.payload_len(), payload.len());
        assert!(verify_crc(&buf, &header));
        assert_eq!(&buf[MARKER_HEADER_SIZE..MARKER_HEADER_SIZE + payload.len()], payload);
    }

    #[test]
    fn test_corrupted_byte_fails_crc() {
        let mut buf = encode_marker(MarkerType::Document, Tick::new(7), b"payload");
        let header = decode_header(&buf).unwrap();
        buf[MARKER_HEADER_SIZE] ^= 0xff;
        assert!(!verify_crc(&buf, &header));
    }

    #[test]
    fn test_empty_payload_marker() {
        let buf = encode_marker(MarkerType::Footer, Tick::new(1), &[]);
        let header = decode_header(&buf).unwrap();
        assert_eq!(header.size as usize, MARKER_HEADER_SIZE);
        assert_eq!(header.payload_len(), 0);
        assert!(verify_crc(&buf, &header));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = encode_marker(MarkerType::Document, Tick::new(1), b"x");
        buf[4..8].copy_from_slice(&999u32.to_le_bytes());
        assert!(decode_header(&buf).is_err());
    }

    #[test]
    fn test_zero_size_means_eof() {
        let buf = [0u8; MARKER_HEADER_SIZE];
        let err = decode_header(&buf).unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    #[test]
    fn test_data_marker_classification() {
        assert!(MarkerType::Document.is_data());
        assert!(MarkerType::Remove.is_data());
        assert!(!MarkerType::Footer.is_data());
        assert!(!MarkerType::Blank.is_data());
    }
}
