//! Needle encoding and decoding
//!
//! On-disk record layout, big-endian integers:
//!
//! ```text
//! [magic:4][photo_id:8][flags:1][size:4][payload:size][checksum:32][trailer:4]
//! ```
//!
//! A volume is valid up to the last fully written needle; partial or
//! malformed trailing records are truncated during recovery. The checksum
//! is the SHA256 of the payload, so a volume can be replayed and verified
//! without the index.

use bytes::{BufMut, Bytes, BytesMut};
use haybale_common::checksum;
use haybale_common::{Error, PhotoId, Result};

/// Magic bytes opening every needle
pub const MAGIC: [u8; 4] = *b"HAYN";

/// Magic bytes closing every needle
pub const TRAILER: [u8; 4] = *b"NEND";

/// Tombstone flag bit
pub const FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// Fixed header bytes: magic + photo_id + flags + size
pub const HEADER_LEN: usize = 4 + 8 + 1 + 4;

/// Fixed footer bytes: checksum + trailer
pub const FOOTER_LEN: usize = 32 + 4;

/// Total fixed overhead per needle
pub const NEEDLE_OVERHEAD: usize = HEADER_LEN + FOOTER_LEN;

/// Upper bound on a single payload; recovery treats larger sizes as garbage
pub const MAX_PAYLOAD_SIZE: u32 = 256 * 1024 * 1024;

/// One decoded on-disk record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Needle {
    /// Blob identity
    pub photo_id: PhotoId,
    /// Flag bits; bit 0 marks a tombstone
    pub flags: u8,
    /// Payload bytes; empty for tombstones
    pub payload: Bytes,
}

impl Needle {
    /// Build a data needle for a payload
    #[must_use]
    pub fn data(photo_id: PhotoId, payload: Bytes) -> Self {
        Self {
            photo_id,
            flags: 0,
            payload,
        }
    }

    /// Build a tombstone needle
    #[must_use]
    pub fn tombstone(photo_id: PhotoId) -> Self {
        Self {
            photo_id,
            flags: FLAG_TOMBSTONE,
            payload: Bytes::new(),
        }
    }

    /// Whether this needle marks a deletion
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    /// Bytes this needle occupies on disk
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        (NEEDLE_OVERHEAD + self.payload.len()) as u64
    }

    /// Disk size of a record with the given payload length
    #[must_use]
    pub fn disk_size_for(payload_len: u32) -> u64 {
        NEEDLE_OVERHEAD as u64 + u64::from(payload_len)
    }

    /// Serialize to the on-disk representation
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NEEDLE_OVERHEAD + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_slice(&self.photo_id.to_be_bytes());
        buf.put_u8(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_slice(&checksum::sha256(&self.payload));
        buf.put_slice(&TRAILER);
        buf.freeze()
    }

    /// Decode one needle from the start of `buf`
    ///
    /// `buf` must contain the complete record; use [`parse_header`] first to
    /// learn the length. `volume_id` and `offset` only label errors.
    pub fn decode(buf: &[u8], volume_id: u32, offset: u64) -> Result<Self> {
        let corrupt = || Error::Corrupt { volume_id, offset };

        let header = parse_header(buf, volume_id, offset)?;
        let total = Self::disk_size_for(header.size) as usize;
        if buf.len() < total {
            return Err(corrupt());
        }

        let payload_start = HEADER_LEN;
        let payload_end = payload_start + header.size as usize;
        let payload = Bytes::copy_from_slice(&buf[payload_start..payload_end]);

        let mut stored = [0u8; 32];
        stored.copy_from_slice(&buf[payload_end..payload_end + 32]);
        if buf[payload_end + 32..total] != TRAILER {
            return Err(corrupt());
        }
        if !checksum::verify(&payload, &stored) {
            return Err(Error::ChecksumMismatch {
                expected: hex::encode(stored),
                actual: checksum::sha256_hex(&payload),
            });
        }

        let needle = Self {
            photo_id: header.photo_id,
            flags: header.flags,
            payload,
        };
        if needle.is_tombstone() && !needle.payload.is_empty() {
            return Err(corrupt());
        }
        Ok(needle)
    }
}

/// Parsed fixed header of a needle
#[derive(Clone, Copy, Debug)]
pub struct NeedleHeader {
    /// Blob identity
    pub photo_id: PhotoId,
    /// Flag bits
    pub flags: u8,
    /// Payload length in bytes
    pub size: u32,
}

/// Parse and validate the fixed header at the start of `buf`
pub fn parse_header(buf: &[u8], volume_id: u32, offset: u64) -> Result<NeedleHeader> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Corrupt { volume_id, offset });
    }
    if buf[..4] != MAGIC {
        return Err(Error::Corrupt { volume_id, offset });
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[4..12]);
    let flags = buf[12];
    let mut size = [0u8; 4];
    size.copy_from_slice(&buf[13..17]);
    let size = u32::from_be_bytes(size);
    if size > MAX_PAYLOAD_SIZE {
        return Err(Error::Corrupt { volume_id, offset });
    }
    Ok(NeedleHeader {
        photo_id: PhotoId::from_be_bytes(id),
        flags,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_roundtrip() {
        let needle = Needle::data(PhotoId::from_u64(42), Bytes::from_static(b"HELLO"));
        let encoded = needle.encode();
        assert_eq!(encoded.len() as u64, needle.disk_size());

        let decoded = Needle::decode(&encoded, 0, 0).unwrap();
        assert_eq!(decoded, needle);
        assert!(!decoded.is_tombstone());
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let needle = Needle::tombstone(PhotoId::from_u64(7));
        let encoded = needle.encode();
        assert_eq!(encoded.len(), NEEDLE_OVERHEAD);

        let decoded = Needle::decode(&encoded, 0, 0).unwrap();
        assert!(decoded.is_tombstone());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut encoded = Needle::data(PhotoId::from_u64(1), Bytes::from_static(b"x"))
            .encode()
            .to_vec();
        encoded[0] ^= 0xff;
        assert!(matches!(
            Needle::decode(&encoded, 3, 99),
            Err(Error::Corrupt {
                volume_id: 3,
                offset: 99,
            })
        ));
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum() {
        let mut encoded = Needle::data(PhotoId::from_u64(1), Bytes::from_static(b"payload"))
            .encode()
            .to_vec();
        encoded[HEADER_LEN] ^= 0x01;
        assert!(matches!(
            Needle::decode(&encoded, 0, 0),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let encoded = Needle::data(PhotoId::from_u64(1), Bytes::from_static(b"abcdef")).encode();
        let truncated = &encoded[..encoded.len() - 10];
        assert!(Needle::decode(truncated, 0, 0).is_err());
    }
}
