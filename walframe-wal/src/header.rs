//! WAL file header.
//!
//! The first 32 bytes of the log, all fields big-endian:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+----------+----------+
//! | magic    | version  | pagesize | ckpt seq | salt-1   | salt-2   | cksum-1  | cksum-2  |
//! | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+----------+----------+
//! ```
//!
//! The checksum covers bytes 0..24 seeded with zero. The low bit of the magic
//! selects the checksum word byte order for the whole generation.

use crate::checksum::{ByteOrder, WalChecksum};
use crate::error::WalError;
use crate::frame::{decode_page_size, encode_page_size};
use crate::WAL_HEADER_SIZE;
use bytes::{Buf, BufMut, BytesMut};

/// Magic number with the byte-order bit clear.
pub const WAL_MAGIC: u32 = 0x377f_0682;

/// Log format version.
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// Parsed WAL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub format_version: u32,
    /// Raw page-size field; see [`decode_page_size`].
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt: [u32; 2],
    pub checksum: [u32; 2],
}

impl WalHeader {
    /// Creates a header for a new generation and computes its checksum.
    pub fn new(
        page_size: u32,
        order: ByteOrder,
        checkpoint_seq: u32,
        salt: [u32; 2],
    ) -> Result<Self, WalError> {
        let magic = match order {
            ByteOrder::Little => WAL_MAGIC,
            ByteOrder::Big => WAL_MAGIC | 1,
        };

        let mut header = Self {
            magic,
            format_version: WAL_FORMAT_VERSION,
            page_size: encode_page_size(page_size)?,
            checkpoint_seq,
            salt,
            checksum: [0, 0],
        };
        header.checksum = header.compute_checksum().to_array();
        Ok(header)
    }

    /// Byte order of checksum words in this generation.
    pub fn byte_order(&self) -> ByteOrder {
        if self.magic & 1 == 1 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Effective page size in bytes.
    pub fn page_size(&self) -> Result<u32, WalError> {
        decode_page_size(self.page_size)
    }

    /// Header for the next generation.
    ///
    /// Bumps the checkpoint sequence, increments the first salt and replaces
    /// the second, so frames from the old generation no longer validate.
    pub fn restarted(&self, salt2: u32) -> Self {
        let mut next = Self {
            checkpoint_seq: self.checkpoint_seq.wrapping_add(1),
            salt: [self.salt[0].wrapping_add(1), salt2],
            checksum: [0, 0],
            ..*self
        };
        next.checksum = next.compute_checksum().to_array();
        next
    }

    /// Encodes the header with its stored checksum.
    pub fn encode(&self) -> BytesMut {
        let mut buf = self.encode_prefix();
        buf.put_u32(self.checksum[0]);
        buf.put_u32(self.checksum[1]);
        buf
    }

    /// Decodes and validates a header.
    pub fn decode(buf: &[u8]) -> Result<Self, WalError> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(WalError::InvalidHeader(format!(
                "need {} bytes, got {}",
                WAL_HEADER_SIZE,
                buf.len()
            )));
        }

        let mut cur = &buf[..WAL_HEADER_SIZE];
        let header = Self {
            magic: cur.get_u32(),
            format_version: cur.get_u32(),
            page_size: cur.get_u32(),
            checkpoint_seq: cur.get_u32(),
            salt: [cur.get_u32(), cur.get_u32()],
            checksum: [cur.get_u32(), cur.get_u32()],
        };

        if header.magic & !1 != WAL_MAGIC {
            return Err(WalError::InvalidHeader(format!(
                "bad magic {:#010x}",
                header.magic
            )));
        }
        if header.format_version != WAL_FORMAT_VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        if !header.compute_checksum().verify(header.checksum) {
            return Err(WalError::InvalidHeader("checksum mismatch".to_string()));
        }
        header.page_size()?;

        Ok(header)
    }

    fn encode_prefix(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(WAL_HEADER_SIZE);
        buf.put_u32(self.magic);
        buf.put_u32(self.format_version);
        buf.put_u32(self.page_size);
        buf.put_u32(self.checkpoint_seq);
        buf.put_u32(self.salt[0]);
        buf.put_u32(self.salt[1]);
        buf
    }

    fn compute_checksum(&self) -> WalChecksum {
        WalChecksum::default().update(&self.encode_prefix(), self.byte_order())
    }
}

/// Fresh random salt word.
pub fn random_salt() -> u32 {
    uuid::Uuid::new_v4().as_u128() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = WalHeader::new(4096, ByteOrder::Little, 3, [11, 22]).unwrap();
        let encoded = header.encode();
        assert_eq!(encoded.len(), WAL_HEADER_SIZE);

        let decoded = WalHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.page_size().unwrap(), 4096);
        assert_eq!(decoded.byte_order(), ByteOrder::Little);
    }

    #[test]
    fn test_magic_records_byte_order() {
        let little = WalHeader::new(1024, ByteOrder::Little, 0, [1, 2]).unwrap();
        let big = WalHeader::new(1024, ByteOrder::Big, 0, [1, 2]).unwrap();
        assert_eq!(little.magic, 0x377f_0682);
        assert_eq!(big.magic, 0x377f_0683);
        assert_eq!(big.byte_order(), ByteOrder::Big);
        assert_ne!(little.checksum, big.checksum);
    }

    #[test]
    fn test_64k_page_size_is_stored_as_one() {
        let header = WalHeader::new(65536, ByteOrder::Big, 0, [1, 2]).unwrap();
        assert_eq!(header.page_size, 1);
        let decoded = WalHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.page_size().unwrap(), 65536);
    }

    #[test]
    fn test_bad_magic() {
        let header = WalHeader::new(4096, ByteOrder::Little, 0, [1, 2]).unwrap();
        let mut encoded = header.encode();
        encoded[0] = 0;
        assert!(matches!(
            WalHeader::decode(&encoded),
            Err(WalError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let header = WalHeader::new(4096, ByteOrder::Little, 0, [1, 2]).unwrap();
        let mut encoded = header.encode();
        encoded[13] ^= 0x01;
        assert!(matches!(
            WalHeader::decode(&encoded),
            Err(WalError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_short_buffer() {
        assert!(WalHeader::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_restarted_changes_generation() {
        let header = WalHeader::new(4096, ByteOrder::Little, 7, [100, 200]).unwrap();
        let next = header.restarted(999);
        assert_eq!(next.checkpoint_seq, 8);
        assert_eq!(next.salt, [101, 999]);
        assert_eq!(next.page_size, header.page_size);
        assert_eq!(WalHeader::decode(&next.encode()).unwrap(), next);
    }
}
