//! WAL frames.
//!
//! Each frame has the following on-disk format (fields big-endian):
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | page no  | db size  | salt-1   | salt-2   | cksum-1  | cksum-2  |
//! | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | page image                                                      |
//! | page_size bytes                                                 |
//! +-----------------------------------------------------------------+
//! ```
//!
//! `db size` is non-zero only on commit frames. The checksum covers the first
//! 8 header bytes and the page image, seeded from the previous frame.

use crate::checksum::{ByteOrder, WalChecksum};
use crate::error::WalError;
use crate::index::FrameNo;
use crate::{FRAME_HEADER_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, WAL_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Decodes a raw page-size field into a page size in bytes.
///
/// The field is 16 bits wide in the index header, which cannot hold 65536,
/// so a 64 KiB page is stored as `1`. Powers of two from 512 to 32768 are
/// taken at face value. A literal `65536` is accepted too.
pub fn decode_page_size(raw: u32) -> Result<u32, WalError> {
    match raw {
        1 | MAX_PAGE_SIZE => Ok(MAX_PAGE_SIZE),
        v if (MIN_PAGE_SIZE..=32768).contains(&v) && v.is_power_of_two() => Ok(v),
        v => Err(WalError::InvalidPageSize(v)),
    }
}

/// Encodes a page size into the raw field value.
pub fn encode_page_size(page_size: u32) -> Result<u32, WalError> {
    match page_size {
        MAX_PAGE_SIZE => Ok(1),
        v if (MIN_PAGE_SIZE..=32768).contains(&v) && v.is_power_of_two() => Ok(v),
        v => Err(WalError::InvalidPageSize(v)),
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub page_number: u32,
    /// Database size in pages after this commit; 0 for non-commit frames.
    pub db_size_after_commit: u32,
    pub salt: [u32; 2],
    /// Running checksum through this frame.
    pub checksum: [u32; 2],
}

impl FrameHeader {
    /// Decodes a header from the first 24 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WalError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(WalError::MalformedFrame {
                expected: FRAME_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut cur = &buf[..FRAME_HEADER_SIZE];
        Ok(Self {
            page_number: cur.get_u32(),
            db_size_after_commit: cur.get_u32(),
            salt: [cur.get_u32(), cur.get_u32()],
            checksum: [cur.get_u32(), cur.get_u32()],
        })
    }

    /// Returns whether this frame ends a transaction.
    pub fn is_commit(&self) -> bool {
        self.db_size_after_commit != 0
    }
}

/// A complete frame (header + page image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub page: Bytes,
}

/// Encoder/decoder for frames of one page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    page_size: usize,
}

impl FrameCodec {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size as usize,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Size of an encoded frame.
    pub fn frame_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.page_size
    }

    /// Byte offset of frame `frame` (1-based) in the log.
    pub fn frame_offset(&self, frame: FrameNo) -> u64 {
        debug_assert!(frame > 0, "frames are numbered from 1");
        WAL_HEADER_SIZE as u64 + u64::from(frame.saturating_sub(1)) * self.frame_size() as u64
    }

    /// Encodes a frame with the header's stored checksum.
    pub fn encode(&self, header: &FrameHeader, page: &[u8]) -> Result<BytesMut, WalError> {
        if page.len() != self.page_size {
            return Err(WalError::MalformedFrame {
                expected: self.page_size,
                actual: page.len(),
            });
        }

        let mut buf = BytesMut::with_capacity(self.frame_size());
        buf.put_u32(header.page_number);
        buf.put_u32(header.db_size_after_commit);
        buf.put_u32(header.salt[0]);
        buf.put_u32(header.salt[1]);
        buf.put_u32(header.checksum[0]);
        buf.put_u32(header.checksum[1]);
        buf.put_slice(page);
        Ok(buf)
    }

    /// Decodes a frame. The buffer must be exactly one frame long.
    pub fn decode(&self, buf: &[u8]) -> Result<Frame, WalError> {
        let header = self.decode_header(buf)?;
        let page = Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..]);
        Ok(Frame { header, page })
    }

    /// Decodes only the header of an encoded frame.
    pub fn decode_header(&self, buf: &[u8]) -> Result<FrameHeader, WalError> {
        if buf.len() != self.frame_size() {
            return Err(WalError::MalformedFrame {
                expected: self.frame_size(),
                actual: buf.len(),
            });
        }

        FrameHeader::decode(buf)
    }

    /// Builds an encoded frame whose checksum extends `prev`.
    pub fn seal(
        &self,
        page_number: u32,
        db_size_after_commit: u32,
        salt: [u32; 2],
        page: &[u8],
        prev: WalChecksum,
        order: ByteOrder,
    ) -> Result<(FrameHeader, BytesMut), WalError> {
        let mut header = FrameHeader {
            page_number,
            db_size_after_commit,
            salt,
            checksum: [0, 0],
        };
        let mut buf = self.encode(&header, page)?;

        header.checksum = Self::chain(&buf, prev, order).to_array();
        buf[16..20].copy_from_slice(&header.checksum[0].to_be_bytes());
        buf[20..24].copy_from_slice(&header.checksum[1].to_be_bytes());

        Ok((header, buf))
    }

    /// Validates an encoded frame against the running checksum and salt.
    ///
    /// Returns the checksum to chain the next frame from, or `None` if the
    /// frame belongs to another generation or its checksum is wrong.
    pub fn verify(
        &self,
        buf: &[u8],
        salt: [u32; 2],
        prev: WalChecksum,
        order: ByteOrder,
    ) -> Result<Option<WalChecksum>, WalError> {
        let header = self.decode_header(buf)?;
        if header.salt != salt {
            return Ok(None);
        }

        let next = Self::chain(buf, prev, order);
        Ok(next.verify(header.checksum).then_some(next))
    }

    fn chain(buf: &[u8], prev: WalChecksum, order: ByteOrder) -> WalChecksum {
        prev.update(&buf[..8], order)
            .update(&buf[FRAME_HEADER_SIZE..], order)
    }
}
