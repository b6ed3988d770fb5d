//! Running two-word checksum.
//!
//! Input is consumed as pairs of 32-bit words `(a, b)`:
//!
//! ```text
//! s0 = s0 + a + s1
//! s1 = s1 + b + s0
//! ```
//!
//! with wrapping arithmetic. The word byte order is fixed per WAL generation
//! and recorded in the low bit of the header magic.

use serde::{Deserialize, Serialize};

/// Byte order used to interpret checksum words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// The host's byte order.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    fn read_u32(self, word: &[u8]) -> u32 {
        let bytes = [word[0], word[1], word[2], word[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Running checksum state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalChecksum {
    pub s0: u32,
    pub s1: u32,
}

impl WalChecksum {
    /// Starts a checksum from a seed (the previous frame's or the header's).
    pub const fn new(seed: [u32; 2]) -> Self {
        Self {
            s0: seed[0],
            s1: seed[1],
        }
    }

    /// Extends the checksum over `data`.
    ///
    /// `data.len()` must be a multiple of 8.
    #[must_use]
    pub fn update(self, data: &[u8], order: ByteOrder) -> Self {
        debug_assert_eq!(data.len() % 8, 0, "checksum input must be 8-byte aligned");

        let mut s0 = self.s0;
        let mut s1 = self.s1;
        for pair in data.chunks_exact(8) {
            s0 = s0.wrapping_add(order.read_u32(&pair[..4])).wrapping_add(s1);
            s1 = s1.wrapping_add(order.read_u32(&pair[4..])).wrapping_add(s0);
        }

        Self { s0, s1 }
    }

    /// Returns true if this state equals a stored checksum.
    pub fn verify(&self, expected: [u32; 2]) -> bool {
        self.to_array() == expected
    }

    pub const fn to_array(self) -> [u32; 2] {
        [self.s0, self.s1]
    }
}

impl From<[u32; 2]> for WalChecksum {
    fn from(seed: [u32; 2]) -> Self {
        Self::new(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        let data = [0, 0, 0, 1, 0, 0, 0, 2];

        let big = WalChecksum::default().update(&data, ByteOrder::Big);
        assert_eq!(big.to_array(), [1, 3]);

        let little = WalChecksum::default().update(&data, ByteOrder::Little);
        assert_eq!(little.to_array(), [0x0100_0000, 0x0300_0000]);
    }

    #[test]
    fn test_seed_feeds_first_step() {
        let data = [0u8; 8];
        let sum = WalChecksum::new([5, 7]).update(&data, ByteOrder::Big);
        // s0 = 5 + 0 + 7, s1 = 7 + 0 + 12
        assert_eq!(sum.to_array(), [12, 19]);
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let data = [0xff; 8];
        let sum = WalChecksum::new([u32::MAX, u32::MAX]).update(&data, ByteOrder::Big);
        let s0 = u32::MAX.wrapping_add(u32::MAX).wrapping_add(u32::MAX);
        let s1 = u32::MAX.wrapping_add(u32::MAX).wrapping_add(s0);
        assert_eq!(sum.to_array(), [s0, s1]);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..64u8).collect();
        let whole = WalChecksum::default().update(&data, ByteOrder::Little);
        let split = WalChecksum::default()
            .update(&data[..24], ByteOrder::Little)
            .update(&data[24..], ByteOrder::Little);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        let expected = WalChecksum::default()
            .update(&data, ByteOrder::Big)
            .to_array();

        for byte in [0usize, 1, 511, 1023] {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[byte] ^= 1 << bit;
                let sum = WalChecksum::default().update(&flipped, ByteOrder::Big);
                assert!(!sum.verify(expected), "flip at {byte}:{bit} went unnoticed");
            }
        }
    }

    #[test]
    fn test_native_is_default() {
        assert_eq!(ByteOrder::default(), ByteOrder::native());
    }
}
