//! 4-bit element access shared by the compressed codecs.
//!
//! Element grammar (high nibble first within a byte):
//!
//! | nibble      | meaning                                                |
//! |-------------|--------------------------------------------------------|
//! | `0x0..=0xC` | delta `nibble - 6` on the channel baseline             |
//! | `0xD`       | padding, no output                                     |
//! | `0xE n`     | repeat the baseline `n + 1` times                      |
//! | `0xF a ...` | escape: large delta when `a & 0x8`, literal otherwise  |

pub const DELTA_BIAS: i32 = 6;
pub const MAX_SMALL_DELTA: i32 = 6;
pub const PAD: u8 = 0xD;
pub const RUN: u8 = 0xE;
pub const ESCAPE: u8 = 0xF;
/// Escape selector bit for a large delta.
pub const LARGE_DELTA_FLAG: u8 = 0x8;
pub const LARGE_DELTA_BIAS: i32 = 64;
/// Longest run a single `0xE n` element can express.
pub const MAX_RUN: usize = 16;

/// Nibble `index` of `bytes`.
#[inline]
pub fn nibble_at(bytes: &[u8], index: usize) -> u8 {
    let byte = bytes[index / 2];
    if index % 2 == 0 {
        byte >> 4
    } else {
        byte & 0x0F
    }
}

/// Packs nibbles into bytes, high nibble first.
#[derive(Debug, Default)]
pub struct NibbleWriter {
    bytes: Vec<u8>,
    odd: bool,
}

impl NibbleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, nibble: u8) {
        debug_assert!(nibble <= 0xF);
        if self.odd {
            if let Some(last) = self.bytes.last_mut() {
                *last |= nibble & 0x0F;
            }
        } else {
            self.bytes.push(nibble << 4);
        }
        self.odd = !self.odd;
    }

    /// Whether the next nibble starts a new byte.
    pub fn is_aligned(&self) -> bool {
        !self.odd
    }

    /// Pads to a byte boundary.
    pub fn align(&mut self) {
        if self.odd {
            self.push(PAD);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_packs_high_nibble_first() {
        let mut writer = NibbleWriter::new();
        for n in [0x1, 0x2, 0x3] {
            writer.push(n);
        }
        assert!(!writer.is_aligned());
        assert_eq!(writer.finish(), vec![0x12, 0x3D]);
    }

    #[test]
    fn reader_matches_writer() {
        let bytes = [0xAB, 0xCD];
        let nibbles: Vec<u8> = (0..4).map(|i| nibble_at(&bytes, i)).collect();
        assert_eq!(nibbles, vec![0xA, 0xB, 0xC, 0xD]);
    }
}
