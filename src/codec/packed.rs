//! Uncompressed depth layouts: 11-bit packed groups and plain 16-bit samples.
//!
//! Both consume whole elements only; a trailing partial element stays with the
//! caller for the next chunk.

use super::Progress;
use crate::error::{Result, SdkError};

/// Input bytes per packed group.
pub const PACKED_GROUP_BYTES: usize = 11;
/// Samples per packed group.
pub const PACKED_GROUP_SAMPLES: usize = 8;

/// Unpacks 11-bit samples (eight per 11 bytes, most significant bit first)
/// into little-endian u16 output.
pub fn unpack_11bit(input: &[u8], output: &mut [u8]) -> Result<Progress> {
    if input.len() < PACKED_GROUP_BYTES {
        return Err(SdkError::InputBufferTooSmall);
    }

    let groups_in = input.len() / PACKED_GROUP_BYTES;
    let groups_out = output.len() / (PACKED_GROUP_SAMPLES * 2);
    let groups = groups_in.min(groups_out);

    for (group, dst) in input
        .chunks_exact(PACKED_GROUP_BYTES)
        .zip(output.chunks_exact_mut(PACKED_GROUP_SAMPLES * 2))
        .take(groups)
    {
        let mut acc: u32 = 0;
        let mut bits = 0;
        let mut bytes = group.iter();
        for sample in dst.chunks_exact_mut(2) {
            while bits < 11 {
                // 11 bytes hold exactly 88 bits, eight samples.
                let byte = bytes.next().copied().unwrap_or(0);
                acc = (acc << 8) | byte as u32;
                bits += 8;
            }
            bits -= 11;
            let value = ((acc >> bits) & 0x7FF) as u16;
            acc &= (1 << bits) - 1;
            sample.copy_from_slice(&value.to_le_bytes());
        }
    }

    let progress = Progress {
        consumed: groups * PACKED_GROUP_BYTES,
        produced: groups * PACKED_GROUP_SAMPLES * 2,
    };
    if groups < groups_in {
        return Err(SdkError::OutputBufferOverflow {
            consumed: progress.consumed,
            produced: progress.produced,
        });
    }
    Ok(progress)
}

/// Packs samples into the 11-bit layout. The sample count is padded with
/// zeros to a multiple of eight.
pub fn pack_11bit(samples: &[u16]) -> Vec<u8> {
    let groups = samples.len().div_ceil(PACKED_GROUP_SAMPLES);
    let mut out = Vec::with_capacity(groups * PACKED_GROUP_BYTES);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for index in 0..groups * PACKED_GROUP_SAMPLES {
        let value = samples.get(index).copied().unwrap_or(0) as u32 & 0x7FF;
        acc = (acc << 11) | value;
        bits += 11;
        while bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    out
}

/// Copies whole little-endian 16-bit samples.
pub fn copy_16bit(input: &[u8], output: &mut [u8]) -> Result<Progress> {
    if input.len() < 2 {
        return Err(SdkError::InputBufferTooSmall);
    }
    let whole = input.len() & !1;
    let count = whole.min(output.len() & !1);
    output[..count].copy_from_slice(&input[..count]);
    if count < whole {
        return Err(SdkError::OutputBufferOverflow {
            consumed: count,
            produced: count,
        });
    }
    Ok(Progress {
        consumed: count,
        produced: count,
    })
}
