//! PS compressed depth: 16-bit shift samples coded as 4-bit elements.
//!
//! A chunk may end anywhere. When more data follows, decoding rolls back to
//! the last byte-aligned literal so the next call can restart there without
//! any baseline from the previous call. A full output buffer is different:
//! the decoder keeps the baseline and resumes exactly where it stopped.

use tracing::trace;

use super::nibble::{
    nibble_at, NibbleWriter, DELTA_BIAS, ESCAPE, LARGE_DELTA_BIAS, LARGE_DELTA_FLAG,
    MAX_RUN, MAX_SMALL_DELTA, PAD, RUN,
};
use super::Progress;
use crate::error::{Result, SdkError};

/// Depth value written for pixels without a valid measurement.
pub const NO_DEPTH: u16 = 0;

/// First shift value that can not be represented (15-bit literals).
pub const MAX_SHIFT: i32 = 0x8000;

#[inline]
fn clamp_shift(value: i32) -> u16 {
    if (0..MAX_SHIFT).contains(&value) {
        value as u16
    } else {
        NO_DEPTH
    }
}

/// Where a decode stopped on a full output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resume {
    last: i32,
    /// Copies of `last` still owed to the output.
    pending: usize,
    /// The first byte of the next input had its high nibble decoded already.
    skip_high: bool,
}

/// Streaming decoder for one depth stream.
#[derive(Debug, Default)]
pub struct DepthDecoder {
    resume: Option<Resume>,
    truncated: u64,
}

impl DepthDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trailing elements dropped at end of frame because they were cut short.
    pub fn truncated_elements(&self) -> u64 {
        self.truncated
    }

    /// Forgets any overflow position. Called at frame boundaries.
    pub fn reset(&mut self) {
        self.resume = None;
    }

    /// Decodes `input` into little-endian u16 samples in `output`.
    ///
    /// With `last_part == false` the returned progress stops at the last safe
    /// stopping point; the caller keeps `input[consumed..]` and prepends it to
    /// the next chunk. With `last_part == true` all input is consumed.
    ///
    /// On [`SdkError::OutputBufferOverflow`] everything reported as produced
    /// is valid and the decoder remembers its position: the next call takes
    /// `input[consumed..]` and a fresh output and carries on.
    pub fn decode(&mut self, input: &[u8], output: &mut [u8], last_part: bool) -> Result<Progress> {
        let resumed = self.resume;
        if input.is_empty() && !last_part && resumed.is_none() {
            return Err(SdkError::InputBufferTooSmall);
        }

        let total = input.len() * 2;
        let capacity = output.len() / 2;
        let mut pos = 0;
        let mut out = 0;
        let mut last: i32 = 0;
        // Rolling back to the start of this call keeps the position we came in with.
        let mut safe = Progress::default();
        let mut safe_resume = resumed;
        let mut truncated = false;

        macro_rules! emit {
            ($count:expr) => {{
                let count: usize = $count;
                let room = (capacity - out).min(count);
                let sample = clamp_shift(last).to_le_bytes();
                for slot in output[out * 2..(out + room) * 2].chunks_exact_mut(2) {
                    slot.copy_from_slice(&sample);
                }
                out += room;
                if room < count {
                    self.resume = Some(Resume {
                        last,
                        pending: count - room,
                        skip_high: pos % 2 == 1,
                    });
                    return Err(SdkError::OutputBufferOverflow {
                        consumed: pos / 2,
                        produced: out * 2,
                    });
                }
            }};
        }

        if let Some(resume) = resumed {
            last = resume.last;
            pos = usize::from(resume.skip_high).min(total);
            emit!(resume.pending);
        }

        while pos < total {
            let start = pos;
            let code = nibble_at(input, pos);
            pos += 1;
            match code {
                PAD => {}
                RUN => {
                    if pos >= total {
                        truncated = true;
                        break;
                    }
                    let count = nibble_at(input, pos) as usize + 1;
                    pos += 1;
                    emit!(count);
                }
                ESCAPE => {
                    if pos >= total {
                        truncated = true;
                        break;
                    }
                    let selector = nibble_at(input, pos);
                    if selector & LARGE_DELTA_FLAG != 0 {
                        if pos + 1 >= total {
                            truncated = true;
                            break;
                        }
                        let low = nibble_at(input, pos + 1) as i32;
                        pos += 2;
                        last += (((selector & 0x7) as i32) << 4 | low) - LARGE_DELTA_BIAS;
                    } else {
                        if pos + 3 >= total {
                            truncated = true;
                            break;
                        }
                        if start % 2 == 0 {
                            safe = Progress {
                                consumed: start / 2,
                                produced: out * 2,
                            };
                            safe_resume = None;
                        }
                        last = ((selector & 0x7) as i32) << 12
                            | (nibble_at(input, pos + 1) as i32) << 8
                            | (nibble_at(input, pos + 2) as i32) << 4
                            | nibble_at(input, pos + 3) as i32;
                        pos += 4;
                    }
                    emit!(1);
                }
                delta => {
                    last += delta as i32 - DELTA_BIAS;
                    emit!(1);
                }
            }
        }

        if !last_part {
            self.resume = safe_resume;
            return Ok(safe);
        }
        self.resume = None;
        if truncated {
            self.truncated += 1;
            metrics::counter!("perigee_codec_truncated_elements", "codec" => "depth").increment(1);
            trace!(produced = out * 2, "dropped unterminated trailing depth element");
        }
        Ok(Progress {
            consumed: input.len(),
            produced: out * 2,
        })
    }
}

fn push_literal(writer: &mut NibbleWriter, value: u16) {
    writer.push(ESCAPE);
    writer.push(((value >> 12) & 0x7) as u8);
    writer.push(((value >> 8) & 0xF) as u8);
    writer.push(((value >> 4) & 0xF) as u8);
    writer.push((value & 0xF) as u8);
}

/// Encodes samples in the PS depth format.
///
/// A byte-aligned literal opens the stream and every `literal_interval`
/// samples after it (0 means only the first one), giving the decoder safe
/// stopping points. Samples at or above [`MAX_SHIFT`] are encoded as
/// [`NO_DEPTH`].
pub fn encode_depth(samples: &[u16], literal_interval: usize) -> Vec<u8> {
    let mut writer = NibbleWriter::new();
    let mut last: i32 = 0;
    let is_boundary = |i: usize| i == 0 || (literal_interval > 0 && i % literal_interval == 0);

    let mut i = 0;
    while i < samples.len() {
        let value = clamp_shift(samples[i] as i32);
        if is_boundary(i) {
            writer.align();
            push_literal(&mut writer, value);
            last = value as i32;
            i += 1;
            continue;
        }

        let delta = value as i32 - last;
        if delta == 0 {
            let mut run = 1;
            while run < MAX_RUN
                && i + run < samples.len()
                && !is_boundary(i + run)
                && clamp_shift(samples[i + run] as i32) as i32 == last
            {
                run += 1;
            }
            if run == 1 {
                writer.push(DELTA_BIAS as u8);
            } else {
                writer.push(RUN);
                writer.push((run - 1) as u8);
            }
            i += run;
            continue;
        }

        if delta.abs() <= MAX_SMALL_DELTA {
            writer.push((delta + DELTA_BIAS) as u8);
        } else if (-LARGE_DELTA_BIAS..LARGE_DELTA_BIAS).contains(&delta) {
            let biased = (delta + LARGE_DELTA_BIAS) as u8;
            writer.push(ESCAPE);
            writer.push(LARGE_DELTA_FLAG | biased >> 4);
            writer.push(biased & 0xF);
        } else {
            push_literal(&mut writer, value);
        }
        last = value as i32;
        i += 1;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(count: usize) -> Vec<u16> {
        let mut seed = 0x1234_5678u32;
        let mut value = 800i32;
        (0..count)
            .map(|i| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                let step = match (seed >> 24) % 8 {
                    0 | 1 => 0,
                    2 | 3 => ((seed >> 8) % 13) as i32 - 6,
                    4 => ((seed >> 8) % 128) as i32 - 64,
                    5 => ((seed >> 8) % 4000) as i32 - 2000,
                    _ => 1,
                };
                value = (value + step).clamp(0, 0x7FFF);
                if i % 97 == 0 {
                    0
                } else {
                    value as u16
                }
            })
            .collect()
    }

    fn to_samples(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn decode_all(input: &[u8], capacity: usize) -> Vec<u8> {
        let mut output = vec![0u8; capacity];
        let progress = DepthDecoder::new().decode(input, &mut output, true).unwrap();
        assert_eq!(progress.consumed, input.len());
        output.truncate(progress.produced);
        output
    }

    #[test]
    fn round_trip_single_call() {
        let original = samples(640 * 4);
        let encoded = encode_depth(&original, 640);
        assert!(encoded.len() < original.len() * 2);
        let decoded = decode_all(&encoded, original.len() * 2);
        assert_eq!(to_samples(&decoded), original);
    }

    #[test]
    fn round_trip_without_intermediate_literals() {
        let original = samples(500);
        let decoded = decode_all(&encode_depth(&original, 0), 1000);
        assert_eq!(to_samples(&decoded), original);
    }

    #[test]
    fn split_at_every_byte_matches_single_call() {
        let original = samples(320);
        let encoded = encode_depth(&original, 40);
        let expected = decode_all(&encoded, original.len() * 2);

        for split in 0..=encoded.len() {
            let mut decoder = DepthDecoder::new();
            let mut output = vec![0u8; original.len() * 2];
            let (first, second) = encoded.split_at(split);

            let mut produced = 0;
            let mut carry = Vec::new();
            match decoder.decode(first, &mut output, false) {
                Ok(progress) => {
                    produced = progress.produced;
                    carry.extend_from_slice(&first[progress.consumed..]);
                }
                Err(SdkError::InputBufferTooSmall) => {}
                Err(other) => panic!("split {split}: {other}"),
            }
            carry.extend_from_slice(second);

            let progress = decoder.decode(&carry, &mut output[produced..], true).unwrap();
            assert_eq!(progress.consumed, carry.len());
            output.truncate(produced + progress.produced);
            assert_eq!(output, expected, "split at {split}");
        }
    }

    #[test]
    fn partial_call_rolls_back_to_literal() {
        // literal 100, +1, literal 200 (aligned), +1
        let encoded = [0xF0, 0x06, 0x47, 0xF0, 0x0C, 0x87, 0xDD];
        let mut output = [0u8; 16];
        let progress = DepthDecoder::new().decode(&encoded, &mut output, false).unwrap();
        assert_eq!(progress, Progress { consumed: 3, produced: 4 });
        assert_eq!(to_samples(&output[..4]), vec![100, 101]);
    }

    #[test]
    fn no_safe_point_consumes_nothing() {
        let encoded = [0x77, 0x77];
        let mut output = [0u8; 16];
        let progress = DepthDecoder::new().decode(&encoded, &mut output, false).unwrap();
        assert_eq!(progress, Progress::default());
    }

    #[test]
    fn run_repeats_last_value() {
        for k in 0..16u8 {
            // literal 100, then 0xE k, then pad
            let encoded = [0xF0, 0x06, 0x4E, k << 4 | PAD];
            let decoded = to_samples(&decode_all(&encoded, 64));
            assert_eq!(decoded.len(), 1 + k as usize + 1);
            assert!(decoded.iter().all(|&v| v == 100));
        }
    }

    #[test]
    fn large_delta_and_small_delta() {
        // literal 1000 (F 0 3 E 8), large delta -64 (F 8 0), +6 (C), -6 (0), pad
        let encoded = [0xF0, 0x3E, 0x8F, 0x80, 0xC0, 0xDD];
        let decoded = to_samples(&decode_all(&encoded, 64));
        assert_eq!(decoded, vec![1000, 936, 942, 936]);
    }

    #[test]
    fn overflow_never_writes_past_capacity() {
        let original = samples(200);
        let encoded = encode_depth(&original, 50);
        let mut output = vec![0xEEu8; 400 + 8];
        let err = DepthDecoder::new()
            .decode(&encoded, &mut output[..150], true)
            .unwrap_err();
        match err {
            SdkError::OutputBufferOverflow { produced, consumed } => {
                assert_eq!(produced, 150);
                assert!(consumed < encoded.len());
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(to_samples(&output[..150]), original[..75].to_vec());
        assert!(output[150..].iter().all(|&b| b == 0xEE));
    }

    /// Decodes through windows of `window` bytes, resuming after each overflow.
    fn decode_in_windows(encoded: &[u8], window: usize) -> Vec<u16> {
        let mut decoder = DepthDecoder::new();
        let mut decoded = Vec::new();
        let mut input = encoded;
        loop {
            let mut output = vec![0u8; window];
            match decoder.decode(input, &mut output, true) {
                Ok(progress) => {
                    decoded.extend_from_slice(&output[..progress.produced]);
                    return to_samples(&decoded);
                }
                Err(SdkError::OutputBufferOverflow { consumed, produced }) => {
                    decoded.extend_from_slice(&output[..produced]);
                    input = &input[consumed..];
                }
                Err(other) => panic!("window {window}: {other}"),
            }
        }
    }

    #[test]
    fn overflow_resumes_with_larger_output() {
        let original: Vec<u16> = (1000..=1010).collect();
        let encoded = encode_depth(&original, 0);

        let mut decoder = DepthDecoder::new();
        let mut small = [0u8; 8];
        let (consumed, produced) = match decoder.decode(&encoded, &mut small, true) {
            Err(SdkError::OutputBufferOverflow { consumed, produced }) => (consumed, produced),
            other => panic!("expected overflow, got {other:?}"),
        };
        assert_eq!(produced, 8);

        let mut large = [0u8; 64];
        let progress = decoder.decode(&encoded[consumed..], &mut large, true).unwrap();
        let mut decoded = to_samples(&small[..produced]);
        decoded.extend(to_samples(&large[..progress.produced]));
        assert_eq!(decoded, original);
    }

    #[test]
    fn overflow_resumes_inside_runs_and_odd_nibbles() {
        let mut original = samples(300);
        original.splice(40..40, std::iter::repeat(777).take(37));
        let encoded = encode_depth(&original, 0);
        for window in [2, 4, 6, 10, 32, 98] {
            assert_eq!(decode_in_windows(&encoded, window), original, "window {window}");
        }
    }

    #[test]
    fn reset_forgets_overflow_position() {
        let encoded = encode_depth(&[5, 5, 5, 5], 0);
        let mut decoder = DepthDecoder::new();
        let mut output = [0u8; 2];
        assert!(decoder.decode(&encoded, &mut output, true).is_err());
        decoder.reset();
        let mut output = [0u8; 16];
        let progress = decoder.decode(&encode_depth(&[9], 0), &mut output, true).unwrap();
        assert_eq!(to_samples(&output[..progress.produced]), vec![9]);
    }

    #[test]
    fn out_of_range_values_clamp_to_no_depth() {
        // literal 0x7FFF, +6, literal 0, -1
        let encoded = [0xF7, 0xFF, 0xFC, 0xF0, 0x00, 0x05];
        let decoded = to_samples(&decode_all(&encoded, 64));
        assert_eq!(decoded, vec![0x7FFF, NO_DEPTH, 0, NO_DEPTH]);
    }

    #[test]
    fn truncated_tail_is_dropped_and_counted() {
        // literal 5, then an escape cut after its selector
        let encoded = [0xF0, 0x00, 0x5F, 0x0D];
        let mut decoder = DepthDecoder::new();
        let mut output = [0u8; 16];
        let progress = decoder.decode(&encoded, &mut output, true).unwrap();
        assert_eq!(progress, Progress { consumed: 4, produced: 2 });
        assert_eq!(decoder.truncated_elements(), 1);
    }

    #[test]
    fn empty_partial_input_needs_more_data() {
        let mut output = [0u8; 4];
        assert!(matches!(
            DepthDecoder::new().decode(&[], &mut output, false),
            Err(SdkError::InputBufferTooSmall)
        ));
        let progress = DepthDecoder::new().decode(&[], &mut output, true).unwrap();
        assert_eq!(progress, Progress::default());
    }
}
