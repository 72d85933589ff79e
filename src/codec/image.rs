//! Compressed image codec: the depth nibble grammar over 8-bit samples,
//! interleaved across 2 or 4 channels.
//!
//! Unlike the depth decoder this one keeps its whole state between calls, so
//! every input byte is always consumed. A run that does not fit the output,
//! or a byte whose low nibble is still unprocessed, is carried in the decoder.

use tracing::trace;

use super::nibble::{
    NibbleWriter, DELTA_BIAS, ESCAPE, LARGE_DELTA_BIAS, LARGE_DELTA_FLAG, MAX_RUN,
    MAX_SMALL_DELTA, PAD, RUN,
};
use super::Progress;
use crate::error::{Result, SdkError};

/// A partially read element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Partial {
    #[default]
    Idle,
    Run,
    Escape,
    LargeDelta(u8),
    Literal,
    LiteralLow(u8),
}

/// Decoded output that did not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Backlog {
    #[default]
    None,
    Value(u8),
    Repeat(usize),
}

/// Per-channel baselines and the channel the next element belongs to.
///
/// The channel index always cycles through four slots. With two channels,
/// every value written to slot 1 is copied into slot 3 (line interleave
/// pairing), so slot 3 predicts from the latest slot 1 value.
#[derive(Debug, Clone)]
struct Predictor {
    channels: usize,
    baselines: [u8; 4],
    channel: usize,
}

impl Predictor {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            baselines: [0; 4],
            channel: 0,
        }
    }

    fn predicted(&self) -> u8 {
        self.baselines[self.channel]
    }

    fn update(&mut self, value: u8) {
        self.baselines[self.channel] = value;
        if self.channels == 2 && self.channel == 1 {
            self.baselines[3] = value;
        }
        self.channel = (self.channel + 1) % 4;
    }

    fn reset(&mut self) {
        self.baselines = [0; 4];
        self.channel = 0;
    }
}

#[derive(Debug)]
pub struct ImageDecoder {
    predictor: Predictor,
    partial: Partial,
    backlog: Backlog,
    /// Low nibble of a consumed byte not processed yet.
    held: Option<u8>,
    truncated: u64,
}

impl ImageDecoder {
    /// `channels` must be 2 or 4.
    pub fn new(channels: usize) -> Result<Self> {
        if channels != 2 && channels != 4 {
            return Err(SdkError::InvalidArgument(format!(
                "image codec supports 2 or 4 channels, got {channels}"
            )));
        }
        Ok(Self {
            predictor: Predictor::new(channels),
            partial: Partial::Idle,
            backlog: Backlog::None,
            held: None,
            truncated: 0,
        })
    }

    pub fn channels(&self) -> usize {
        self.predictor.channels
    }

    /// Current baseline of `channel` (0..4).
    pub fn baseline(&self, channel: usize) -> u8 {
        self.predictor.baselines[channel]
    }

    pub fn truncated_elements(&self) -> u64 {
        self.truncated
    }

    /// Clears all per-frame state.
    pub fn reset(&mut self) {
        self.predictor.reset();
        self.partial = Partial::Idle;
        self.backlog = Backlog::None;
        self.held = None;
    }

    /// Decodes as much of `input` as fits into `output`.
    ///
    /// On overflow the error carries how much was consumed and produced; the
    /// next call must pass `input[consumed..]`.
    pub fn decode(&mut self, input: &[u8], output: &mut [u8], last_part: bool) -> Result<Progress> {
        if input.is_empty() && !last_part && self.backlog == Backlog::None && self.held.is_none() {
            return Err(SdkError::InputBufferTooSmall);
        }

        let mut out = 0;
        let overflow = |consumed, produced| SdkError::OutputBufferOverflow { consumed, produced };

        if !self.drain(output, &mut out) {
            return Err(overflow(0, out));
        }
        if let Some(nibble) = self.held.take() {
            if !self.feed(nibble, output, &mut out) {
                return Err(overflow(0, out));
            }
        }

        for (index, &byte) in input.iter().enumerate() {
            if !self.feed(byte >> 4, output, &mut out) {
                self.held = Some(byte & 0x0F);
                return Err(overflow(index + 1, out));
            }
            if !self.feed(byte & 0x0F, output, &mut out) {
                return Err(overflow(index + 1, out));
            }
        }

        if last_part {
            if self.partial != Partial::Idle {
                self.truncated += 1;
                metrics::counter!("perigee_codec_truncated_elements", "codec" => "image")
                    .increment(1);
                trace!(partial = ?self.partial, "dropped unterminated trailing image element");
            }
            self.reset();
        }

        Ok(Progress {
            consumed: input.len(),
            produced: out,
        })
    }

    fn put(&mut self, value: u8, output: &mut [u8], out: &mut usize) -> bool {
        if *out == output.len() {
            return false;
        }
        output[*out] = value;
        *out += 1;
        self.predictor.update(value);
        true
    }

    fn put_or_hold(&mut self, value: u8, output: &mut [u8], out: &mut usize) -> bool {
        if self.put(value, output, out) {
            return true;
        }
        self.backlog = Backlog::Value(value);
        false
    }

    fn repeat(&mut self, count: usize, output: &mut [u8], out: &mut usize) -> bool {
        for done in 0..count {
            let value = self.predictor.predicted();
            if !self.put(value, output, out) {
                self.backlog = Backlog::Repeat(count - done);
                return false;
            }
        }
        true
    }

    fn drain(&mut self, output: &mut [u8], out: &mut usize) -> bool {
        match std::mem::take(&mut self.backlog) {
            Backlog::None => true,
            Backlog::Value(value) => self.put_or_hold(value, output, out),
            Backlog::Repeat(count) => self.repeat(count, output, out),
        }
    }

    /// Processes one nibble. Returns false when output ran out; the pending
    /// output is then in the backlog.
    fn feed(&mut self, nibble: u8, output: &mut [u8], out: &mut usize) -> bool {
        match self.partial {
            Partial::Idle => match nibble {
                PAD => true,
                RUN => {
                    self.partial = Partial::Run;
                    true
                }
                ESCAPE => {
                    self.partial = Partial::Escape;
                    true
                }
                delta => {
                    let value = self
                        .predictor
                        .predicted()
                        .wrapping_add_signed(delta as i8 - DELTA_BIAS as i8);
                    self.put_or_hold(value, output, out)
                }
            },
            Partial::Run => {
                self.partial = Partial::Idle;
                self.repeat(nibble as usize + 1, output, out)
            }
            Partial::Escape => {
                self.partial = if nibble & LARGE_DELTA_FLAG != 0 {
                    Partial::LargeDelta(nibble & 0x7)
                } else {
                    Partial::Literal
                };
                true
            }
            Partial::LargeDelta(high) => {
                self.partial = Partial::Idle;
                let delta = ((high << 4) | nibble) as i32 - LARGE_DELTA_BIAS;
                let value = self.predictor.predicted().wrapping_add_signed(delta as i8);
                self.put_or_hold(value, output, out)
            }
            Partial::Literal => {
                self.partial = Partial::LiteralLow(nibble);
                true
            }
            Partial::LiteralLow(high) => {
                self.partial = Partial::Idle;
                self.put_or_hold((high << 4) | nibble, output, out)
            }
        }
    }
}

/// Encodes interleaved 8-bit samples for an [`ImageDecoder`] with the same
/// channel count.
pub fn encode_image(samples: &[u8], channels: usize) -> Result<Vec<u8>> {
    if channels != 2 && channels != 4 {
        return Err(SdkError::InvalidArgument(format!(
            "image codec supports 2 or 4 channels, got {channels}"
        )));
    }

    let mut writer = NibbleWriter::new();
    let mut predictor = Predictor::new(channels);
    let mut i = 0;
    while i < samples.len() {
        let value = samples[i];
        if value == predictor.predicted() {
            // Repeats can change later predictions (slot 3 follows slot 1).
            let mut ahead = predictor.clone();
            let mut run = 0;
            while run < MAX_RUN && i + run < samples.len() && samples[i + run] == ahead.predicted() {
                ahead.update(ahead.predicted());
                run += 1;
            }
            if run == 1 {
                writer.push(DELTA_BIAS as u8);
            } else {
                writer.push(RUN);
                writer.push((run - 1) as u8);
            }
            predictor = ahead;
            i += run;
            continue;
        }

        let delta = value as i32 - predictor.predicted() as i32;
        if delta.abs() <= MAX_SMALL_DELTA {
            writer.push((delta + DELTA_BIAS) as u8);
        } else if (-LARGE_DELTA_BIAS..LARGE_DELTA_BIAS).contains(&delta) {
            let biased = (delta + LARGE_DELTA_BIAS) as u8;
            writer.push(ESCAPE);
            writer.push(LARGE_DELTA_FLAG | biased >> 4);
            writer.push(biased & 0xF);
        } else {
            writer.push(ESCAPE);
            writer.push(0);
            writer.push(value >> 4);
            writer.push(value & 0xF);
        }
        predictor.update(value);
        i += 1;
    }
    Ok(writer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uyvy_line(width: usize) -> Vec<u8> {
        (0..width / 2)
            .flat_map(|x| {
                let u = 128u8.wrapping_add((x / 8) as u8);
                let y0 = (x * 3 % 256) as u8;
                let v = if x % 40 < 20 { 90 } else { 200 };
                let y1 = y0.wrapping_add(if x % 5 == 0 { 70 } else { 2 });
                [u, y0, v, y1]
            })
            .collect()
    }

    fn decode_whole(input: &[u8], channels: usize, capacity: usize) -> Vec<u8> {
        let mut decoder = ImageDecoder::new(channels).unwrap();
        let mut output = vec![0u8; capacity];
        let progress = decoder.decode(input, &mut output, true).unwrap();
        output.truncate(progress.produced);
        output
    }

    #[test]
    fn four_channel_round_trip() {
        let original: Vec<u8> = (0..4).flat_map(|_| uyvy_line(320)).collect();
        let encoded = encode_image(&original, 4).unwrap();
        assert_eq!(decode_whole(&encoded, 4, original.len()), original);
    }

    #[test]
    fn two_channel_round_trip() {
        let original: Vec<u8> = (0..300u32).map(|i| (i * i / 7 % 251) as u8).collect();
        let encoded = encode_image(&original, 2).unwrap();
        assert_eq!(decode_whole(&encoded, 2, original.len()), original);

        let flat = [40u8, 90, 40, 90, 41, 90, 40, 91];
        let encoded = encode_image(&flat, 2).unwrap();
        assert_eq!(decode_whole(&encoded, 2, flat.len()), flat);
    }

    #[test]
    fn slot_three_predicts_from_slot_one_with_two_channels() {
        // literals 10, 20, 30 for slots 0..3, then a zero delta for slot 3
        let mut writer = NibbleWriter::new();
        for value in [10u8, 20, 30] {
            for nibble in [ESCAPE, 0, value >> 4, value & 0xF] {
                writer.push(nibble);
            }
        }
        writer.push(DELTA_BIAS as u8);
        let encoded = writer.finish();

        assert_eq!(decode_whole(&encoded, 2, 8), vec![10, 20, 30, 20]);
        assert_eq!(decode_whole(&encoded, 4, 8), vec![10, 20, 30, 0]);

        let mut decoder = ImageDecoder::new(2).unwrap();
        let mut output = [0u8; 8];
        decoder.decode(&encoded[..6], &mut output, false).unwrap();
        assert_eq!(decoder.baseline(3), 20);
        assert_eq!(decoder.baseline(1), 20);
    }

    #[test]
    fn byte_splits_match_single_call() {
        let original = uyvy_line(160);
        let encoded = encode_image(&original, 4).unwrap();

        for split in 0..=encoded.len() {
            let mut decoder = ImageDecoder::new(4).unwrap();
            let mut output = vec![0u8; original.len()];
            let (first, second) = encoded.split_at(split);
            let produced = match decoder.decode(first, &mut output, false) {
                Ok(progress) => {
                    assert_eq!(progress.consumed, first.len());
                    progress.produced
                }
                Err(SdkError::InputBufferTooSmall) => 0,
                Err(other) => panic!("split {split}: {other}"),
            };
            let progress = decoder.decode(second, &mut output[produced..], true).unwrap();
            assert_eq!(produced + progress.produced, original.len(), "split {split}");
            assert_eq!(output, original, "split {split}");
        }
    }

    #[test]
    fn overflow_resumes_where_it_stopped() {
        let original = uyvy_line(320);
        let encoded = encode_image(&original, 4).unwrap();
        let mut decoder = ImageDecoder::new(4).unwrap();

        let mut decoded = Vec::new();
        let mut input = &encoded[..];
        loop {
            let mut window = [0u8; 7];
            match decoder.decode(input, &mut window, true) {
                Ok(progress) => {
                    decoded.extend_from_slice(&window[..progress.produced]);
                    break;
                }
                Err(SdkError::OutputBufferOverflow { consumed, produced }) => {
                    assert_eq!(produced, window.len());
                    decoded.extend_from_slice(&window);
                    input = &input[consumed..];
                }
                Err(other) => panic!("{other}"),
            }
        }
        assert_eq!(decoded, original);
    }

    #[test]
    fn run_cycles_channels() {
        // literals 10, 20, 30, 40 then a run of 5
        let mut writer = NibbleWriter::new();
        for value in [10u8, 20, 30, 40] {
            for nibble in [ESCAPE, 0, value >> 4, value & 0xF] {
                writer.push(nibble);
            }
        }
        writer.push(RUN);
        writer.push(4);
        let decoded = decode_whole(&writer.finish(), 4, 64);
        assert_eq!(decoded, vec![10, 20, 30, 40, 10, 20, 30, 40, 10]);
    }

    #[test]
    fn truncated_tail_dropped_at_end_of_frame() {
        let mut decoder = ImageDecoder::new(4).unwrap();
        let mut output = [0u8; 8];
        // +1, then an escape literal missing its low nibble
        let progress = decoder.decode(&[0x7F, 0x0D], &mut output, true).unwrap();
        assert_eq!(progress, Progress { consumed: 2, produced: 1 });
        assert_eq!(decoder.truncated_elements(), 1);
        assert_eq!(decoder.baseline(0), 0);
    }

    #[test]
    fn rejects_bad_channel_count() {
        assert!(ImageDecoder::new(3).is_err());
        assert!(encode_image(&[1, 2, 3], 1).is_err());
    }
}
