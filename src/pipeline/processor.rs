//! Stream processors: assemble packet payloads into pooled frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use flume::TrySendError;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::buffer::ByteBuffer;
use crate::capture::frame::{Cropping, PixelFormat, VideoMode};
use crate::capture::mirror::mirror_in_place;
use crate::capture::pool::{FrameHandle, FramePool};
use crate::codec::color::yuv_to_rgb888;
use crate::codec::packed::{copy_16bit, unpack_11bit};
use crate::codec::{DepthDecoder, ImageDecoder, Progress, ShiftToDepth};
use crate::error::{Result, SdkError};
use crate::pipeline::packet::PacketHeader;
use crate::pipeline::router::{StreamProcessor, StreamResolution};
use crate::pipeline::stream::VideoStream;
use crate::utils::RateLimiter;

const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Wire layout of a stream's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameCodec {
    /// PS nibble-compressed depth
    PsDepth,
    /// 11-bit packed depth
    Packed11,
    /// Uncompressed 16-bit samples
    Raw16,
    /// Nibble-compressed 8-bit image data over 2 or 4 channels
    Image { channels: usize },
    /// Bytes copied as they arrive
    Raw,
    /// YUV422 macropixels converted to RGB888
    YuvToRgb { source: PixelFormat },
}

/// Per-stream options, read once at the start of every frame.
#[derive(Debug, Clone, Default)]
pub struct StreamSettings {
    pub mirror: bool,
    /// Converts shift samples to millimetres when set.
    pub shift_to_depth: Option<Arc<ShiftToDepth>>,
    pub cropping: Option<Cropping>,
}

enum Decoder {
    PsDepth(DepthDecoder),
    Packed11,
    Raw16,
    Image(ImageDecoder),
    Raw,
    YuvToRgb(PixelFormat),
}

impl Decoder {
    fn new(codec: FrameCodec) -> Result<Self> {
        Ok(match codec {
            FrameCodec::PsDepth => Decoder::PsDepth(DepthDecoder::new()),
            FrameCodec::Packed11 => Decoder::Packed11,
            FrameCodec::Raw16 => Decoder::Raw16,
            FrameCodec::Image { channels } => Decoder::Image(ImageDecoder::new(channels)?),
            FrameCodec::Raw => Decoder::Raw,
            FrameCodec::YuvToRgb { source } => {
                if !matches!(source, PixelFormat::Yuv422 | PixelFormat::Yuyv) {
                    return Err(SdkError::Unsupported(format!("{source:?} is not a YUV format")));
                }
                Decoder::YuvToRgb(source)
            }
        })
    }

    /// Element-oriented codecs report "not enough input" as an error; here it
    /// just means nothing was consumed yet.
    fn decode(&mut self, input: &[u8], output: &mut [u8], last_part: bool) -> Result<Progress> {
        let result = match self {
            Decoder::PsDepth(decoder) => decoder.decode(input, output, last_part),
            Decoder::Packed11 => unpack_11bit(input, output),
            Decoder::Raw16 => copy_16bit(input, output),
            Decoder::Image(decoder) => decoder.decode(input, output, last_part),
            Decoder::Raw => {
                let count = input.len().min(output.len());
                output[..count].copy_from_slice(&input[..count]);
                if count < input.len() {
                    Err(SdkError::OutputBufferOverflow {
                        consumed: count,
                        produced: count,
                    })
                } else {
                    Ok(Progress {
                        consumed: count,
                        produced: count,
                    })
                }
            }
            Decoder::YuvToRgb(format) => yuv_to_rgb888(input, output, *format),
        };
        match result {
            Err(SdkError::InputBufferTooSmall) => Ok(Progress::default()),
            other => other,
        }
    }

    fn reset(&mut self) {
        match self {
            Decoder::PsDepth(decoder) => decoder.reset(),
            Decoder::Image(decoder) => decoder.reset(),
            _ => {}
        }
    }
}

/// Counters shared with the return hooks of the frames a processor produced.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub frames: AtomicU64,
    pub corrupted: AtomicU64,
    pub packets_lost: AtomicU64,
    /// Frames abandoned because their end never arrived
    pub dropped: AtomicU64,
    pub truncated: AtomicU64,
    pub recycled: AtomicU64,
}

struct Assembly {
    frame: FrameHandle,
    started: Instant,
    overflowed: bool,
    corrupted: bool,
}

/// Assembles one stream's frames and publishes them to its [`VideoStream`].
pub struct FrameProcessor {
    name: Arc<str>,
    codec: FrameCodec,
    decoder: Decoder,
    mode: VideoMode,
    pool: FramePool,
    stream: VideoStream,
    settings: Arc<ArcSwap<StreamSettings>>,
    frame_settings: Arc<StreamSettings>,
    carry: ByteBuffer,
    current: Option<Assembly>,
    last_packet_id: Option<u16>,
    frame_index: u64,
    timestamp_high: u64,
    last_timestamp: Option<u32>,
    stats: Arc<ProcessorStats>,
    warnings: RateLimiter,
}

impl FrameProcessor {
    /// `mode.format` is the wire format for `Raw`, `Raw16` and image streams;
    /// compressed depth codecs always produce shift or depth samples.
    pub fn new(
        name: impl Into<String>,
        codec: FrameCodec,
        mode: VideoMode,
        pool: FramePool,
        stream: VideoStream,
        settings: Arc<ArcSwap<StreamSettings>>,
    ) -> Result<Self> {
        let name: String = name.into();
        Ok(Self {
            name: Arc::from(name),
            codec,
            decoder: Decoder::new(codec)?,
            mode,
            pool,
            stream,
            frame_settings: settings.load_full(),
            settings,
            carry: ByteBuffer::growable(64),
            current: None,
            last_packet_id: None,
            frame_index: 0,
            timestamp_high: 0,
            last_timestamp: None,
            stats: Arc::new(ProcessorStats::default()),
            warnings: RateLimiter::new(WARN_INTERVAL),
        })
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    pub fn mode(&self) -> VideoMode {
        self.mode
    }

    /// Whether the payload decodes to raw shift samples.
    fn carries_shift(&self) -> bool {
        match self.codec {
            FrameCodec::PsDepth | FrameCodec::Packed11 => true,
            FrameCodec::Raw16 => self.mode.format.is_depth(),
            _ => false,
        }
    }

    /// Pixel format of the frames this processor publishes.
    pub fn output_format(&self) -> PixelFormat {
        if self.carries_shift() {
            return if self.frame_settings.shift_to_depth.is_some() {
                PixelFormat::Depth1mm
            } else {
                PixelFormat::Shift
            };
        }
        match self.codec {
            FrameCodec::YuvToRgb { .. } => PixelFormat::Rgb888,
            _ => self.mode.format,
        }
    }

    fn frame_size(&self) -> usize {
        self.output_format().frame_size(self.mode.width, self.mode.height)
    }

    fn warn_corrupted(&self, reason: &str) {
        if let Some(suppressed) = self.warnings.check() {
            warn!(stream = %self.name, reason, suppressed, "frame corrupted");
        }
    }

    /// Extends the 32-bit device clock across wraparounds.
    fn extend_timestamp(&mut self, timestamp: u32) -> u64 {
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                self.timestamp_high += 1 << 32;
            }
        }
        self.last_timestamp = Some(timestamp);
        self.timestamp_high | timestamp as u64
    }

    fn check_packet_id(&mut self, header: &PacketHeader) {
        let previous = self.last_packet_id.replace(header.packet_id);
        let Some(previous) = previous else {
            return;
        };
        let expected = previous.wrapping_add(1);
        if header.packet_id == expected {
            return;
        }
        let lost = header.packet_id.wrapping_sub(expected) as u64;
        self.stats.packets_lost.fetch_add(lost, Ordering::Relaxed);
        metrics::counter!("perigee_packets_lost", "stream" => self.name.to_string()).increment(lost);
        if let Some(assembly) = self.current.as_mut() {
            assembly.corrupted = true;
            self.warn_corrupted("packet loss");
        }
        debug!(stream = %self.name, expected, got = header.packet_id, "packet id gap");
    }

    /// Decodes `data` (after any carried tail) into the current frame.
    fn decode_chunk(&mut self, data: &[u8], last_part: bool) {
        let frame_size = self.frame_size();
        let Some(assembly) = self.current.as_mut() else {
            return;
        };
        if assembly.overflowed {
            return;
        }

        let from_carry = !self.carry.is_empty();
        if from_carry && self.carry.write(data).is_err() {
            self.carry.reset();
            return;
        }
        let input: &[u8] = if from_carry { self.carry.as_slice() } else { data };
        if input.is_empty() && !last_part {
            return;
        }

        let result = match assembly.frame.write() {
            Ok(mut frame) => {
                let room = frame_size.saturating_sub(frame.data.len());
                let spare = frame.data.spare_mut();
                let room = room.min(spare.len());
                let result = self.decoder.decode(input, &mut spare[..room], last_part);
                let produced = match &result {
                    Ok(progress) => progress.produced,
                    Err(SdkError::OutputBufferOverflow { produced, .. }) => *produced,
                    Err(_) => 0,
                };
                // `produced` never exceeds `room`.
                let _ = frame.data.commit(produced);
                result
            }
            Err(err) => Err(err),
        };

        let consumed = match result {
            Ok(progress) => progress.consumed,
            Err(SdkError::OutputBufferOverflow { .. }) => {
                assembly.overflowed = true;
                assembly.corrupted = true;
                input.len()
            }
            Err(err) => {
                assembly.corrupted = true;
                trace!(stream = %self.name, %err, "chunk decode failed");
                input.len()
            }
        };
        let overflowed = assembly.overflowed;

        if from_carry {
            self.carry.shift_left(consumed);
        } else if consumed < data.len() {
            // Growable, cannot fail.
            let _ = self.carry.write(&data[consumed..]);
        }
        if overflowed {
            self.warn_corrupted("frame larger than expected");
        }
    }

    fn finish_frame(&mut self) {
        self.decode_chunk(&[], true);
        if !self.carry.is_empty() {
            // Whole-element codecs leave a partial element behind.
            self.stats.truncated.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("perigee_codec_truncated_elements", "codec" => "stream").increment(1);
            trace!(stream = %self.name, bytes = self.carry.len(), "dropped trailing partial element");
            self.carry.reset();
        }
        self.decoder.reset();

        let Some(mut assembly) = self.current.take() else {
            return;
        };
        let frame_size = self.frame_size();
        let format = self.output_format();
        let settings = Arc::clone(&self.frame_settings);

        match assembly.frame.write() {
            Ok(mut frame) => {
                if frame.data.len() < frame_size {
                    assembly.corrupted = true;
                    self.warn_corrupted("frame shorter than expected");
                }
                if let Some(table) = settings.shift_to_depth.as_deref() {
                    if self.carries_shift() {
                        table.apply_in_place(frame.data.as_mut_slice());
                    }
                }
                if settings.mirror && !assembly.corrupted {
                    if let Err(err) =
                        mirror_in_place(frame.data.as_mut_slice(), self.mode.width as usize, format)
                    {
                        debug!(stream = %self.name, %err, "mirror skipped");
                    }
                }
                frame.meta.corrupted = assembly.corrupted;
            }
            Err(err) => {
                warn!(stream = %self.name, %err, "frame not writable at end of frame");
            }
        }

        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        if assembly.corrupted {
            self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
        }
        metrics::histogram!("perigee_frame_assembly_seconds", "stream" => self.name.to_string())
            .record(assembly.started.elapsed().as_secs_f64());
        trace!(stream = %self.name, index = self.frame_index, corrupted = assembly.corrupted, "end of frame");
        self.stream.publish(assembly.frame);
    }
}

impl StreamProcessor for FrameProcessor {
    fn start_of_frame(&mut self, header: &PacketHeader) {
        // A gap seen here belongs to the frame being abandoned, not this one.
        self.check_packet_id(header);
        if let Some(unfinished) = self.current.take() {
            // The end of the previous frame never arrived; it is dropped.
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("perigee_frames_dropped", "stream" => self.name.to_string()).increment(1);
            self.warn_corrupted("missing end of frame");
            drop(unfinished);
        }
        self.carry.reset();
        self.decoder.reset();
        self.frame_settings = self.settings.load_full();

        let frame = self.pool.acquire(self.frame_size());
        let stats = Arc::clone(&self.stats);
        let name = Arc::clone(&self.name);
        frame.set_return_hook(Box::new(move |frame| {
            stats.recycled.fetch_add(1, Ordering::Relaxed);
            trace!(stream = %name, index = frame.meta.frame_index, "frame recycled");
        }));

        self.frame_index += 1;
        let timestamp = self.extend_timestamp(header.timestamp);
        let format = self.output_format();
        match frame.write() {
            Ok(mut guard) => {
                guard.meta.frame_index = self.frame_index;
                guard.meta.width = self.mode.width;
                guard.meta.height = self.mode.height;
                guard.meta.stride = self.mode.width * format.bytes_per_pixel() as u32;
                guard.meta.format = format;
                guard.meta.timestamp = timestamp;
                guard.meta.cropping = self.frame_settings.cropping;
            }
            Err(err) => warn!(stream = %self.name, %err, "fresh frame not writable"),
        }
        self.current = Some(Assembly {
            frame,
            started: Instant::now(),
            overflowed: false,
            corrupted: false,
        });
        trace!(stream = %self.name, index = self.frame_index, "start of frame");
    }

    fn process_data(&mut self, header: &PacketHeader, data: &[u8], offset: usize) {
        if offset == 0 && !header.kind.starts_frame() {
            self.check_packet_id(header);
        }
        if !data.is_empty() {
            self.decode_chunk(data, false);
        }
    }

    fn end_of_frame(&mut self, _header: &PacketHeader) {
        self.finish_frame();
    }

    fn configure(&mut self, resolution: &StreamResolution) {
        self.mode.width = resolution.width;
        self.mode.height = resolution.height;
        self.mode.fps = resolution.fps;
        debug!(stream = %self.name, ?resolution, "processor reconfigured");
    }
}

/// A complete debug-channel payload.
#[derive(Debug, Clone)]
pub struct DebugPayload {
    pub channel: u8,
    pub timestamp: u32,
    pub data: Bytes,
}

/// Collects debug-channel frames (GMC and similar) verbatim.
pub struct DebugProcessor {
    buffer: ByteBuffer,
    channel: u8,
    timestamp: u32,
    active: bool,
    sender: flume::Sender<DebugPayload>,
}

impl DebugProcessor {
    /// Payloads are delivered through a channel of `capacity` entries; when it
    /// is full new payloads are dropped.
    pub fn new(capacity: usize) -> (Self, flume::Receiver<DebugPayload>) {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        (
            Self {
                buffer: ByteBuffer::growable(1024),
                channel: 0,
                timestamp: 0,
                active: false,
                sender,
            },
            receiver,
        )
    }
}

impl StreamProcessor for DebugProcessor {
    fn start_of_frame(&mut self, header: &PacketHeader) {
        self.buffer.reset();
        self.channel = header.channel;
        self.timestamp = header.timestamp;
        self.active = true;
    }

    fn process_data(&mut self, _header: &PacketHeader, data: &[u8], _offset: usize) {
        if self.active && self.buffer.write(data).is_err() {
            self.active = false;
        }
    }

    fn end_of_frame(&mut self, _header: &PacketHeader) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let payload = DebugPayload {
            channel: self.channel,
            timestamp: self.timestamp,
            data: self.buffer.to_bytes(),
        };
        match self.sender.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!(channel = self.channel, "debug payload dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_depth;
    use crate::pipeline::packet::{packetize, PacketParser};
    use crate::pipeline::router::{OwnerId, StreamRouter};

    fn depth_mode(width: u32, height: u32) -> VideoMode {
        VideoMode {
            width,
            height,
            fps: 30,
            format: PixelFormat::Shift,
        }
    }

    fn depth_processor(
        width: u32,
        height: u32,
        settings: StreamSettings,
    ) -> (FrameProcessor, VideoStream, FramePool) {
        let pool = FramePool::new(0, 0);
        let stream = VideoStream::new("Depth");
        let processor = FrameProcessor::new(
            "Depth",
            FrameCodec::PsDepth,
            depth_mode(width, height),
            pool.clone(),
            stream.clone(),
            Arc::new(ArcSwap::from_pointee(settings)),
        )
        .unwrap();
        (processor, stream, pool)
    }

    fn feed(processor: &mut FrameProcessor, packets: &[Vec<u8>], cut: usize) {
        let mut parser = PacketParser::new();
        let mut wire = Vec::new();
        for packet in packets {
            wire.extend_from_slice(packet);
        }
        for piece in wire.chunks(cut) {
            parser.feed(piece, |header, chunk, offset| {
                if header.kind.starts_frame() && offset == 0 {
                    processor.start_of_frame(header);
                }
                processor.process_data(header, chunk, offset);
                if header.kind.ends_frame() && offset + chunk.len() == header.buffer_size as usize {
                    processor.end_of_frame(header);
                }
            });
        }
    }

    fn samples(frame: &FrameHandle) -> Vec<u16> {
        frame
            .read()
            .data
            .as_slice()
            .chunks_exact(2)
            .map(|s| u16::from_le_bytes([s[0], s[1]]))
            .collect()
    }

    #[test]
    fn assembles_depth_frame_across_packets() {
        let depth: Vec<u16> = (0..48).map(|i| 500 + (i * 7) % 90).collect();
        let encoded = encode_depth(&depth, 8);
        let packets = packetize(1, &encoded, 7, 0, 1234);

        for cut in [1, 5, 12, 1000] {
            let (mut processor, stream, _pool) = depth_processor(8, 6, StreamSettings::default());
            feed(&mut processor, &packets, cut);
            let frame = stream.try_read_frame().unwrap();
            assert_eq!(samples(&frame), depth, "cut {cut}");
            let meta = frame.read().meta.clone();
            assert!(!meta.corrupted);
            assert_eq!(meta.frame_index, 1);
            assert_eq!(meta.timestamp, 1234);
            assert_eq!(meta.format, PixelFormat::Shift);
            assert_eq!(meta.stride, 16);
        }
    }

    #[test]
    fn lost_packet_marks_frame_corrupted() {
        let depth = vec![700u16; 64];
        let encoded = encode_depth(&depth, 4);
        let mut packets = packetize(1, &encoded, 4, 10, 0);
        assert!(packets.len() > 3);
        packets.remove(1);

        let (mut processor, stream, _pool) = depth_processor(8, 8, StreamSettings::default());
        feed(&mut processor, &packets, 64);
        let frame = stream.try_read_frame().unwrap();
        assert!(frame.read().meta.corrupted);
        assert_eq!(processor.stats().packets_lost.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lost_end_of_frame_spares_the_next_frame() {
        let depth = vec![700u16; 64];
        let encoded = encode_depth(&depth, 4);
        let mut first = packetize(1, &encoded, 4, 0, 0);
        first.pop();
        let next_id = first.len() as u16 + 1;
        let second = packetize(1, &encoded, 4, next_id, 0);

        let (mut processor, stream, _pool) = depth_processor(8, 8, StreamSettings::default());
        feed(&mut processor, &first, 64);
        assert!(stream.try_read_frame().is_none());
        feed(&mut processor, &second, 64);

        let frame = stream.try_read_frame().unwrap();
        assert!(!frame.read().meta.corrupted);
        assert_eq!(samples(&frame), depth);
        let stats = processor.stats();
        assert_eq!(stats.packets_lost.load(Ordering::Relaxed), 1);
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn oversized_frame_is_cut_and_flagged() {
        let depth = vec![900u16; 40];
        let packets = packetize(1, &encode_depth(&depth, 8), 16, 0, 0);
        let (mut processor, stream, _pool) = depth_processor(4, 4, StreamSettings::default());
        feed(&mut processor, &packets, 64);
        let frame = stream.try_read_frame().unwrap();
        assert!(frame.read().meta.corrupted);
        assert_eq!(frame.read().data.len(), 32);
    }

    #[test]
    fn short_frame_is_flagged() {
        let depth = vec![900u16; 10];
        let packets = packetize(1, &encode_depth(&depth, 8), 16, 0, 0);
        let (mut processor, stream, _pool) = depth_processor(4, 4, StreamSettings::default());
        feed(&mut processor, &packets, 64);
        assert!(stream.try_read_frame().unwrap().read().meta.corrupted);
    }

    #[test]
    fn settings_apply_per_frame() {
        let table = Arc::new(ShiftToDepth::from_table((0..2048).map(|s| s * 2).collect()));
        let settings = StreamSettings {
            mirror: true,
            shift_to_depth: Some(table),
            cropping: None,
        };
        let depth: Vec<u16> = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let packets = packetize(1, &encode_depth(&depth, 8), 64, 0, 0);
        let (mut processor, stream, _pool) = depth_processor(4, 2, settings);
        feed(&mut processor, &packets, 64);

        let frame = stream.try_read_frame().unwrap();
        assert_eq!(frame.read().meta.format, PixelFormat::Depth1mm);
        assert_eq!(samples(&frame), vec![8, 6, 4, 2, 16, 14, 12, 10]);
    }

    #[test]
    fn return_hook_counts_recycled_frames() {
        let depth = vec![640u16; 4];
        let (mut processor, stream, pool) = depth_processor(2, 2, StreamSettings::default());
        for id in 0..3u16 {
            feed(&mut processor, &packetize(1, &encode_depth(&depth, 4), 64, id, 0), 64);
        }
        let stats = processor.stats();
        // Two frames replaced in the stream slot, one still held there.
        assert_eq!(stats.recycled.load(Ordering::Relaxed), 2);
        assert_eq!(stats.frames.load(Ordering::Relaxed), 3);
        stream.clear();
        assert_eq!(stats.recycled.load(Ordering::Relaxed), 3);
        assert_eq!(pool.free_count(), pool.len());
    }

    #[test]
    fn packed_stream_keeps_partial_groups() {
        let depth: Vec<u16> = (0..16).map(|i| i * 100).collect();
        let packed = crate::codec::packed::pack_11bit(&depth);
        let packets = packetize(2, &packed, 5, 0, 0);
        let pool = FramePool::new(1, 32);
        let stream = VideoStream::new("Depth");
        let mut processor = FrameProcessor::new(
            "Depth",
            FrameCodec::Packed11,
            depth_mode(4, 4),
            pool,
            stream.clone(),
            Arc::new(ArcSwap::from_pointee(StreamSettings::default())),
        )
        .unwrap();
        feed(&mut processor, &packets, 3);
        let frame = stream.try_read_frame().unwrap();
        assert!(!frame.read().meta.corrupted);
        assert_eq!(samples(&frame), depth);
    }

    #[test]
    fn debug_processor_forwards_payloads_through_router() {
        let router = StreamRouter::new();
        let (processor, receiver) = DebugProcessor::new(4);
        router.register_channel(0x10, "GMC");
        router
            .claim_stream(
                "GMC",
                StreamResolution {
                    width: 0,
                    height: 0,
                    fps: 0,
                },
                OwnerId(1),
            )
            .unwrap();
        router
            .replace_stream_processor("GMC", OwnerId(1), Box::new(processor))
            .unwrap();

        let payload: Vec<u8> = (0..30).collect();
        let mut parser = PacketParser::new();
        for packet in packetize(0x10, &payload, 8, 0, 77) {
            parser.feed(&packet, |header, chunk, offset| {
                router.process_packet_chunk(header, chunk, offset)
            });
        }
        let received = receiver.try_recv().unwrap();
        assert_eq!(received.channel, 0x10);
        assert_eq!(received.timestamp, 77);
        assert_eq!(&received.data[..], &payload[..]);
    }
}
