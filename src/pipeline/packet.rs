//! Sensor protocol packet header.
//!
//! Layout, little endian, 12 bytes:
//!
//! | offset | field       |
//! |--------|-------------|
//! | 0      | magic `RB`  |
//! | 2      | type        |
//! | 4      | packet id   |
//! | 6      | buffer size |
//! | 8      | timestamp   |
//!
//! The type's high byte names the channel, its low byte the packet kind.

use crate::error::{Result, SdkError};

pub const PACKET_MAGIC: u16 = 0x4252;
pub const HEADER_SIZE: usize = 12;

/// What a packet carries within its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    StartOfFrame,
    DataChunk,
    EndOfFrame,
    /// A whole frame in one packet.
    SingleFrame,
    Debug,
    Other(u8),
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => PacketKind::StartOfFrame,
            0x01 => PacketKind::DataChunk,
            0x02 => PacketKind::EndOfFrame,
            0x03 => PacketKind::SingleFrame,
            0x10 => PacketKind::Debug,
            other => PacketKind::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            PacketKind::StartOfFrame => 0x00,
            PacketKind::DataChunk => 0x01,
            PacketKind::EndOfFrame => 0x02,
            PacketKind::SingleFrame => 0x03,
            PacketKind::Debug => 0x10,
            PacketKind::Other(byte) => byte,
        }
    }

    pub fn starts_frame(self) -> bool {
        matches!(self, PacketKind::StartOfFrame | PacketKind::SingleFrame)
    }

    pub fn ends_frame(self) -> bool {
        matches!(self, PacketKind::EndOfFrame | PacketKind::SingleFrame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel: u8,
    pub kind: PacketKind,
    pub packet_id: u16,
    /// Declared payload size of the whole packet.
    pub buffer_size: u16,
    /// Device clock, microseconds.
    pub timestamp: u32,
}

impl PacketHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SdkError::BufferTooSmall {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let word = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let magic = word(0);
        if magic != PACKET_MAGIC {
            return Err(SdkError::InvalidArgument(format!("bad packet magic {magic:#06x}")));
        }
        let packet_type = word(2);
        Ok(Self {
            channel: (packet_type >> 8) as u8,
            kind: PacketKind::from_byte(packet_type as u8),
            packet_id: word(4),
            buffer_size: word(6),
            timestamp: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let packet_type = (self.channel as u16) << 8 | self.kind.to_byte() as u16;
        out[0..2].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        out[2..4].copy_from_slice(&packet_type.to_le_bytes());
        out[4..6].copy_from_slice(&self.packet_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.buffer_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}

/// Splits a frame payload into protocol packets of at most `max_payload`
/// bytes. Used by replay sources and tests.
pub fn packetize(
    channel: u8,
    payload: &[u8],
    max_payload: usize,
    first_packet_id: u16,
    timestamp: u32,
) -> Vec<Vec<u8>> {
    let max_payload = max_payload.clamp(1, u16::MAX as usize);
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[][..]]
    } else {
        payload.chunks(max_payload).collect()
    };
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let kind = match (index == 0, index + 1 == count) {
                (true, true) => PacketKind::SingleFrame,
                (true, false) => PacketKind::StartOfFrame,
                (false, true) => PacketKind::EndOfFrame,
                (false, false) => PacketKind::DataChunk,
            };
            let header = PacketHeader {
                channel,
                kind,
                packet_id: first_packet_id.wrapping_add(index as u16),
                buffer_size: chunk.len() as u16,
                timestamp,
            };
            let mut packet = header.to_bytes().to_vec();
            packet.extend_from_slice(chunk);
            packet
        })
        .collect()
}

/// Cuts a raw transport byte stream into packet chunks.
///
/// Transport buffers may end anywhere, including inside a header. Bytes that
/// do not start with the magic are skipped until the stream resynchronises.
#[derive(Debug, Default)]
pub struct PacketParser {
    header: [u8; HEADER_SIZE],
    header_len: usize,
    current: Option<PacketHeader>,
    offset: usize,
    skipped: u64,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes dropped while looking for a packet header.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Feeds transport bytes; `sink` gets `(header, chunk, offset)` for every
    /// piece of payload, in order.
    pub fn feed<F>(&mut self, mut data: &[u8], mut sink: F)
    where
        F: FnMut(&PacketHeader, &[u8], usize),
    {
        while !data.is_empty() {
            let Some(header) = self.current else {
                let take = (HEADER_SIZE - self.header_len).min(data.len());
                self.header[self.header_len..self.header_len + take].copy_from_slice(&data[..take]);
                self.header_len += take;
                data = &data[take..];
                if self.header_len < HEADER_SIZE {
                    break;
                }
                match PacketHeader::parse(&self.header) {
                    Ok(header) if header.buffer_size == 0 => {
                        sink(&header, &[], 0);
                        self.header_len = 0;
                    }
                    Ok(header) => {
                        self.current = Some(header);
                        self.offset = 0;
                        self.header_len = 0;
                    }
                    Err(_) => {
                        self.header.copy_within(1.., 0);
                        self.header_len -= 1;
                        self.skipped += 1;
                    }
                }
                continue;
            };

            let remaining = header.buffer_size as usize - self.offset;
            let take = remaining.min(data.len());
            sink(&header, &data[..take], self.offset);
            self.offset += take;
            data = &data[take..];
            if self.offset == header.buffer_size as usize {
                self.current = None;
            }
        }
    }
}
