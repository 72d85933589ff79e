use serde::{Deserialize, Serialize};

use crate::buffer::ByteBuffer;

/// One captured image or depth map.
///
/// Frames live inside a [`FramePool`](super::pool::FramePool) and are reached
/// through [`FrameHandle`](super::pool::FrameHandle)s.
#[derive(Debug, Default)]
pub struct Frame {
    /// Decoded pixel data
    pub data: ByteBuffer,

    /// Frame metadata
    pub meta: FrameMetadata,
}

/// Frame metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    /// Per-stream frame index, starting at 1
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per line
    pub stride: u32,
    pub format: PixelFormat,
    /// Device timestamp in microseconds
    pub timestamp: u64,
    pub cropping: Option<Cropping>,
    /// Set when decoding hit an inconsistency. The frame is still delivered.
    pub corrupted: bool,
}

impl Frame {
    /// Zeroes the header and rewinds the data cursor. Storage is kept.
    pub fn reset(&mut self) {
        self.data.reset();
        self.meta = FrameMetadata::default();
    }
}

/// Region of interest applied by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cropping {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Depth in millimetres, u16 LE
    #[default]
    Depth1mm,
    /// Raw disparity shift, u16 LE
    Shift,
    Gray8,
    Gray16,
    Rgb888,
    /// U Y0 V Y1 macropixels
    Yuv422,
    /// Y0 U Y1 V macropixels
    Yuyv,
}

impl PixelFormat {
    /// Bytes per pixel. Macropixel formats report the per-pixel average (2).
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Depth1mm
            | PixelFormat::Shift
            | PixelFormat::Gray16
            | PixelFormat::Yuv422
            | PixelFormat::Yuyv => 2,
            PixelFormat::Rgb888 => 3,
        }
    }

    /// Bytes needed for a full `width` x `height` frame.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    pub fn is_depth(self) -> bool {
        matches!(self, PixelFormat::Depth1mm | PixelFormat::Shift)
    }
}

/// Width, height and frame rate of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

impl VideoMode {
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    pub fn stride(&self) -> u32 {
        self.width * self.format.bytes_per_pixel() as u32
    }
}
