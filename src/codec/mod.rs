//! Streaming decoders for the sensor wire formats.

pub mod color;
pub mod depth;
pub mod image;
pub mod nibble;
pub mod packed;
pub mod shift;

pub use depth::{encode_depth, DepthDecoder, NO_DEPTH};
pub use image::{encode_image, ImageDecoder};
pub use shift::{ShiftToDepth, ShiftToDepthConfig};

/// Bytes consumed from the input and produced into the output by one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub consumed: usize,
    pub produced: usize,
}
