//! Frames, the frame pool and in-place pixel transforms.

pub mod frame;
pub mod mirror;
pub mod pool;

pub use frame::{Cropping, Frame, FrameMetadata, PixelFormat, VideoMode};
pub use pool::{FrameHandle, FramePool, PoolStats};
