//! Packet routing, frame assembly and the consumer-facing streams.

pub mod packet;
pub mod processor;
pub mod router;
pub mod stream;
pub mod wait;

pub use packet::{PacketHeader, PacketKind, PacketParser};
pub use processor::{DebugPayload, DebugProcessor, FrameCodec, FrameProcessor, StreamSettings};
pub use router::{OwnerId, OwnerIds, StreamProcessor, StreamResolution, StreamRouter};
pub use stream::{ListenerId, StreamStats, VideoStream};
pub use wait::wait_for_any;
