//! Typed error hierarchy for the SDK core.
//!
//! Every fallible operation returns [`Result`]. Codec errors carry the progress
//! made before the failure so callers can resume without re-decoding.

use std::time::Duration;

/// All errors originating from the SDK core.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    // ── Arguments ────────────────────────────────────────────────────
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    // ── Codecs ───────────────────────────────────────────────────────
    #[error("Output buffer overflow after consuming {consumed} bytes and producing {produced} bytes")]
    OutputBufferOverflow { consumed: usize, produced: usize },

    #[error("Input buffer too small to hold a single element")]
    InputBufferTooSmall,

    #[error("Frame corrupted: {0}")]
    FrameCorrupted(String),

    #[error("Frame is shared and can no longer be modified")]
    FrameBusy,

    // ── Stream routing ───────────────────────────────────────────────
    #[error("Stream {0} is already claimed by another owner")]
    AlreadyClaimed(String),

    #[error("Stream {0} is not claimed by this owner")]
    NotClaimed(String),

    #[error("Processor of stream {0} is locked")]
    ProcessorLocked(String),

    #[error("Stream {0} is not started")]
    StreamNotStarted(String),

    // ── Properties ───────────────────────────────────────────────────
    #[error("Property {0} is read only")]
    ReadOnly(String),

    #[error("Property {0} is write only")]
    WriteOnly(String),

    #[error("Property {0} not found")]
    PropertyNotFound(String),

    #[error("Property {name} expects a {expected} value")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // ── Devices ──────────────────────────────────────────────────────
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // ── Waiting ──────────────────────────────────────────────────────
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl SdkError {
    /// Whether the caller may simply retry (or supply more room / data).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::OutputBufferOverflow { .. }
                | Self::InputBufferTooSmall
                | Self::FrameCorrupted(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SdkError>;
