pub mod buffer;
pub mod capture;
pub mod codec;
pub mod context;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod profiler;
pub mod property;
pub mod utils;

use std::path::Path;

use capture::frame::{PixelFormat, VideoMode};
use codec::ShiftToDepthConfig;
use config::{Environment, File, FileFormat};
use pipeline::processor::FrameCodec;
use serde::{Deserialize, Serialize};

pub use context::SdkContext;
pub use error::{Result, SdkError};

/// SDK configuration. Held by [`SdkContext`] and swappable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub streams: StreamsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Frames allocated up front
    pub preallocate: usize,
    /// Data capacity of preallocated frames, in bytes
    pub frame_capacity: usize,
}

/// How one sensor stream is decoded and presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub mode: VideoMode,
    pub codec: FrameCodec,
    pub mirror: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub depth: StreamConfig,
    pub image: StreamConfig,
    pub ir: StreamConfig,
    /// Publish depth in millimetres instead of raw shift
    pub convert_to_depth: bool,
    pub shift_to_depth: ShiftToDepthConfig,
    /// Debug payloads buffered before new ones are dropped
    pub debug_queue: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
    pub enable_profiling: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            preallocate: 6,
            frame_capacity: 640 * 480 * 2,
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        let vga = |format| VideoMode {
            width: 640,
            height: 480,
            fps: 30,
            format,
        };
        Self {
            depth: StreamConfig {
                mode: vga(PixelFormat::Shift),
                codec: FrameCodec::PsDepth,
                mirror: false,
            },
            image: StreamConfig {
                mode: vga(PixelFormat::Yuv422),
                codec: FrameCodec::Image { channels: 4 },
                mirror: false,
            },
            ir: StreamConfig {
                mode: vga(PixelFormat::Gray16),
                codec: FrameCodec::Raw16,
                mirror: false,
            },
            convert_to_depth: true,
            shift_to_depth: ShiftToDepthConfig::default(),
            debug_queue: 8,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "perigee=info".to_string(),
            enable_profiling: false,
        }
    }
}

impl Config {
    /// Layers defaults, the optional TOML file at `path` and `PERIGEE_*`
    /// environment variables (`PERIGEE_POOL__PREALLOCATE=12`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("PERIGEE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_survive_loading() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.streams.depth.codec, FrameCodec::PsDepth);
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pool]\npreallocate = 2\n\n[logging]\nfilter = \"perigee=trace\"\n\n[streams]\nconvert_to_depth = false"
        )
        .unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.pool.preallocate, 2);
        assert_eq!(config.pool.frame_capacity, PoolConfig::default().frame_capacity);
        assert_eq!(config.logging.filter, "perigee=trace");
        assert!(!config.streams.convert_to_depth);
    }
}
