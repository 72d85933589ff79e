//! Reference backend for PrimeSense-protocol sensors.
//!
//! The transport pushes raw bytes into [`SensorDevice::feed_packet`]; packets
//! are cut by the parser, routed per channel and assembled by the stream
//! processors installed when a [`SensorStream`] starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use super::{
    DeviceBackend, DeviceInfo, Driver, SensorInfo, SensorType, StreamBackend, UsbId,
    KINECT_USB_IDS, PRIMESENSE_USB_IDS,
};
use crate::capture::frame::VideoMode;
use crate::capture::pool::FramePool;
use crate::codec::{ShiftToDepth, ShiftToDepthConfig};
use crate::error::{Result, SdkError};
use crate::pipeline::packet::PacketParser;
use crate::pipeline::processor::{DebugPayload, DebugProcessor, FrameCodec, FrameProcessor, StreamSettings};
use crate::pipeline::router::{OwnerId, OwnerIds, StreamResolution, StreamRouter};
use crate::pipeline::stream::VideoStream;
use crate::property::{Property, PropertyModule, PropertyValue};
use crate::{StreamConfig, StreamsConfig};

pub const DEPTH_CHANNEL: u8 = 0x01;
pub const IMAGE_CHANNEL: u8 = 0x02;
pub const IR_CHANNEL: u8 = 0x03;
pub const GMC_CHANNEL: u8 = 0x10;

/// Property ids of a sensor device.
pub mod device_property {
    pub const USB_VENDOR_ID: u32 = 1;
    pub const USB_PRODUCT_ID: u32 = 2;
    pub const NAME: u32 = 3;
    pub const SKIPPED_BYTES: u32 = 4;
}

/// Property ids of a sensor stream.
pub mod stream_property {
    pub const MIRROR: u32 = 1;
    pub const RESOLUTION_X: u32 = 2;
    pub const RESOLUTION_Y: u32 = 3;
    pub const FPS: u32 = 4;
    /// Depth streams only
    pub const SHIFT_TO_DEPTH: u32 = 5;
    pub const MIN_DEPTH: u32 = 6;
    pub const MAX_DEPTH: u32 = 7;
}

fn stream_name(sensor: SensorType) -> &'static str {
    match sensor {
        SensorType::Depth => "Depth",
        SensorType::Color => "Image",
        SensorType::Ir => "IR",
    }
}

fn stream_channel(sensor: SensorType) -> u8 {
    match sensor {
        SensorType::Depth => DEPTH_CHANNEL,
        SensorType::Color => IMAGE_CHANNEL,
        SensorType::Ir => IR_CHANNEL,
    }
}

/// Driver for one hardware family speaking the sensor packet protocol.
pub struct SensorDriver {
    name: &'static str,
    usb_ids: &'static [UsbId],
    pool: FramePool,
    owners: OwnerIds,
    streams: StreamsConfig,
}

impl SensorDriver {
    pub fn primesense(pool: FramePool, owners: OwnerIds, streams: StreamsConfig) -> Self {
        Self {
            name: "PS1080",
            usb_ids: PRIMESENSE_USB_IDS,
            pool,
            owners,
            streams,
        }
    }

    /// Kinect sends 11-bit packed depth.
    pub fn kinect(pool: FramePool, owners: OwnerIds, mut streams: StreamsConfig) -> Self {
        streams.depth.codec = FrameCodec::Packed11;
        Self {
            name: "Kinect",
            usb_ids: KINECT_USB_IDS,
            pool,
            owners,
            streams,
        }
    }

    /// Opens `info` as a concrete [`SensorDevice`].
    pub fn open_sensor(&self, info: &DeviceInfo) -> Result<SensorDevice> {
        SensorDevice::new(info.clone(), self.pool.clone(), self.owners.clone(), self.streams.clone())
    }
}

impl Driver for SensorDriver {
    fn name(&self) -> &str {
        self.name
    }

    fn usb_ids(&self) -> &[UsbId] {
        self.usb_ids
    }

    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn DeviceBackend>> {
        Ok(Box::new(self.open_sensor(info)?))
    }
}

/// An opened sensor: packet intake, routing and per-sensor streams.
pub struct SensorDevice {
    info: DeviceInfo,
    router: Arc<StreamRouter>,
    parser: Arc<Mutex<PacketParser>>,
    pool: FramePool,
    owners: OwnerIds,
    streams: StreamsConfig,
    properties: PropertyModule,
    debug_owner: OwnerId,
    debug_payloads: flume::Receiver<DebugPayload>,
    closed: AtomicBool,
}

impl SensorDevice {
    #[tracing::instrument(skip_all, fields(uri = %info.uri))]
    pub fn new(info: DeviceInfo, pool: FramePool, owners: OwnerIds, streams: StreamsConfig) -> Result<Self> {
        let router = Arc::new(StreamRouter::new());
        for sensor in [SensorType::Depth, SensorType::Color, SensorType::Ir] {
            router.register_channel(stream_channel(sensor), stream_name(sensor));
        }
        router.register_channel(GMC_CHANNEL, "GMC");

        let debug_owner = owners.next();
        let (processor, debug_payloads) = DebugProcessor::new(streams.debug_queue);
        router.claim_stream(
            "GMC",
            StreamResolution {
                width: 0,
                height: 0,
                fps: 0,
            },
            debug_owner,
        )?;
        router.replace_stream_processor("GMC", debug_owner, Box::new(processor))?;

        let parser = Arc::new(Mutex::new(PacketParser::new()));
        let properties = PropertyModule::new(info.uri.clone());
        let module = info.uri.as_str();
        let (vendor_id, product_id, name) = (info.usb_vendor_id, info.usb_product_id, info.name.clone());
        properties.add(
            Property::int(module, device_property::USB_VENDOR_ID, "UsbVendorId", vendor_id as i64)
                .with_source(move || -> Result<PropertyValue> { Ok(PropertyValue::Int(vendor_id as i64)) }),
        )?;
        properties.add(
            Property::int(module, device_property::USB_PRODUCT_ID, "UsbProductId", product_id as i64)
                .with_source(move || -> Result<PropertyValue> { Ok(PropertyValue::Int(product_id as i64)) }),
        )?;
        properties.add(
            Property::string(module, device_property::NAME, "Name", name.clone())
                .with_source(move || -> Result<PropertyValue> { Ok(PropertyValue::Str(name.clone())) }),
        )?;
        let counted = Arc::clone(&parser);
        properties.add(
            Property::int(module, device_property::SKIPPED_BYTES, "SkippedBytes", 0).with_source(
                move || -> Result<PropertyValue> {
                    let skipped = counted.lock().unwrap_or_else(PoisonError::into_inner).skipped_bytes();
                    Ok(PropertyValue::Int(skipped as i64))
                },
            ),
        )?;

        info!(vendor = %info.vendor, name = %info.name, "sensor opened");
        Ok(Self {
            info,
            router,
            parser,
            pool,
            owners,
            streams,
            properties,
            debug_owner,
            debug_payloads,
            closed: AtomicBool::new(false),
        })
    }

    /// Feeds transport bytes. Buffers may split packets anywhere.
    pub fn feed_packet(&self, data: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut parser = self.parser.lock().unwrap_or_else(PoisonError::into_inner);
        parser.feed(data, |header, chunk, offset| {
            self.router.process_packet_chunk(header, chunk, offset);
        });
    }

    pub fn router(&self) -> &Arc<StreamRouter> {
        &self.router
    }

    pub fn properties(&self) -> &PropertyModule {
        &self.properties
    }

    /// Debug-channel payloads (GMC and similar).
    pub fn debug_payloads(&self) -> flume::Receiver<DebugPayload> {
        self.debug_payloads.clone()
    }

    fn stream_config(&self, sensor: SensorType) -> &StreamConfig {
        match sensor {
            SensorType::Depth => &self.streams.depth,
            SensorType::Color => &self.streams.image,
            SensorType::Ir => &self.streams.ir,
        }
    }

    /// Creates a stream for `sensor` with its own owner id.
    pub fn open_stream(&self, sensor: SensorType) -> Result<SensorStream> {
        let config = self.stream_config(sensor).clone();
        let shift = (sensor == SensorType::Depth && self.streams.convert_to_depth)
            .then(|| self.streams.shift_to_depth.clone());
        SensorStream::new(
            sensor,
            config,
            shift,
            self.streams.shift_to_depth.clone(),
            Arc::clone(&self.router),
            self.pool.clone(),
            self.owners.next(),
        )
    }
}

impl DeviceBackend for SensorDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn sensors(&self) -> Vec<SensorInfo> {
        [SensorType::Depth, SensorType::Color, SensorType::Ir]
            .into_iter()
            .map(|sensor| SensorInfo {
                sensor,
                modes: vec![self.stream_config(sensor).mode],
            })
            .collect()
    }

    fn create_stream(&self, sensor: SensorType) -> Result<Box<dyn StreamBackend>> {
        Ok(Box::new(self.open_stream(sensor)?))
    }

    fn get_property(&self, id: u32) -> Result<PropertyValue> {
        self.properties.get_value(id)
    }

    fn set_property(&self, id: u32, value: PropertyValue) -> Result<()> {
        self.properties.set_value(id, value)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.router.release_stream("GMC", self.debug_owner);
            info!(uri = %self.info.uri, "sensor closed");
        }
    }
}

impl Drop for SensorDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// State shared between a stream and its property backings.
struct StreamState {
    name: &'static str,
    owner: OwnerId,
    router: Arc<StreamRouter>,
    mode: Mutex<VideoMode>,
    started: AtomicBool,
    settings: Arc<ArcSwap<StreamSettings>>,
    shift_config: Mutex<ShiftToDepthConfig>,
}

impl StreamState {
    fn mode(&self) -> VideoMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a mode change, re-claiming a running stream so its processor
    /// picks up the new resolution.
    fn update_mode(&self, update: impl FnOnce(&mut VideoMode)) -> Result<()> {
        let mode = {
            let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
            update(&mut mode);
            *mode
        };
        if self.started.load(Ordering::Acquire) {
            self.router.claim_stream(self.name, resolution(&mode), self.owner)?;
        }
        Ok(())
    }

    fn rebuild_shift_table(&self) {
        let enabled = self.settings.load().shift_to_depth.is_some();
        if !enabled {
            return;
        }
        let table = Arc::new(ShiftToDepth::new(
            &self.shift_config.lock().unwrap_or_else(PoisonError::into_inner),
        ));
        self.settings.rcu(|settings| StreamSettings {
            shift_to_depth: Some(Arc::clone(&table)),
            ..(**settings).clone()
        });
    }
}

fn resolution(mode: &VideoMode) -> StreamResolution {
    StreamResolution {
        width: mode.width,
        height: mode.height,
        fps: mode.fps,
    }
}

fn positive(name: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| SdkError::InvalidArgument(format!("{name} must be positive, got {value}")))
}

/// An integer property backed by `read`/`write` closures over stream state.
fn int_property<R, W>(module: &str, id: u32, name: &str, read: R, write: W) -> Property
where
    R: Fn() -> i64 + Send + Sync + 'static,
    W: Fn(i64) -> Result<()> + Send + Sync + 'static,
{
    let initial = read();
    Property::int(module, id, name, initial)
        .with_source(move || -> Result<PropertyValue> { Ok(PropertyValue::Int(read())) })
        .with_sink(move |value: &PropertyValue| -> Result<()> {
            // The property checked the type already.
            write(value.as_int().unwrap_or_default())
        })
}

/// One sensor stream. Dropping it stops the stream.
pub struct SensorStream {
    sensor: SensorType,
    codec: FrameCodec,
    state: Arc<StreamState>,
    pool: FramePool,
    video: VideoStream,
    properties: PropertyModule,
}

impl SensorStream {
    fn new(
        sensor: SensorType,
        config: StreamConfig,
        shift_to_depth: Option<ShiftToDepthConfig>,
        shift_config: ShiftToDepthConfig,
        router: Arc<StreamRouter>,
        pool: FramePool,
        owner: OwnerId,
    ) -> Result<Self> {
        let name = stream_name(sensor);
        let settings = Arc::new(ArcSwap::from_pointee(StreamSettings {
            mirror: config.mirror,
            shift_to_depth: shift_to_depth.map(|config| Arc::new(ShiftToDepth::new(&config))),
            cropping: None,
        }));
        let state = Arc::new(StreamState {
            name,
            owner,
            router,
            mode: Mutex::new(config.mode),
            started: AtomicBool::new(false),
            settings,
            shift_config: Mutex::new(shift_config),
        });

        let properties = PropertyModule::new(name);
        let s = Arc::clone(&state);
        let w = Arc::clone(&state);
        properties.add(int_property(
            name,
            stream_property::MIRROR,
            "Mirror",
            move || s.settings.load().mirror as i64,
            move |value| {
                w.settings.rcu(|settings| StreamSettings {
                    mirror: value != 0,
                    ..(**settings).clone()
                });
                Ok(())
            },
        ))?;

        let s = Arc::clone(&state);
        let w = Arc::clone(&state);
        properties.add(int_property(
            name,
            stream_property::RESOLUTION_X,
            "ResolutionX",
            move || s.mode().width as i64,
            move |value| {
                let width = positive("ResolutionX", value)?;
                w.update_mode(|mode| mode.width = width)
            },
        ))?;

        let s = Arc::clone(&state);
        let w = Arc::clone(&state);
        properties.add(int_property(
            name,
            stream_property::RESOLUTION_Y,
            "ResolutionY",
            move || s.mode().height as i64,
            move |value| {
                let height = positive("ResolutionY", value)?;
                w.update_mode(|mode| mode.height = height)
            },
        ))?;

        let s = Arc::clone(&state);
        let w = Arc::clone(&state);
        properties.add(int_property(
            name,
            stream_property::FPS,
            "FPS",
            move || s.mode().fps as i64,
            move |value| {
                let fps = positive("FPS", value)?;
                w.update_mode(|mode| mode.fps = fps)
            },
        ))?;

        if sensor == SensorType::Depth {
            Self::add_depth_properties(&properties, &state)?;
        }

        Ok(Self {
            sensor,
            codec: config.codec,
            state,
            pool,
            video: VideoStream::new(name),
            properties,
        })
    }

    fn add_depth_properties(properties: &PropertyModule, state: &Arc<StreamState>) -> Result<()> {
        let name = state.name;

        let s = Arc::clone(state);
        let w = Arc::clone(state);
        properties.add(int_property(
            name,
            stream_property::SHIFT_TO_DEPTH,
            "ShiftToDepth",
            move || s.settings.load().shift_to_depth.is_some() as i64,
            move |value| {
                let table = (value != 0).then(|| {
                    Arc::new(ShiftToDepth::new(
                        &w.shift_config.lock().unwrap_or_else(PoisonError::into_inner),
                    ))
                });
                w.settings.rcu(|settings| StreamSettings {
                    shift_to_depth: table.clone(),
                    ..(**settings).clone()
                });
                Ok(())
            },
        ))?;

        let s = Arc::clone(state);
        let w = Arc::clone(state);
        properties.add(int_property(
            name,
            stream_property::MIN_DEPTH,
            "MinDepth",
            move || s.shift_config.lock().unwrap_or_else(PoisonError::into_inner).min_depth as i64,
            move |value| {
                let min_depth = u32::try_from(value)
                    .map_err(|_| SdkError::InvalidArgument(format!("MinDepth out of range: {value}")))?;
                w.shift_config.lock().unwrap_or_else(PoisonError::into_inner).min_depth = min_depth;
                w.rebuild_shift_table();
                Ok(())
            },
        ))?;

        let s = Arc::clone(state);
        let w = Arc::clone(state);
        properties.add(int_property(
            name,
            stream_property::MAX_DEPTH,
            "MaxDepth",
            move || s.shift_config.lock().unwrap_or_else(PoisonError::into_inner).max_depth as i64,
            move |value| {
                let max_depth = positive("MaxDepth", value)?;
                w.shift_config.lock().unwrap_or_else(PoisonError::into_inner).max_depth = max_depth;
                w.rebuild_shift_table();
                Ok(())
            },
        ))?;
        Ok(())
    }

    pub fn sensor(&self) -> SensorType {
        self.sensor
    }

    pub fn name(&self) -> &'static str {
        self.state.name
    }

    pub fn owner(&self) -> OwnerId {
        self.state.owner
    }

    pub fn mode(&self) -> VideoMode {
        self.state.mode()
    }

    pub fn properties(&self) -> &PropertyModule {
        &self.properties
    }
}

impl StreamBackend for SensorStream {
    #[tracing::instrument(skip_all, fields(stream = self.state.name))]
    fn start(&mut self) -> Result<()> {
        if self.state.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let state = &self.state;
        let mode = state.mode();
        state.router.claim_stream(state.name, resolution(&mode), state.owner)?;
        let installed = FrameProcessor::new(
            state.name,
            self.codec,
            mode,
            self.pool.clone(),
            self.video.clone(),
            Arc::clone(&state.settings),
        )
        .and_then(|processor| {
            state
                .router
                .replace_stream_processor(state.name, state.owner, Box::new(processor))
        });
        if let Err(err) = installed {
            state.router.release_stream(state.name, state.owner);
            return Err(err);
        }
        state.started.store(true, Ordering::Release);
        info!(?mode, codec = ?self.codec, "stream started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.state.started.swap(false, Ordering::AcqRel) {
            self.state.router.release_stream(self.state.name, self.state.owner);
            debug!(stream = self.state.name, "stream stopped");
        }
    }

    fn is_started(&self) -> bool {
        self.state.started.load(Ordering::Acquire)
    }

    fn get_property(&self, id: u32) -> Result<PropertyValue> {
        self.properties.get_value(id)
    }

    fn set_property(&self, id: u32, value: PropertyValue) -> Result<()> {
        self.properties.set_value(id, value)
    }

    fn video_stream(&self) -> &VideoStream {
        &self.video
    }
}

impl Drop for SensorStream {
    fn drop(&mut self) {
        self.stop();
    }
}
