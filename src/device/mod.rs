//! Driver plugin boundary and device connectivity.
//!
//! A [`Driver`] recognises devices by USB id or URI and opens them as
//! [`DeviceBackend`]s; each device hands out [`StreamBackend`]s for its
//! sensors. [`sensor`] holds the reference implementation built on the
//! packet pipeline.

pub mod registry;
pub mod sensor;

pub use registry::{DeviceEvent, DeviceRecord, DeviceRegistry};
pub use sensor::{SensorDevice, SensorDriver, SensorStream};

use serde::{Deserialize, Serialize};

use crate::capture::frame::VideoMode;
use crate::capture::pool::FrameHandle;
use crate::error::Result;
use crate::pipeline::stream::{ListenerId, VideoStream};
use crate::property::PropertyValue;

/// One USB vendor/product pair a driver answers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub vendor: &'static str,
    pub name: &'static str,
}

pub const PRIMESENSE_VENDOR_ID: u16 = 0x1d27;
pub const MICROSOFT_VENDOR_ID: u16 = 0x045e;

/// PrimeSense sensor family.
pub const PRIMESENSE_USB_IDS: &[UsbId] = &[
    UsbId {
        vendor_id: PRIMESENSE_VENDOR_ID,
        product_id: 0x0500,
        vendor: "PrimeSense",
        name: "PS1080",
    },
    UsbId {
        vendor_id: PRIMESENSE_VENDOR_ID,
        product_id: 0x0600,
        vendor: "PrimeSense",
        name: "PS1080",
    },
    UsbId {
        vendor_id: PRIMESENSE_VENDOR_ID,
        product_id: 0x0601,
        vendor: "PrimeSense",
        name: "Carmine 1.09",
    },
    UsbId {
        vendor_id: PRIMESENSE_VENDOR_ID,
        product_id: 0x0609,
        vendor: "PrimeSense",
        name: "Carmine 1.09",
    },
];

/// Kinect for Xbox 360.
pub const KINECT_USB_IDS: &[UsbId] = &[UsbId {
    vendor_id: MICROSOFT_VENDOR_ID,
    product_id: 0x02ae,
    vendor: "Microsoft",
    name: "Kinect",
}];

/// Looks a vendor/product pair up in the known tables.
pub fn lookup_usb_id(vendor_id: u16, product_id: u16) -> Option<&'static UsbId> {
    PRIMESENSE_USB_IDS
        .iter()
        .chain(KINECT_USB_IDS)
        .find(|id| id.vendor_id == vendor_id && id.product_id == product_id)
}

/// Identity of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub uri: String,
    pub vendor: String,
    pub name: String,
    pub usb_vendor_id: u16,
    pub usb_product_id: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Ok,
    Error,
    NotReady,
    Resetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    Depth,
    Color,
    Ir,
}

/// A sensor and the modes it can stream in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorInfo {
    pub sensor: SensorType,
    pub modes: Vec<VideoMode>,
}

/// Hardware family plugin.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn usb_ids(&self) -> &[UsbId];

    /// Whether this driver can open `info`. Defaults to a USB id match.
    fn try_device(&self, info: &DeviceInfo) -> bool {
        self.usb_ids()
            .iter()
            .any(|id| id.vendor_id == info.usb_vendor_id && id.product_id == info.usb_product_id)
    }

    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn DeviceBackend>>;
}

/// An opened device.
pub trait DeviceBackend: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn sensors(&self) -> Vec<SensorInfo>;

    fn create_stream(&self, sensor: SensorType) -> Result<Box<dyn StreamBackend>>;

    fn get_property(&self, id: u32) -> Result<PropertyValue>;

    fn set_property(&self, id: u32, value: PropertyValue) -> Result<()>;

    /// Stops delivering data. Streams created earlier stop producing frames.
    fn close(&self);
}

/// One sensor stream of an opened device.
pub trait StreamBackend: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn is_started(&self) -> bool;

    fn get_property(&self, id: u32) -> Result<PropertyValue>;

    fn set_property(&self, id: u32, value: PropertyValue) -> Result<()>;

    /// Consumer side of the stream.
    fn video_stream(&self) -> &VideoStream;

    fn add_frame_listener(&self) -> (ListenerId, flume::Receiver<FrameHandle>) {
        self.video_stream().add_frame_listener()
    }

    fn remove_frame_listener(&self, id: ListenerId) -> bool {
        self.video_stream().remove_frame_listener(id)
    }
}
