//! Connected devices and the drivers that can open them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::{lookup_usb_id, DeviceBackend, DeviceInfo, DeviceState, Driver};
use crate::error::{Result, SdkError};

/// Connectivity change, delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(DeviceInfo),
    Disconnected(String),
    StateChanged { uri: String, state: DeviceState },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub info: DeviceInfo,
    pub state: DeviceState,
}

/// URI table fed by a connectivity event source (USB hotplug, replay).
#[derive(Default)]
pub struct DeviceRegistry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
    devices: Mutex<BTreeMap<String, DeviceRecord>>,
    subscribers: Mutex<Vec<flume::Sender<DeviceEvent>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, BTreeMap<String, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_driver(&self, driver: Arc<dyn Driver>) {
        info!(driver = driver.name(), "driver registered");
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(driver);
    }

    /// Receives every later connectivity event.
    pub fn subscribe(&self) -> flume::Receiver<DeviceEvent> {
        let (sender, receiver) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    fn emit(&self, event: DeviceEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Records a newly attached device. Unknown USB ids are still listed,
    /// with empty vendor and name.
    pub fn device_connected(&self, uri: &str, usb_vendor_id: u16, usb_product_id: u16) -> DeviceInfo {
        let known = lookup_usb_id(usb_vendor_id, usb_product_id);
        let info = DeviceInfo {
            uri: uri.to_string(),
            vendor: known.map(|id| id.vendor.to_string()).unwrap_or_default(),
            name: known.map(|id| id.name.to_string()).unwrap_or_default(),
            usb_vendor_id,
            usb_product_id,
        };
        let replaced = self.devices().insert(
            uri.to_string(),
            DeviceRecord {
                info: info.clone(),
                state: DeviceState::Ok,
            },
        );
        if replaced.is_some() {
            debug!(uri, "device reconnected");
        }
        info!(uri, vendor = %info.vendor, name = %info.name, "device connected");
        self.emit(DeviceEvent::Connected(info.clone()));
        info
    }

    /// Forgets `uri`. Returns whether it was known.
    pub fn device_disconnected(&self, uri: &str) -> bool {
        if self.devices().remove(uri).is_none() {
            return false;
        }
        info!(uri, "device disconnected");
        self.emit(DeviceEvent::Disconnected(uri.to_string()));
        true
    }

    pub fn set_device_state(&self, uri: &str, state: DeviceState) -> Result<()> {
        {
            let mut devices = self.devices();
            let record = devices
                .get_mut(uri)
                .ok_or_else(|| SdkError::DeviceNotFound(uri.to_string()))?;
            if record.state == state {
                return Ok(());
            }
            record.state = state;
        }
        debug!(uri, ?state, "device state changed");
        self.emit(DeviceEvent::StateChanged {
            uri: uri.to_string(),
            state,
        });
        Ok(())
    }

    pub fn device(&self, uri: &str) -> Option<DeviceRecord> {
        self.devices().get(uri).cloned()
    }

    pub fn device_list(&self) -> Vec<DeviceRecord> {
        self.devices().values().cloned().collect()
    }

    /// Opens `uri` with the first driver that accepts it.
    #[tracing::instrument(skip_all, fields(uri = %uri))]
    pub fn open_device(&self, uri: &str) -> Result<Box<dyn DeviceBackend>> {
        let record = self
            .device(uri)
            .ok_or_else(|| SdkError::DeviceNotFound(uri.to_string()))?;
        let driver = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|driver| driver.try_device(&record.info))
            .cloned();
        let Some(driver) = driver else {
            warn!("no driver accepts device");
            return Err(SdkError::Unsupported(format!("no driver for {uri}")));
        };
        info!(driver = driver.name(), "opening device");
        driver.open_device(&record.info)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.device_list())
            .finish()
    }
}
