//! Typed device and stream properties.
//!
//! A property caches its last known value. Reads and writes go through
//! optional backing objects; a property without a read backing is write-only,
//! one without a write backing is read-only.

mod module;

pub use module::{PropertyModule, PropertySet};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tracing::trace;

use crate::error::{Result, SdkError};

/// Longest string a string property accepts, in bytes.
pub const MAX_STRING_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Int,
    Real,
    Str,
    General,
}

impl PropertyType {
    fn label(self) -> &'static str {
        match self {
            PropertyType::Int => "integer",
            PropertyType::Real => "real",
            PropertyType::Str => "string",
            PropertyType::General => "general",
        }
    }
}

#[derive(Debug, Clone)]
pub enum PropertyValue {
    Int(i64),
    Real(f64),
    Str(String),
    General(Bytes),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyType {
        match self {
            PropertyValue::Int(_) => PropertyType::Int,
            PropertyValue::Real(_) => PropertyType::Real,
            PropertyValue::Str(_) => PropertyType::Str,
            PropertyValue::General(_) => PropertyType::General,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            PropertyValue::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PropertyValue::General(value) => Some(value),
            _ => None,
        }
    }
}

/// Type-specific equality: reals compare bit patterns so NaN equals itself,
/// general buffers compare contents.
impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a == b,
            (PropertyValue::Real(a), PropertyValue::Real(b)) => a.to_bits() == b.to_bits() || a == b,
            (PropertyValue::Str(a), PropertyValue::Str(b)) => a == b,
            (PropertyValue::General(a), PropertyValue::General(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(value) => write!(f, "{value}"),
            PropertyValue::Real(value) => write!(f, "{value}"),
            PropertyValue::Str(value) => f.write_str(value),
            PropertyValue::General(value) => write!(f, "<{} bytes>", value.len()),
        }
    }
}

/// Read backing of a property, typically the device.
pub trait ValueSource: Send + Sync {
    fn read(&self) -> Result<PropertyValue>;
}

/// Write backing of a property.
pub trait ValueSink: Send + Sync {
    fn write(&self, value: &PropertyValue) -> Result<()>;
}

impl<F> ValueSource for F
where
    F: Fn() -> Result<PropertyValue> + Send + Sync,
{
    fn read(&self) -> Result<PropertyValue> {
        self()
    }
}

impl<F> ValueSink for F
where
    F: Fn(&PropertyValue) -> Result<()> + Send + Sync,
{
    fn write(&self, value: &PropertyValue) -> Result<()> {
        self(value)
    }
}

/// Delivered to subscribers when the cached value changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub module: String,
    pub id: u32,
    pub name: String,
    pub value: PropertyValue,
}

type ChangeCallback = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

/// Handle returned by [`Property::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Property {
    module: String,
    id: u32,
    name: String,
    kind: PropertyType,
    /// Exact size of a general buffer.
    size: usize,
    value: RwLock<PropertyValue>,
    source: Option<Box<dyn ValueSource>>,
    sink: Option<Box<dyn ValueSink>>,
    callbacks: Mutex<Vec<(SubscriptionId, ChangeCallback)>>,
    subscribers: Mutex<Vec<(SubscriptionId, flume::Sender<PropertyChange>)>>,
    next_subscription: AtomicU64,
}

impl Property {
    /// A property whose type and initial cached value come from `initial`.
    pub fn new(module: impl Into<String>, id: u32, name: impl Into<String>, initial: PropertyValue) -> Self {
        let size = initial.as_bytes().map_or(0, Bytes::len);
        Self {
            module: module.into(),
            id,
            name: name.into(),
            kind: initial.kind(),
            size,
            value: RwLock::new(initial),
            source: None,
            sink: None,
            callbacks: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn int(module: impl Into<String>, id: u32, name: impl Into<String>, value: i64) -> Self {
        Self::new(module, id, name, PropertyValue::Int(value))
    }

    pub fn real(module: impl Into<String>, id: u32, name: impl Into<String>, value: f64) -> Self {
        Self::new(module, id, name, PropertyValue::Real(value))
    }

    pub fn string(module: impl Into<String>, id: u32, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(module, id, name, PropertyValue::Str(value.into()))
    }

    /// A general buffer property of `size` bytes, zero filled.
    pub fn general(module: impl Into<String>, id: u32, name: impl Into<String>, size: usize) -> Self {
        Self::new(module, id, name, PropertyValue::General(Bytes::from(vec![0u8; size])))
    }

    pub fn with_source(mut self, source: impl ValueSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_sink(mut self, sink: impl ValueSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PropertyType {
        self.kind
    }

    pub fn is_readable(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.sink.is_some()
    }

    fn check(&self, value: &PropertyValue) -> Result<()> {
        if value.kind() != self.kind {
            return Err(SdkError::TypeMismatch {
                name: self.name.clone(),
                expected: self.kind.label(),
            });
        }
        match value {
            PropertyValue::Str(text) if text.len() > MAX_STRING_LENGTH => Err(SdkError::InvalidArgument(
                format!("{}: string of {} bytes exceeds {MAX_STRING_LENGTH}", self.name, text.len()),
            )),
            PropertyValue::General(data) if data.len() != self.size => Err(SdkError::InvalidArgument(
                format!("{}: expected {} bytes, got {}", self.name, self.size, data.len()),
            )),
            _ => Ok(()),
        }
    }

    /// Writes through the sink, then updates the cache.
    pub fn set_value(&self, value: PropertyValue) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Err(SdkError::ReadOnly(self.name.clone()));
        };
        self.check(&value)?;
        sink.write(&value)?;
        self.update_cached(value);
        Ok(())
    }

    /// Reads through the source and refreshes the cache.
    pub fn get_value(&self) -> Result<PropertyValue> {
        let Some(source) = &self.source else {
            return Err(SdkError::WriteOnly(self.name.clone()));
        };
        let value = source.read()?;
        self.check(&value)?;
        self.update_cached(value.clone());
        Ok(value)
    }

    /// Replaces the cached value without touching the backing. Subscribers
    /// are notified when the value actually changed.
    pub fn unsafe_update_value(&self, value: PropertyValue) -> Result<()> {
        self.check(&value)?;
        self.update_cached(value);
        Ok(())
    }

    /// Last known value.
    pub fn cached_value(&self) -> PropertyValue {
        self.value.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_cached(&self, value: PropertyValue) {
        {
            let mut cached = self.value.write().unwrap_or_else(PoisonError::into_inner);
            if *cached == value {
                return;
            }
            *cached = value.clone();
        }
        trace!(module = %self.module, property = %self.name, %value, "property changed");

        let callbacks: Vec<ChangeCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if callbacks.is_empty() && subscribers.is_empty() {
            return;
        }
        let change = PropertyChange {
            module: self.module.clone(),
            id: self.id,
            name: self.name.clone(),
            value,
        };
        // Receivers that were dropped unsubscribe themselves.
        subscribers.retain(|(_, sender)| sender.send(change.clone()).is_ok());
        drop(subscribers);
        for callback in callbacks {
            callback(&change);
        }
    }

    /// Runs `callback` on the updating thread after every change.
    pub fn on_change(&self, callback: impl Fn(&PropertyChange) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    /// Live channel subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Changes as a channel, for consumers on other threads or tasks.
    pub fn subscribe(&self) -> (SubscriptionId, flume::Receiver<PropertyChange>) {
        let (sender, receiver) = flume::unbounded();
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sender));
        (id, receiver)
    }

    /// Records the current value in `set`. General buffers cannot be stored
    /// and write-only properties fail with [`SdkError::WriteOnly`]. A property
    /// without any backing records its cached value.
    pub fn add_to_property_set(&self, set: &mut PropertySet) -> Result<()> {
        if self.kind == PropertyType::General {
            return Err(SdkError::Unsupported(format!(
                "general property {} cannot be added to a property set",
                self.name
            )));
        }
        let value = match (self.is_readable(), self.is_writable()) {
            (true, _) => self.get_value()?,
            (false, true) => return Err(SdkError::WriteOnly(self.name.clone())),
            (false, false) => self.cached_value(),
        };
        set.add(&self.module, self.id, value);
        Ok(())
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("module", &self.module)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("value", &self.cached_value())
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// In-memory backing usable as both source and sink. Clones share the value.
#[derive(Debug, Clone)]
pub struct ValueCell {
    value: Arc<RwLock<PropertyValue>>,
}

impl ValueCell {
    pub fn new(value: PropertyValue) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
        }
    }

    pub fn get(&self) -> PropertyValue {
        self.value.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ValueSource for ValueCell {
    fn read(&self) -> Result<PropertyValue> {
        Ok(self.get())
    }
}

impl ValueSink for ValueCell {
    fn write(&self, value: &PropertyValue) -> Result<()> {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn read_only_and_write_only_are_enforced() {
        let read_only = Property::int("Device", 1, "Serial", 0).with_source(|| -> Result<PropertyValue> { Ok(PropertyValue::Int(42)) });
        assert!(matches!(read_only.set_value(PropertyValue::Int(1)), Err(SdkError::ReadOnly(_))));
        assert_eq!(read_only.get_value().unwrap(), PropertyValue::Int(42));

        let write_only = Property::int("Device", 2, "Reset", 0).with_sink(|_: &PropertyValue| -> Result<()> { Ok(()) });
        assert!(matches!(write_only.get_value(), Err(SdkError::WriteOnly(_))));
        write_only.set_value(PropertyValue::Int(1)).unwrap();
        assert_eq!(write_only.cached_value(), PropertyValue::Int(1));
    }

    #[test]
    fn type_and_bounds_are_checked() {
        let cell = ValueCell::new(PropertyValue::Str(String::new()));
        let name = Property::string("Device", 3, "Name", "")
            .with_source(cell.clone())
            .with_sink(cell);
        assert!(matches!(
            name.set_value(PropertyValue::Int(3)),
            Err(SdkError::TypeMismatch { expected: "string", .. })
        ));
        assert!(name
            .set_value(PropertyValue::Str("x".repeat(MAX_STRING_LENGTH + 1)))
            .is_err());

        let blob = Property::general("Device", 4, "Calibration", 4);
        assert!(blob
            .unsafe_update_value(PropertyValue::General(Bytes::from_static(&[1, 2, 3])))
            .is_err());
        blob.unsafe_update_value(PropertyValue::General(Bytes::from_static(&[1, 2, 3, 4])))
            .unwrap();
    }

    #[test]
    fn subscribers_see_changes_only() {
        let property = Property::real("Depth", 5, "ZeroPlanePixelSize", 0.1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = property.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (_, receiver) = property.subscribe();

        property.unsafe_update_value(PropertyValue::Real(0.2)).unwrap();
        property.unsafe_update_value(PropertyValue::Real(0.2)).unwrap();
        property.unsafe_update_value(PropertyValue::Real(f64::NAN)).unwrap();
        property.unsafe_update_value(PropertyValue::Real(f64::NAN)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(receiver.try_iter().count(), 2);

        property.unsubscribe(id);
        property.unsafe_update_value(PropertyValue::Real(0.3)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_receivers_are_unsubscribed() {
        let property = Property::int("Depth", 8, "FPS", 30);
        let (_, kept) = property.subscribe();
        let (_, gone) = property.subscribe();
        assert_eq!(property.subscriber_count(), 2);
        drop(gone);

        property.unsafe_update_value(PropertyValue::Int(60)).unwrap();
        assert_eq!(property.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap().value, PropertyValue::Int(60));

        let (id, _receiver) = property.subscribe();
        property.unsubscribe(id);
        assert_eq!(property.subscriber_count(), 1);
    }

    #[test]
    fn write_only_properties_stay_out_of_property_sets() {
        let mut set = PropertySet::default();
        let reset = Property::int("Device", 9, "Reset", 0).with_sink(|_: &PropertyValue| -> Result<()> { Ok(()) });
        reset.set_value(PropertyValue::Int(1)).unwrap();
        assert!(matches!(reset.add_to_property_set(&mut set), Err(SdkError::WriteOnly(_))));
        assert!(set.is_empty());
    }

    #[test]
    fn general_buffers_stay_out_of_property_sets() {
        let mut set = PropertySet::default();
        let blob = Property::general("Device", 6, "Blob", 2);
        assert!(matches!(blob.add_to_property_set(&mut set), Err(SdkError::Unsupported(_))));

        let mirror = Property::int("Depth", 7, "Mirror", 1);
        mirror.add_to_property_set(&mut set).unwrap();
        assert_eq!(set.get("Depth", 7), Some(&PropertyValue::Int(1)));
    }
}
