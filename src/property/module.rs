use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use config::{ConfigError, File, FileFormat};
use tracing::{debug, info};

use super::{Property, PropertyType, PropertyValue};
use crate::error::{Result, SdkError};

/// Snapshot of property values, module name -> property id -> value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertySet {
    modules: BTreeMap<String, BTreeMap<u32, PropertyValue>>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces one value.
    pub fn add(&mut self, module: &str, id: u32, value: PropertyValue) {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(id, value);
    }

    pub fn get(&self, module: &str, id: u32) -> Option<&PropertyValue> {
        self.modules.get(module)?.get(&id)
    }

    pub fn remove(&mut self, module: &str, id: u32) -> Option<PropertyValue> {
        let values = self.modules.get_mut(module)?;
        let removed = values.remove(&id);
        if values.is_empty() {
            self.modules.remove(module);
        }
        removed
    }

    pub fn module(&self, module: &str) -> Option<&BTreeMap<u32, PropertyValue>> {
        self.modules.get(module)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Number of values across all modules.
    pub fn len(&self) -> usize {
        self.modules.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Properties of one device or stream, grouped under a module name.
#[derive(Debug)]
pub struct PropertyModule {
    name: String,
    properties: RwLock<BTreeMap<u32, Arc<Property>>>,
}

impl PropertyModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `property`; ids are unique within the module.
    pub fn add(&self, property: Property) -> Result<Arc<Property>> {
        let mut properties = self.properties.write().unwrap_or_else(PoisonError::into_inner);
        if properties.contains_key(&property.id()) {
            return Err(SdkError::InvalidArgument(format!(
                "{}: property id {} registered twice",
                self.name,
                property.id()
            )));
        }
        let property = Arc::new(property);
        properties.insert(property.id(), Arc::clone(&property));
        Ok(property)
    }

    pub fn get(&self, id: u32) -> Result<Arc<Property>> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| SdkError::PropertyNotFound(format!("{}/{id}", self.name)))
    }

    pub fn find(&self, name: &str) -> Result<Arc<Property>> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|property| property.name() == name)
            .cloned()
            .ok_or_else(|| SdkError::PropertyNotFound(format!("{}/{name}", self.name)))
    }

    pub fn properties(&self) -> Vec<Arc<Property>> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn set_value(&self, id: u32, value: PropertyValue) -> Result<()> {
        self.get(id)?.set_value(value)
    }

    pub fn get_value(&self, id: u32) -> Result<PropertyValue> {
        self.get(id)?.get_value()
    }

    /// Records every property that can be read back. General and write-only
    /// properties are skipped.
    pub fn add_to_property_set(&self, set: &mut PropertySet) -> Result<()> {
        for property in self.properties() {
            if property.kind() == PropertyType::General || (property.is_writable() && !property.is_readable()) {
                continue;
            }
            property.add_to_property_set(set)?;
        }
        Ok(())
    }

    /// Applies the values of `set` that belong to this module through their
    /// write backings.
    pub fn apply_property_set(&self, set: &PropertySet) -> Result<()> {
        let Some(values) = set.module(&self.name) else {
            return Ok(());
        };
        for (&id, value) in values {
            self.set_value(id, value.clone())?;
        }
        Ok(())
    }

    /// Applies the section named after this module from an INI file.
    ///
    /// Keys are property names, matched case-insensitively. Missing keys are
    /// skipped. Returns how many properties were set.
    pub fn load_ini(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let ini = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()?;

        let mut applied = 0;
        for property in self.properties() {
            let key = format!("{}.{}", self.name, property.name());
            let lookup = |key: &str| match property.kind() {
                PropertyType::Int => ini.get_int(key).map(PropertyValue::Int),
                PropertyType::Real => ini.get_float(key).map(PropertyValue::Real),
                PropertyType::Str => ini.get_string(key).map(PropertyValue::Str),
                PropertyType::General => Err(ConfigError::NotFound(key.to_string())),
            };
            let value = match lookup(&key) {
                Err(ConfigError::NotFound(_)) => lookup(&key.to_lowercase()),
                other => other,
            };
            match value {
                Ok(value) => {
                    property.set_value(value)?;
                    applied += 1;
                }
                Err(ConfigError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if applied > 0 {
            info!(module = %self.name, applied, path = %path.display(), "properties loaded");
        } else {
            debug!(module = %self.name, path = %path.display(), "no properties in file");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::ValueCell;

    fn writable_int(module: &str, id: u32, name: &str, value: i64) -> Property {
        let cell = ValueCell::new(PropertyValue::Int(value));
        Property::int(module, id, name, value)
            .with_source(cell.clone())
            .with_sink(cell)
    }

    #[test]
    fn ids_are_unique() {
        let module = PropertyModule::new("Depth");
        module.add(writable_int("Depth", 1, "Mirror", 0)).unwrap();
        assert!(module.add(writable_int("Depth", 1, "Other", 0)).is_err());
        assert!(matches!(module.get(9), Err(SdkError::PropertyNotFound(_))));
        assert_eq!(module.find("Mirror").unwrap().id(), 1);
    }

    #[test]
    fn property_set_round_trips_through_module() {
        let module = PropertyModule::new("Depth");
        module.add(writable_int("Depth", 1, "Mirror", 1)).unwrap();
        module.add(writable_int("Depth", 2, "MaxDepth", 4000)).unwrap();
        module.add(Property::general("Depth", 3, "Blob", 8)).unwrap();
        module
            .add(Property::int("Depth", 4, "Reset", 0).with_sink(|_: &PropertyValue| -> Result<()> { Ok(()) }))
            .unwrap();

        let mut set = PropertySet::new();
        module.add_to_property_set(&mut set).unwrap();
        assert_eq!(set.len(), 2);

        set.add("Depth", 2, PropertyValue::Int(3000));
        set.add("Image", 1, PropertyValue::Int(5));
        module.apply_property_set(&set).unwrap();
        assert_eq!(module.get_value(2).unwrap(), PropertyValue::Int(3000));

        assert_eq!(set.remove("Image", 1), Some(PropertyValue::Int(5)));
        assert_eq!(set.modules().collect::<Vec<_>>(), vec!["Depth"]);
    }
}
