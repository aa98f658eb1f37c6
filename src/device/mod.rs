//! Devices and their dynamic property/method surface.
//!
//! A [`Device`] exposes hardware through named properties and methods rather
//! than a static trait per instrument kind, so the engine can intercept every
//! access uniformly and serialize it onto the device's worker. Strongly-typed
//! wrappers belong in driver crates, layered over [`DeviceProxy`](proxy::DeviceProxy).

pub mod proxy;

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Strongly-typed value for device properties and method arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    FloatArray(Vec<f64>),
    IntArray(Vec<i64>),
    Null,
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(fl) => write!(f, "{}", fl),
            PropertyValue::String(s) => write!(f, "{}", s),
            PropertyValue::FloatArray(arr) => write!(f, "{:?}", arr),
            PropertyValue::IntArray(arr) => write!(f, "{:?}", arr),
            PropertyValue::Null => write!(f, "null"),
        }
    }
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            PropertyValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<Vec<f64>> for PropertyValue {
    fn from(value: Vec<f64>) -> Self {
        PropertyValue::FloatArray(value)
    }
}

impl From<Vec<i64>> for PropertyValue {
    fn from(value: Vec<i64>) -> Self {
        PropertyValue::IntArray(value)
    }
}

/// Read-only view of one property's constraints, gathered from the device's
/// capability hooks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PropertyConstraints {
    /// Finite set of accepted values, when the property is enumerated.
    pub allowed_values: Option<Vec<PropertyValue>>,
    pub read_only: bool,
    /// Inclusive numeric bounds `(low, high)`, when the property is ranged.
    pub limits: Option<(f64, f64)>,
    /// Whether the hardware can drive this property from a trigger signal.
    pub hardware_triggerable: bool,
}

/// A device as the engine sees it: a named object with dynamic properties and
/// methods, plus optional constraint hooks.
///
/// Implementations are plain mutable state; the engine's worker discipline is
/// the only synchronization they need. Methods report failures as
/// `anyhow::Error`, which the proxy re-raises to the caller.
pub trait Device: Send + 'static {
    /// Unique device identifier used for registration and error reporting.
    fn name(&self) -> &str;

    /// Evaluate a property read.
    fn get_property(&mut self, name: &str) -> Result<PropertyValue>;

    /// Perform a property assignment.
    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<()>;

    /// Call a named method.
    fn invoke(&mut self, method: &str, args: &[PropertyValue]) -> Result<PropertyValue>;

    /// Finite accepted value set for a property, if any.
    fn allowed_values(&self, _name: &str) -> Option<Vec<PropertyValue>> {
        None
    }

    fn is_read_only(&self, _name: &str) -> bool {
        false
    }

    /// Inclusive numeric limits for a property, if any.
    fn limits(&self, _name: &str) -> Option<(f64, f64)> {
        None
    }

    fn is_hardware_triggerable(&self, _name: &str) -> bool {
        false
    }
}

/// Property storage helper for simple devices: a name -> value map with
/// per-property read-only flags.
///
/// Driver crates with richer needs keep their own state; this covers mocks
/// and simple instruments.
#[derive(Default)]
pub struct PropertyMap {
    values: HashMap<String, PropertyValue>,
    read_only: HashMap<String, bool>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_read_only(
        mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        let name = name.into();
        self.read_only.insert(name.clone(), true);
        self.values.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Result<PropertyValue> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no property named '{}'", name))
    }

    pub fn set(&mut self, name: &str, value: PropertyValue) -> Result<()> {
        if self.read_only.get(name).copied().unwrap_or(false) {
            anyhow::bail!("property '{}' is read-only", name);
        }
        if !self.values.contains_key(name) {
            anyhow::bail!("no property named '{}'", name);
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.read_only.get(name).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_value_conversions() {
        assert_eq!(PropertyValue::from(3i64).as_i64(), Some(3));
        assert_eq!(PropertyValue::from(2.5).as_f64(), Some(2.5));
        assert_eq!(PropertyValue::from("DAPI").as_str(), Some("DAPI"));
        assert_eq!(PropertyValue::from(7u32), PropertyValue::Int(7));
        assert!(PropertyValue::Null.as_f64().is_none());
    }

    #[test]
    fn test_property_map_read_only() {
        let mut props = PropertyMap::new()
            .with("position", 0.0)
            .with_read_only("serial_number", "A1234");
        assert!(props.set("position", PropertyValue::Float(1.0)).is_ok());
        assert!(props
            .set("serial_number", PropertyValue::from("B9999"))
            .is_err());
        assert!(props.is_read_only("serial_number"));
    }

    #[test]
    fn test_property_map_unknown_name() {
        let mut props = PropertyMap::new().with("gain", 1.0);
        assert!(props.get("exposure").is_err());
        assert!(props.set("exposure", PropertyValue::Float(10.0)).is_err());
    }
}
