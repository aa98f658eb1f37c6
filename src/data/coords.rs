//! Coordinates identifying a point in an N-dimensional experimental space.
//!
//! A [`DataCoordinates`] is a small ordered mapping from axis name to axis
//! value, e.g. `{time: 3, channel: "DAPI", z: 0}`. Axis order is preserved for
//! display and iteration but is *not* part of identity: two coordinates with
//! the same (name, value) pairs in different orders are equal and hash
//! identically, so they can key the data handler's tables interchangeably.
//!
//! [`DataCoordinateIterator`] describes the sequence of coordinates an event
//! will produce. It may be finite (a concrete list), counting (an infinite
//! single-axis ramp, the conventional default for open-ended streams), or lazy
//! (an opaque generator about which nothing can be proven).

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Value of a single axis: an integer index or a symbolic name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AxisValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Int(v) => write!(f, "{}", v),
            AxisValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for AxisValue {
    fn from(value: i64) -> Self {
        AxisValue::Int(value)
    }
}

impl From<i32> for AxisValue {
    fn from(value: i32) -> Self {
        AxisValue::Int(value as i64)
    }
}

impl From<u32> for AxisValue {
    fn from(value: u32) -> Self {
        AxisValue::Int(value as i64)
    }
}

impl From<u64> for AxisValue {
    fn from(value: u64) -> Self {
        AxisValue::Int(value as i64)
    }
}

impl From<usize> for AxisValue {
    fn from(value: usize) -> Self {
        AxisValue::Int(value as i64)
    }
}

impl From<&str> for AxisValue {
    fn from(value: &str) -> Self {
        AxisValue::Str(value.to_string())
    }
}

impl From<String> for AxisValue {
    fn from(value: String) -> Self {
        AxisValue::Str(value)
    }
}

impl Serialize for AxisValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AxisValue::Int(v) => serializer.serialize_i64(*v),
            AxisValue::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for AxisValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AxisValueVisitor;

        impl<'de> Visitor<'de> for AxisValueVisitor {
            type Value = AxisValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or a string")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<AxisValue, E> {
                Ok(AxisValue::Int(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<AxisValue, E> {
                Ok(AxisValue::Int(v as i64))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<AxisValue, E> {
                Ok(AxisValue::Str(v.to_string()))
            }
        }

        deserializer.deserialize_any(AxisValueVisitor)
    }
}

/// Ordered axis-name to axis-value mapping identifying one piece of data.
#[derive(Clone, Debug, Default)]
pub struct DataCoordinates {
    axes: Vec<(String, AxisValue)>,
}

impl DataCoordinates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style axis addition.
    pub fn with(mut self, axis: impl Into<String>, value: impl Into<AxisValue>) -> Self {
        self.insert(axis, value);
        self
    }

    /// Add an axis, or replace the value of an existing axis of the same
    /// name. Axes can be added after construction.
    pub fn insert(&mut self, axis: impl Into<String>, value: impl Into<AxisValue>) {
        let axis = axis.into();
        let value = value.into();
        if let Some(slot) = self.axes.iter_mut().find(|(name, _)| *name == axis) {
            slot.1 = value;
        } else {
            self.axes.push((axis, value));
        }
    }

    pub fn get(&self, axis: &str) -> Option<&AxisValue> {
        self.axes
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value)
    }

    pub fn contains_axis(&self, axis: &str) -> bool {
        self.get(axis).is_some()
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Iterate pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AxisValue)> {
        self.axes.iter().map(|(name, value)| (name.as_str(), value))
    }

    fn sorted_pairs(&self) -> Vec<(&str, &AxisValue)> {
        let mut pairs: Vec<_> = self
            .axes
            .iter()
            .map(|(name, value)| (name.as_str(), value))
            .collect();
        pairs.sort();
        pairs
    }
}

impl PartialEq for DataCoordinates {
    fn eq(&self, other: &Self) -> bool {
        self.sorted_pairs() == other.sorted_pairs()
    }
}

impl Eq for DataCoordinates {}

impl Hash for DataCoordinates {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for pair in self.sorted_pairs() {
            pair.hash(state);
        }
    }
}

impl PartialOrd for DataCoordinates {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataCoordinates {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sorted_pairs().cmp(&other.sorted_pairs())
    }
}

impl fmt::Display for DataCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>, V: Into<AxisValue>> FromIterator<(K, V)> for DataCoordinates {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut coords = DataCoordinates::new();
        for (axis, value) in iter {
            coords.insert(axis, value);
        }
        coords
    }
}

impl Serialize for DataCoordinates {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.axes.len()))?;
        for (name, value) in &self.axes {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DataCoordinates {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CoordsVisitor;

        impl<'de> Visitor<'de> for CoordsVisitor {
            type Value = DataCoordinates;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of axis names to integer or string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut coords = DataCoordinates::new();
                while let Some((name, value)) = access.next_entry::<String, AxisValue>()? {
                    coords.insert(name, value);
                }
                Ok(coords)
            }
        }

        deserializer.deserialize_map(CoordsVisitor)
    }
}

/// Sequence of coordinates an event will produce, finite or not.
pub struct DataCoordinateIterator {
    backing: Backing,
}

enum Backing {
    Finite { coords: Vec<DataCoordinates>, cursor: usize },
    Counting { axis: String, next: i64 },
    Lazy(Box<dyn Iterator<Item = DataCoordinates> + Send>),
}

impl DataCoordinateIterator {
    /// A concrete, finite list of coordinates.
    pub fn finite(coords: impl IntoIterator<Item = DataCoordinates>) -> Self {
        Self {
            backing: Backing::Finite {
                coords: coords.into_iter().collect(),
                cursor: 0,
            },
        }
    }

    /// A single coordinate.
    pub fn single(coords: DataCoordinates) -> Self {
        Self::finite([coords])
    }

    /// The conventional open-ended stream: `{axis: 0}, {axis: 1}, ...`.
    pub fn counting(axis: impl Into<String>) -> Self {
        Self {
            backing: Backing::Counting {
                axis: axis.into(),
                next: 0,
            },
        }
    }

    /// An opaque generator. Nothing can be proven about its output, so
    /// [`may_produce`](Self::may_produce) always answers "unknown".
    pub fn lazy(iter: impl Iterator<Item = DataCoordinates> + Send + 'static) -> Self {
        Self {
            backing: Backing::Lazy(Box::new(iter)),
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self.backing, Backing::Finite { .. })
    }

    /// Total sequence length, when known.
    pub fn len(&self) -> Option<usize> {
        match &self.backing {
            Backing::Finite { coords, .. } => Some(coords.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Could `target` appear somewhere in this sequence? `Some(answer)` when
    /// decidable without enumerating past already-seen entries, `None` when
    /// the backing is an opaque generator.
    pub fn may_produce(&self, target: &DataCoordinates) -> Option<bool> {
        match &self.backing {
            Backing::Finite { coords, .. } => Some(coords.iter().any(|c| c == target)),
            Backing::Counting { axis, .. } => {
                if target.len() != 1 {
                    return Some(false);
                }
                match target.get(axis) {
                    Some(AxisValue::Int(v)) => Some(*v >= 0),
                    _ => Some(false),
                }
            }
            Backing::Lazy(_) => None,
        }
    }
}

impl Iterator for DataCoordinateIterator {
    type Item = DataCoordinates;

    fn next(&mut self) -> Option<DataCoordinates> {
        match &mut self.backing {
            Backing::Finite { coords, cursor } => {
                let item = coords.get(*cursor).cloned();
                if item.is_some() {
                    *cursor += 1;
                }
                item
            }
            Backing::Counting { axis, next } => {
                let item = DataCoordinates::new().with(axis.clone(), *next);
                *next += 1;
                Some(item)
            }
            Backing::Lazy(iter) => iter.next(),
        }
    }
}

impl fmt::Debug for DataCoordinateIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backing {
            Backing::Finite { coords, .. } => {
                write!(f, "DataCoordinateIterator(finite, {} items)", coords.len())
            }
            Backing::Counting { axis, .. } => {
                write!(f, "DataCoordinateIterator(counting '{}')", axis)
            }
            Backing::Lazy(_) => write!(f, "DataCoordinateIterator(lazy)"),
        }
    }
}
