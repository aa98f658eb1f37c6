//! Data payloads and the pipeline that carries them.
//!
//! Data-producing events hand `(coordinates, payload, metadata)` triples to a
//! [`DataHandler`](handler::DataHandler), which caches them in memory, runs an
//! optional processing stage, and drives a [`StorageBackend`](storage::StorageBackend)
//! from a single writer thread.

pub mod coords;
pub mod handler;
pub mod storage;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use coords::DataCoordinates;

/// Payload buffer stored in its native bit depth.
///
/// Detector data is typically 8-bit or 16-bit unsigned; computed results are
/// floating point. Storing the native representation avoids conversions and
/// keeps the handler's memory accounting honest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DataBuffer {
    /// 8-bit unsigned samples (1 byte/sample)
    U8(Vec<u8>),
    /// 16-bit unsigned samples (2 bytes/sample)
    U16(Vec<u16>),
    /// 64-bit floating point samples (8 bytes/sample)
    F64(Vec<f64>),
}

impl DataBuffer {
    /// Returns samples as f64, zero-copy for the F64 variant.
    pub fn as_f64(&self) -> std::borrow::Cow<'_, [f64]> {
        use std::borrow::Cow;
        match self {
            DataBuffer::U8(data) => Cow::Owned(data.iter().map(|&v| v as f64).collect()),
            DataBuffer::U16(data) => Cow::Owned(data.iter().map(|&v| v as f64).collect()),
            DataBuffer::F64(data) => Cow::Borrowed(data.as_slice()),
        }
    }

    /// Number of samples in the buffer.
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::U8(data) => data.len(),
            DataBuffer::U16(data) => data.len(),
            DataBuffer::F64(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            DataBuffer::U8(data) => data.len(),
            DataBuffer::U16(data) => data.len() * 2,
            DataBuffer::F64(data) => data.len() * 8,
        }
    }
}

impl From<Vec<u8>> for DataBuffer {
    fn from(value: Vec<u8>) -> Self {
        DataBuffer::U8(value)
    }
}

impl From<Vec<u16>> for DataBuffer {
    fn from(value: Vec<u16>) -> Self {
        DataBuffer::U16(value)
    }
}

impl From<Vec<f64>> for DataBuffer {
    fn from(value: Vec<f64>) -> Self {
        DataBuffer::F64(value)
    }
}

/// One addressed piece of data moving through the pipeline. Immutable once
/// submitted to the handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataItem {
    pub coords: DataCoordinates,
    pub data: DataBuffer,
    pub metadata: Value,
}

impl DataItem {
    pub fn new(coords: DataCoordinates, data: impl Into<DataBuffer>, metadata: Value) -> Self {
        Self {
            coords,
            data: data.into(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_memory_accounting() {
        assert_eq!(DataBuffer::U8(vec![0; 16]).memory_bytes(), 16);
        assert_eq!(DataBuffer::U16(vec![0; 16]).memory_bytes(), 32);
        assert_eq!(DataBuffer::F64(vec![0.0; 16]).memory_bytes(), 128);
    }

    #[test]
    fn test_as_f64_is_zero_copy_for_floats() {
        let buf = DataBuffer::F64(vec![1.0, 2.0]);
        assert!(matches!(buf.as_f64(), std::borrow::Cow::Borrowed(_)));

        let buf = DataBuffer::U16(vec![1, 2]);
        assert_eq!(buf.as_f64().as_ref(), &[1.0, 2.0]);
    }
}
