//! Notification values broadcast by the engine and its components.
//!
//! Notifications are designed to be numerous and lightweight: a category tag,
//! a kind identifier, a short description, an optional JSON payload, and a
//! creation timestamp. They are immutable once created. Large data never rides
//! in a payload; data-producing events hand payloads to the data handler and
//! publish only coordinates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::coords::DataCoordinates;
use crate::error::EngineError;

/// Kind identifier of the terminal notification the executor publishes for
/// every work item.
pub const EVENT_EXECUTED: &str = "EventExecuted";

/// Kind identifier published by the data handler after a payload has been
/// persisted by the storage backend.
pub const DATA_STORED: &str = "DataStored";

/// Kind identifier published when the storage backend or a handler thread
/// fails.
pub const STORAGE_FAILED: &str = "StorageFailed";

/// Broad classification of a notification's source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationCategory {
    /// Lifecycle updates about submitted events.
    Event,
    /// Data has been acquired by a data-producing event.
    Data,
    /// Updates from a storage backend or the data handler.
    Storage,
    /// Updates from a device.
    Device,
}

/// An immutable broadcast message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
    pub category: NotificationCategory,
    /// Concrete subtype identifier, e.g. [`EVENT_EXECUTED`].
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Notification {
    pub fn new(
        category: NotificationCategory,
        kind: impl Into<String>,
        description: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            kind: kind.into(),
            description: description.into(),
            payload,
        }
    }

    /// Terminal notification for a completed work item. The payload carries
    /// the error message on failure and is null on success.
    pub fn event_executed(error: Option<&EngineError>) -> Self {
        Self::new(
            NotificationCategory::Event,
            EVENT_EXECUTED,
            "event has finished executing",
            error.map(|e| Value::String(e.to_string())),
        )
    }

    /// Published after the storage backend confirmed persistence of the
    /// payload at the given coordinates.
    pub fn data_stored(coords: &DataCoordinates) -> Self {
        Self::new(
            NotificationCategory::Storage,
            DATA_STORED,
            "data has been persisted by the storage backend",
            serde_json::to_value(coords).ok(),
        )
    }

    /// Published when a put could not be persisted or a handler thread died.
    pub fn storage_failed(message: &str) -> Self {
        Self::new(
            NotificationCategory::Storage,
            STORAGE_FAILED,
            "storage backend failure",
            Some(Value::String(message.to_string())),
        )
    }

    /// Observability export form with a nanosecond integer timestamp.
    pub fn to_wire(&self) -> WireNotification {
        WireNotification {
            timestamp_ns: self
                .timestamp
                .timestamp_nanos_opt()
                .map(|ns| ns as u64)
                .unwrap_or(0),
            category: self.category,
            kind: self.kind.clone(),
            description: self.description.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Flat wire format for observability exports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireNotification {
    pub timestamp_ns: u64,
    pub category: NotificationCategory,
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_executed_payload() {
        let ok = Notification::event_executed(None);
        assert_eq!(ok.kind, EVENT_EXECUTED);
        assert!(ok.payload.is_none());

        let err = EngineError::execution(anyhow::anyhow!("shutter jammed"));
        let failed = Notification::event_executed(Some(&err));
        let text = failed.payload.expect("payload").to_string();
        assert!(text.contains("shutter jammed"));
    }

    #[test]
    fn test_data_stored_carries_coords() {
        let coords = DataCoordinates::new().with("time", 3);
        let n = Notification::data_stored(&coords);
        assert_eq!(n.category, NotificationCategory::Storage);
        assert_eq!(n.payload.expect("payload")["time"], 3);
    }

    #[test]
    fn test_wire_round_trip() {
        let n = Notification::new(
            NotificationCategory::Device,
            "PositionChanged",
            "stage moved",
            Some(serde_json::json!({"axis": "z"})),
        );
        let wire = n.to_wire();
        assert!(wire.timestamp_ns > 0);
        let json = serde_json::to_string(&wire).expect("serialize");
        let back: WireNotification = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, "PositionChanged");
        assert_eq!(back.category, NotificationCategory::Device);
    }
}
