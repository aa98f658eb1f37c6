//! Execution engine for laboratory instrument control.
//!
//! User code addresses heterogeneous devices as if they were simple
//! synchronous objects; underneath, every interaction is serialized onto a
//! pool of named single-threaded workers that also host richer events
//! producing asynchronous results, notifications, and indexed data streams.
//!
//! The main entry points:
//!
//! - [`Engine`]: worker pool, submission, device registration, shutdown
//! - [`ExecutorEvent`]: unit of work with optional stop/abort/data capabilities
//! - [`ExecutionFuture`]: completion, result/error, notifications, data
//! - [`DeviceProxy`]: transparent serialized access to a registered [`Device`]
//! - [`DataHandler`]: buffered pipeline from producing events to a
//!   [`StorageBackend`]
//!
//! All asynchrony is OS threads plus condition variables; there is no async
//! runtime. The engine is stateless across restarts - persistence lives
//! entirely in storage backends.

pub mod bus;
pub mod config;
pub mod data;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod future;
pub mod notification;

pub use bus::{NotificationFilter, SubscriptionHandle};
pub use config::EngineConfig;
pub use data::coords::{AxisValue, DataCoordinateIterator, DataCoordinates};
pub use data::handler::{DataHandler, Processed};
pub use data::storage::{MemoryStorage, StorageBackend};
pub use data::{DataBuffer, DataItem};
pub use device::proxy::{DeviceOptions, DeviceProxy};
pub use device::{Device, PropertyConstraints, PropertyMap, PropertyValue};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use event::{EventContext, ExecutorEvent};
pub use executor::current_worker;
pub use future::{Capabilities, ExecutionFuture, ExecutionPhase};
pub use notification::{
    Notification, NotificationCategory, WireNotification, DATA_STORED, EVENT_EXECUTED,
    STORAGE_FAILED,
};
