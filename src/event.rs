//! Work items: the event trait, capability declarations, and the execution
//! context handed to running events.
//!
//! Capabilities (stoppable, abortable, data-producing) are independent
//! optional declarations on the event, not an inheritance hierarchy. The
//! future checks them at call time and rejects unsupported operations; the
//! executor snapshots them at submission so they cannot change while the item
//! is queued.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::bus::NotificationBus;
use crate::data::coords::{DataCoordinateIterator, DataCoordinates};
use crate::data::handler::DataHandler;
use crate::data::DataBuffer;
use crate::error::{EngineError, EngineResult};
use crate::future::FutureCore;
use crate::notification::Notification;

/// A unit of work executed on exactly one named worker.
///
/// `execute` runs on the worker thread with mutable access to the event. Any
/// error it returns (or panic it raises) is attributed to the item's future;
/// it never kills the worker.
pub trait ExecutorEvent: Send + 'static {
    /// Result delivered through the future. `Clone` because several holders
    /// of the future may each await the result.
    type Output: Clone + Send + 'static;

    fn execute(&mut self, ctx: &EventContext) -> Result<Self::Output>;

    /// Worker this event prefers when the submission names none. Covers both
    /// per-instance and per-type overrides; returning `None` falls through to
    /// device and engine defaults.
    fn preferred_worker(&self) -> Option<&str> {
        None
    }

    /// Notification kinds this event may publish, for introspection.
    fn notification_kinds(&self) -> &'static [&'static str] {
        &[]
    }

    /// Declares that the event polls [`EventContext::is_stop_requested`] and
    /// winds down gracefully when asked.
    fn is_stoppable(&self) -> bool {
        false
    }

    /// Declares that the event polls [`EventContext::is_abort_requested`] and
    /// terminates at the next safe point, discarding partial results.
    fn is_abortable(&self) -> bool {
        false
    }

    /// Handler receiving this event's data. `Some` makes the event
    /// data-producing and enables `await_data` on its future.
    fn data_handler(&self) -> Option<Arc<DataHandler>> {
        None
    }

    /// Coordinates this event will produce, used to validate `await_data`
    /// requests. Only meaningful for data-producing events.
    fn coordinate_iterator(&self) -> Option<DataCoordinateIterator> {
        None
    }

    /// How many times a failing `execute` is re-run before the failure is
    /// recorded.
    fn max_retries(&self) -> u32 {
        0
    }
}

/// Execution-time services available to a running event.
pub struct EventContext {
    core: Arc<FutureCore>,
    bus: NotificationBus,
    handler: Option<Arc<DataHandler>>,
}

impl EventContext {
    pub(crate) fn new(
        core: Arc<FutureCore>,
        bus: NotificationBus,
        handler: Option<Arc<DataHandler>>,
    ) -> Self {
        Self { core, bus, handler }
    }

    /// True once a holder of the future asked for a graceful stop.
    pub fn is_stop_requested(&self) -> bool {
        self.core.stop_requested()
    }

    /// True once a holder of the future asked for an abort.
    pub fn is_abort_requested(&self) -> bool {
        self.core.abort_requested()
    }

    /// Publish a notification to this event's future log and to all bus
    /// subscribers.
    pub fn publish(&self, notification: Notification) {
        self.core.push_notification(notification.clone());
        self.bus.publish(notification);
    }

    /// Hand one produced item to the data handler. Non-blocking; the handler
    /// notifies this event's future as the item moves through the pipeline.
    pub fn put_data(
        &self,
        coords: DataCoordinates,
        data: impl Into<DataBuffer>,
        metadata: Value,
    ) -> EngineResult<()> {
        let handler = self
            .handler
            .as_ref()
            .ok_or(EngineError::CapabilityUnsupported("DataProducing"))?;
        handler.put_with_future(coords, data.into(), metadata, Some(Arc::clone(&self.core)))
    }
}

/// Adapter turning a plain closure into an event with no capabilities and no
/// notifications.
pub(crate) struct CallableEvent<F, R> {
    func: Option<F>,
    _output: PhantomData<fn() -> R>,
}

impl<F, R> CallableEvent<F, R> {
    pub(crate) fn new(func: F) -> Self {
        Self {
            func: Some(func),
            _output: PhantomData,
        }
    }
}

impl<F, R> ExecutorEvent for CallableEvent<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Clone + Send + 'static,
{
    type Output = R;

    fn execute(&mut self, _ctx: &EventContext) -> Result<R> {
        let func = self
            .func
            .take()
            .ok_or_else(|| anyhow!("callable was already executed"))?;
        Ok(func())
    }
}
