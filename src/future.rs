//! Futures bound to submitted work items.
//!
//! Every submission returns an [`ExecutionFuture`] sharing a [`FutureCore`]
//! with the executor. The core is the synchronization point between exactly
//! one producer (the worker thread that runs the item) and any number of
//! consumers: it holds the completion phase, the recorded outcome, the
//! per-future notification log, and the cooperative stop/abort flags.
//!
//! Phases move monotonically: `Pending -> Running -> (Succeeded | Failed |
//! Stopped | Aborted)`. Once terminal, neither the phase nor the recorded
//! result/error ever changes; stop and abort requests racing with completion
//! cannot un-complete a future.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::data::coords::{DataCoordinateIterator, DataCoordinates};
use crate::data::handler::DataHandler;
use crate::data::DataBuffer;
use crate::error::{EngineError, EngineResult};
use crate::notification::Notification;

/// Where a work item is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Aborted,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionPhase::Pending | ExecutionPhase::Running)
    }
}

/// Optional facets an event declared at submission time. Checked by the
/// future before honoring capability-specific calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub stoppable: bool,
    pub abortable: bool,
    pub data_producing: bool,
}

struct CoreState {
    phase: ExecutionPhase,
    error: Option<EngineError>,
    notifications: Vec<Notification>,
}

/// Untyped shared state between a work item and its future(s).
pub(crate) struct FutureCore {
    caps: Capabilities,
    stop_requested: AtomicBool,
    abort_requested: AtomicBool,
    state: Mutex<CoreState>,
    completed: Condvar,
    notified: Condvar,
}

impl FutureCore {
    pub(crate) fn new(caps: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            caps,
            stop_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            state: Mutex::new(CoreState {
                phase: ExecutionPhase::Pending,
                error: None,
                notifications: Vec::new(),
            }),
            completed: Condvar::new(),
            notified: Condvar::new(),
        })
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub(crate) fn phase(&self) -> ExecutionPhase {
        self.state.lock().phase
    }

    pub(crate) fn error(&self) -> Option<EngineError> {
        self.state.lock().error.clone()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock();
        if state.phase == ExecutionPhase::Pending {
            state.phase = ExecutionPhase::Running;
        }
    }

    /// Record the terminal phase and outcome. A second call is ignored, which
    /// keeps the phase machine monotonic no matter how completion races with
    /// cancellation.
    pub(crate) fn complete(&self, phase: ExecutionPhase, error: Option<EngineError>) {
        debug_assert!(phase.is_terminal());
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return;
        }
        state.phase = phase;
        state.error = error;
        self.completed.notify_all();
    }

    /// Append to the per-future notification log and wake waiters.
    pub(crate) fn push_notification(&self, notification: Notification) {
        let mut state = self.state.lock();
        state.notifications.push(notification);
        self.notified.notify_all();
    }

    fn wait_terminal(&self, timeout: Option<Duration>) -> EngineResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !state.phase.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.completed.wait_until(&mut state, deadline).timed_out()
                        && !state.phase.is_terminal()
                    {
                        return Err(EngineError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.completed.wait(&mut state),
            }
        }
        Ok(())
    }

    fn wait_notification(
        &self,
        kind: &str,
        timeout: Option<Duration>,
    ) -> EngineResult<Notification> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(found) = state.notifications.iter().find(|n| n.kind == kind) {
                return Ok(found.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.notified.wait_until(&mut state, deadline).timed_out()
                        && !state.notifications.iter().any(|n| n.kind == kind)
                    {
                        return Err(EngineError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.notified.wait(&mut state),
            }
        }
    }

    /// Snapshot of the notification log, in publication order.
    pub(crate) fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.clone()
    }
}

/// Handle to one submitted work item.
///
/// Cloneable and shareable across threads; all clones observe the same
/// underlying state.
pub struct ExecutionFuture<T> {
    core: Arc<FutureCore>,
    result: Arc<Mutex<Option<T>>>,
    handler: Option<Arc<DataHandler>>,
    coords: Option<Arc<DataCoordinateIterator>>,
}

impl<T> Clone for ExecutionFuture<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            result: Arc::clone(&self.result),
            handler: self.handler.clone(),
            coords: self.coords.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ExecutionFuture<T> {
    pub(crate) fn new(
        core: Arc<FutureCore>,
        result: Arc<Mutex<Option<T>>>,
        handler: Option<Arc<DataHandler>>,
        coords: Option<Arc<DataCoordinateIterator>>,
    ) -> Self {
        Self {
            core,
            result,
            handler,
            coords,
        }
    }

    /// Block until the item is terminal. Returns the result on success and
    /// re-raises the recorded error on failure.
    pub fn await_execution(&self, timeout: Option<Duration>) -> EngineResult<T> {
        self.core.wait_terminal(timeout)?;
        if let Some(err) = self.core.error() {
            return Err(err);
        }
        let result = self.result.lock();
        Ok(result
            .clone()
            .expect("terminal future without error is missing its result - internal invariant violated"))
    }

    pub fn is_execution_complete(&self) -> bool {
        self.core.phase().is_terminal()
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.core.phase()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.core.capabilities()
    }

    /// Block until a notification of exactly this kind has been recorded on
    /// this future. Returns immediately if one already was.
    pub fn await_notification(
        &self,
        kind: &str,
        timeout: Option<Duration>,
    ) -> EngineResult<Notification> {
        self.core.wait_notification(kind, timeout)
    }

    /// Snapshot of this future's notification log, in publication order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.core.notifications()
    }

    /// Request a graceful wind-down. The event observes the request through
    /// [`EventContext::is_stop_requested`](crate::event::EventContext::is_stop_requested).
    pub fn stop(&self, await_completion: bool) -> EngineResult<()> {
        if !self.core.capabilities().stoppable {
            return Err(EngineError::CapabilityUnsupported("Stoppable"));
        }
        self.core.request_stop();
        if await_completion {
            self.core.wait_terminal(None)?;
        }
        Ok(())
    }

    /// Request termination at the next safe point, discarding partial
    /// results.
    pub fn abort(&self, await_completion: bool) -> EngineResult<()> {
        if !self.core.capabilities().abortable {
            return Err(EngineError::CapabilityUnsupported("Abortable"));
        }
        self.core.request_abort();
        if await_completion {
            self.core.wait_terminal(None)?;
        }
        Ok(())
    }

    /// Block until the event's data at `coords` is available, in memory or
    /// persisted, and return the requested pieces.
    ///
    /// Only valid for data-producing events. Coordinates the event's iterator
    /// proves impossible fail fast with `UnknownCoordinates`.
    pub fn await_data(
        &self,
        coords: &DataCoordinates,
        return_data: bool,
        return_metadata: bool,
        timeout: Option<Duration>,
    ) -> EngineResult<(Option<DataBuffer>, Option<Value>)> {
        let handler = self
            .handler
            .as_ref()
            .ok_or(EngineError::CapabilityUnsupported("DataProducing"))?;
        if let Some(iterator) = &self.coords {
            match iterator.may_produce(coords) {
                Some(false) => return Err(EngineError::UnknownCoordinates(coords.clone())),
                None => log::debug!(
                    "cannot verify that {} will be produced; waiting anyway",
                    coords
                ),
                Some(true) => {}
            }
        }
        handler.get(coords, return_data, return_metadata, timeout)
    }

    /// [`await_data`](Self::await_data) over several coordinates; the
    /// returned vector parallels the input order. The timeout applies to each
    /// coordinate individually.
    pub fn await_data_batch(
        &self,
        coords: &[DataCoordinates],
        return_data: bool,
        return_metadata: bool,
        timeout: Option<Duration>,
    ) -> EngineResult<Vec<(Option<DataBuffer>, Option<Value>)>> {
        coords
            .iter()
            .map(|c| self.await_data(c, return_data, return_metadata, timeout))
            .collect()
    }
}
