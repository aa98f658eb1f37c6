//! The engine façade: submission, device registration, notification
//! subscription, and shutdown.
//!
//! # Architecture
//!
//! ```text
//! caller threads          Engine                    worker threads
//! ──────────────   ─────────────────────   ──────────────────────────
//! submit(event) ─> worker registry ─> FIFO queue ─> execute() ─> future
//! proxy access  ─> synthesized event ──────┘            │
//! subscribe     ─> notification bus <── publish ────────┘
//! ```
//!
//! One engine owns: one thread per named worker (created lazily, destroyed at
//! shutdown), one notification dispatch thread, and, per data handler, one
//! storage-writer thread plus an optional processor thread. User code runs on
//! its own threads and interacts only through submissions, proxy calls, and
//! futures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bus::{NotificationBus, NotificationFilter, SubscriptionHandle};
use crate::config::EngineConfig;
use crate::device::proxy::{DeviceOptions, DeviceProxy};
use crate::device::Device;
use crate::error::{EngineError, EngineResult};
use crate::event::{CallableEvent, ExecutorEvent};
use crate::executor::{EventTask, WorkItem, Worker};
use crate::future::{Capabilities, ExecutionFuture, FutureCore};
use crate::notification::Notification;

struct EngineShared {
    config: EngineConfig,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    devices: Mutex<HashMap<String, DeviceProxy>>,
    bus: NotificationBus,
    shut_down: AtomicBool,
}

/// Handle to one execution engine. Cloneable; all clones address the same
/// workers, devices, and bus.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let bus = NotificationBus::new(config.notification_queue_depth);
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                workers: Mutex::new(HashMap::new()),
                devices: Mutex::new(HashMap::new()),
                bus,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Engine with the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
            .expect("default engine configuration is valid - internal invariant violated")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub(crate) fn bus(&self) -> &NotificationBus {
        &self.shared.bus
    }

    /// Submit an event. The worker is resolved by precedence: the event's own
    /// preference, then the engine default. (Device-level overrides are
    /// resolved by the proxy before it reaches this point.)
    pub fn submit<E: ExecutorEvent>(&self, event: E) -> EngineResult<ExecutionFuture<E::Output>> {
        let worker = event
            .preferred_worker()
            .unwrap_or(&self.shared.config.default_worker_name)
            .to_string();
        self.submit_on(&worker, event)
    }

    /// Submit an event to an explicitly named worker.
    pub fn submit_on<E: ExecutorEvent>(
        &self,
        worker: &str,
        event: E,
    ) -> EngineResult<ExecutionFuture<E::Output>> {
        let (task, future) = self.prepare(event)?;
        self.worker(worker)?.enqueue(task)?;
        Ok(future)
    }

    /// Submit a plain callable on the default worker. The wrapped item has no
    /// notifications and no capabilities.
    pub fn submit_fn<R, F>(&self, func: F) -> EngineResult<ExecutionFuture<R>>
    where
        R: Clone + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.submit(CallableEvent::new(func))
    }

    /// Submit a plain callable on a named worker.
    pub fn submit_fn_on<R, F>(&self, worker: &str, func: F) -> EngineResult<ExecutionFuture<R>>
    where
        R: Clone + Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.submit_on(worker, CallableEvent::new(func))
    }

    /// Submit several events so they appear contiguously, in order, on the
    /// worker's queue; no concurrent submission can interleave with them.
    pub fn submit_batch<E: ExecutorEvent>(
        &self,
        worker: Option<&str>,
        events: Vec<E>,
    ) -> EngineResult<Vec<ExecutionFuture<E::Output>>> {
        let worker = worker.unwrap_or(&self.shared.config.default_worker_name);
        let mut tasks = Vec::with_capacity(events.len());
        let mut futures = Vec::with_capacity(events.len());
        for event in events {
            let (task, future) = self.prepare(event)?;
            tasks.push(task);
            futures.push(future);
        }
        self.worker(worker)?.enqueue_batch(tasks)?;
        Ok(futures)
    }

    fn prepare<E: ExecutorEvent>(
        &self,
        event: E,
    ) -> EngineResult<(Box<dyn WorkItem>, ExecutionFuture<E::Output>)> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::SubmissionRejected);
        }
        let handler = event.data_handler();
        let caps = Capabilities {
            stoppable: event.is_stoppable(),
            abortable: event.is_abortable(),
            data_producing: handler.is_some(),
        };
        let core = FutureCore::new(caps);
        let result = Arc::new(Mutex::new(None));
        let coords = event.coordinate_iterator().map(Arc::new);
        let future = ExecutionFuture::new(
            Arc::clone(&core),
            Arc::clone(&result),
            handler.clone(),
            coords,
        );
        let task = EventTask {
            event,
            core,
            result,
            handler,
        };
        Ok((Box::new(task), future))
    }

    /// Look up a worker, creating its queue and thread on first use.
    fn worker(&self, name: &str) -> EngineResult<Arc<Worker>> {
        let mut workers = self.shared.workers.lock();
        // checked under the lock: shutdown drains this map while holding it,
        // so a worker spawned here is always seen and joined by shutdown
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::SubmissionRejected);
        }
        if let Some(worker) = workers.get(name) {
            return Ok(Arc::clone(worker));
        }
        log::info!("creating worker '{}'", name);
        let worker = Worker::spawn(
            name.to_string(),
            self.shared.config.max_queue_depth,
            self.shared.bus.clone(),
        );
        workers.insert(name.to_string(), Arc::clone(&worker));
        Ok(worker)
    }

    /// Subscribe an external listener to the notification bus.
    pub fn subscribe_to_notifications(
        &self,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
        filter: NotificationFilter,
    ) -> SubscriptionHandle {
        self.shared.bus.subscribe(handler, filter)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.shared.bus.unsubscribe(handle)
    }

    /// Publish a notification on behalf of an external component (storage
    /// backends, device implementations).
    pub fn publish_notification(&self, notification: Notification) {
        self.shared.bus.publish(notification);
    }

    /// Register a device, consuming it. All further access goes through the
    /// returned proxy, which routes every non-bypassed attribute and method
    /// access onto the device's worker.
    pub fn register_device(
        &self,
        device: impl Device,
        options: DeviceOptions,
    ) -> EngineResult<DeviceProxy> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::SubmissionRejected);
        }
        let name = device.name().to_string();
        let mut devices = self.shared.devices.lock();
        if devices.contains_key(&name) {
            return Err(EngineError::DuplicateDevice(name));
        }
        let proxy = DeviceProxy::new(self.clone(), device, options);
        devices.insert(name, proxy.clone());
        Ok(proxy)
    }

    /// Look up a registered device by name.
    pub fn device(&self, name: &str) -> EngineResult<DeviceProxy> {
        self.shared
            .devices
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDevice(name.to_string()))
    }

    /// Shut the engine down. New submissions are rejected immediately. With
    /// `wait` the workers drain their queues; without it, queued items are
    /// cancelled (running items still finish on their own terms). Worker and
    /// dispatch threads are joined before this returns.
    pub fn shutdown(&self, wait: bool) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("engine shutting down (wait={})", wait);
        let workers: Vec<Arc<Worker>> = self.shared.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.signal_shutdown(wait);
        }
        for worker in &workers {
            worker.join();
        }
        self.shared.bus.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}
