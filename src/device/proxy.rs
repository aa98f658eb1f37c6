//! Transparent interception of device access.
//!
//! Registering a device consumes it and hands back a [`DeviceProxy`]; user
//! code never touches the raw device again. Every property read, property
//! write, and method call on the proxy synthesizes a structured event
//! ([`GetAttrEvent`], [`SetAttrEvent`], [`MethodCallEvent`]), submits it on
//! the device's worker, blocks until the future completes, and returns the
//! result or re-raises the error. Because all non-bypassed access to one
//! device funnels through one worker, callers observe a total order per
//! device with no locking of their own.
//!
//! Two access paths skip the queue:
//! - names in the registration's bypass set (or everything, with
//!   `bypass_all`) run directly on the calling thread; bypass is a
//!   performance/semantics choice and nothing may rely on it for correctness;
//! - a call issued *from the device's own worker* runs inline, so code
//!   already executing on that worker can re-enter the same device without
//!   deadlocking and without losing thread affinity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{Device, PropertyConstraints, PropertyValue};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventContext, ExecutorEvent};
use crate::executor::current_worker;

type SharedDevice = Arc<Mutex<Box<dyn Device>>>;

/// Registration options for a device.
#[derive(Clone, Debug, Default)]
pub struct DeviceOptions {
    /// Worker all access is serialized onto. Engine default when `None`.
    pub worker: Option<String>,

    /// Attribute/method names serviced directly on the calling thread.
    pub bypass: HashSet<String>,

    /// Service every name directly on the calling thread.
    pub bypass_all: bool,

    /// Per-method worker override, e.g. a long camera readout on its own
    /// worker while everything else shares the default.
    pub method_workers: HashMap<String, String>,
}

impl DeviceOptions {
    pub fn on_worker(worker: impl Into<String>) -> Self {
        Self {
            worker: Some(worker.into()),
            ..Default::default()
        }
    }

    pub fn with_bypass(mut self, name: impl Into<String>) -> Self {
        self.bypass.insert(name.into());
        self
    }

    pub fn with_method_worker(
        mut self,
        method: impl Into<String>,
        worker: impl Into<String>,
    ) -> Self {
        self.method_workers.insert(method.into(), worker.into());
        self
    }
}

struct ProxyInner {
    name: String,
    device: SharedDevice,
    worker: String,
    bypass: HashSet<String>,
    bypass_all: bool,
    method_workers: HashMap<String, String>,
    engine: Engine,
}

/// Synchronous-looking handle to a registered device.
#[derive(Clone)]
pub struct DeviceProxy {
    inner: Arc<ProxyInner>,
}

impl DeviceProxy {
    pub(crate) fn new(engine: Engine, device: impl Device, options: DeviceOptions) -> Self {
        let name = device.name().to_string();
        let worker = options
            .worker
            .unwrap_or_else(|| engine.config().default_worker_name.clone());
        Self {
            inner: Arc::new(ProxyInner {
                name,
                device: Arc::new(Mutex::new(Box::new(device))),
                worker,
                bypass: options.bypass,
                bypass_all: options.bypass_all,
                method_workers: options.method_workers,
                engine,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Worker this device's access is serialized onto (before per-method
    /// overrides).
    pub fn worker(&self) -> &str {
        &self.inner.worker
    }

    fn resolve_worker(&self, name: &str) -> &str {
        self.inner
            .method_workers
            .get(name)
            .map(String::as_str)
            .unwrap_or(&self.inner.worker)
    }

    /// Bypassed names, and re-entrant calls from the target worker itself,
    /// run on the calling thread.
    fn runs_inline(&self, name: &str) -> bool {
        if self.inner.bypass_all || self.inner.bypass.contains(name) {
            return true;
        }
        current_worker().as_deref() == Some(self.resolve_worker(name))
    }

    fn attr_error(&self, attribute: &str, err: EngineError) -> EngineError {
        match err {
            EngineError::ExecutionFailed(reason) => EngineError::DeviceAttribute {
                device: self.inner.name.clone(),
                attribute: attribute.to_string(),
                reason,
            },
            other => other,
        }
    }

    fn direct_error(&self, attribute: &str, err: anyhow::Error) -> EngineError {
        EngineError::DeviceAttribute {
            device: self.inner.name.clone(),
            attribute: attribute.to_string(),
            reason: Arc::new(err),
        }
    }

    /// Synchronous property read, serviced on the device's worker.
    pub fn get(&self, name: &str) -> EngineResult<PropertyValue> {
        if self.runs_inline(name) {
            return self
                .inner
                .device
                .lock()
                .get_property(name)
                .map_err(|e| self.direct_error(name, e));
        }
        let event = GetAttrEvent {
            device: Arc::clone(&self.inner.device),
            attr: name.to_string(),
        };
        self.inner
            .engine
            .submit_on(self.resolve_worker(name), event)?
            .await_execution(None)
            .map_err(|e| self.attr_error(name, e))
    }

    /// Synchronous property write, serviced on the device's worker.
    pub fn set(&self, name: &str, value: impl Into<PropertyValue>) -> EngineResult<()> {
        let value = value.into();
        if self.runs_inline(name) {
            return self
                .inner
                .device
                .lock()
                .set_property(name, value)
                .map_err(|e| self.direct_error(name, e));
        }
        let event = SetAttrEvent {
            device: Arc::clone(&self.inner.device),
            attr: name.to_string(),
            value,
        };
        self.inner
            .engine
            .submit_on(self.resolve_worker(name), event)?
            .await_execution(None)
            .map_err(|e| self.attr_error(name, e))
    }

    /// Synchronous method call, serviced on the device's worker (or the
    /// method's override worker).
    pub fn call(&self, method: &str, args: &[PropertyValue]) -> EngineResult<PropertyValue> {
        if self.runs_inline(method) {
            return self
                .inner
                .device
                .lock()
                .invoke(method, args)
                .map_err(|e| self.direct_error(method, e));
        }
        let event = MethodCallEvent {
            device: Arc::clone(&self.inner.device),
            method: method.to_string(),
            args: args.to_vec(),
        };
        self.inner
            .engine
            .submit_on(self.resolve_worker(method), event)?
            .await_execution(None)
            .map_err(|e| self.attr_error(method, e))
    }

    /// Read-only view of one property's constraints. The query itself runs
    /// through the executor like any other access.
    pub fn constraints(&self, name: &str) -> EngineResult<PropertyConstraints> {
        if self.runs_inline(name) {
            let device = self.inner.device.lock();
            return Ok(read_constraints(&**device, name));
        }
        let event = ConstraintsEvent {
            device: Arc::clone(&self.inner.device),
            attr: name.to_string(),
        };
        self.inner
            .engine
            .submit_on(self.resolve_worker(name), event)?
            .await_execution(None)
            .map_err(|e| self.attr_error(name, e))
    }
}

fn read_constraints(device: &dyn Device, name: &str) -> PropertyConstraints {
    PropertyConstraints {
        allowed_values: device.allowed_values(name),
        read_only: device.is_read_only(name),
        limits: device.limits(name),
        hardware_triggerable: device.is_hardware_triggerable(name),
    }
}

struct GetAttrEvent {
    device: SharedDevice,
    attr: String,
}

impl ExecutorEvent for GetAttrEvent {
    type Output = PropertyValue;

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<PropertyValue> {
        self.device.lock().get_property(&self.attr)
    }
}

struct SetAttrEvent {
    device: SharedDevice,
    attr: String,
    value: PropertyValue,
}

impl ExecutorEvent for SetAttrEvent {
    type Output = ();

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<()> {
        self.device.lock().set_property(&self.attr, self.value.clone())
    }
}

struct MethodCallEvent {
    device: SharedDevice,
    method: String,
    args: Vec<PropertyValue>,
}

impl ExecutorEvent for MethodCallEvent {
    type Output = PropertyValue;

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<PropertyValue> {
        self.device.lock().invoke(&self.method, &self.args)
    }
}

struct ConstraintsEvent {
    device: SharedDevice,
    attr: String,
}

impl ExecutorEvent for ConstraintsEvent {
    type Output = PropertyConstraints;

    fn execute(&mut self, _ctx: &EventContext) -> anyhow::Result<PropertyConstraints> {
        let device = self.device.lock();
        Ok(read_constraints(&**device, &self.attr))
    }
}
