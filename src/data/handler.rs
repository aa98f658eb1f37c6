//! Thread-safe staging area between data-producing events and storage.
//!
//! Producers call [`DataHandler::put`] (usually through
//! [`EventContext::put_data`](crate::event::EventContext::put_data)), which is
//! non-blocking: the item lands in an in-memory table and a coordinate ticket
//! goes down the pipeline. A dedicated writer thread drives the storage
//! backend, so backends need no write-side locking of their own; when a
//! processor is attached, a second thread runs it between intake and storage.
//!
//! ```text
//! put() ──> table ──> [processor thread] ──> storage thread ──> backend
//!             │                                    │
//!             └──────── get()/await_data ──────────┴── DataStored
//! ```
//!
//! Items stay in the table until the backend confirms persistence, so
//! `await_data` can be satisfied from memory before storage completes; after
//! that they are evicted (unless pinned) and `get` falls back to the backend.
//! A failure on either pipeline thread is latched and surfaced on the next
//! `put`, `get`, or `finish`, and announced as a `StorageFailed`
//! notification.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;

use crate::bus::NotificationBus;
use crate::data::coords::DataCoordinates;
use crate::data::storage::StorageBackend;
use crate::data::{DataBuffer, DataItem};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::future::FutureCore;
use crate::notification::Notification;

/// What a processor did with one input item.
pub enum Processed {
    /// The item was consumed: dropped outright, or held back to be emitted
    /// later as part of another output.
    Drop,
    One(DataItem),
    Many(Vec<DataItem>),
}

type ProcessorFn = Box<dyn FnMut(DataItem) -> Processed + Send + 'static>;

enum PipelineMsg {
    Item(DataCoordinates),
    Finish,
}

struct PendingEntry {
    data: DataBuffer,
    metadata: Value,
    future: Option<Arc<FutureCore>>,
    stored: bool,
}

#[derive(Default)]
struct Table {
    entries: HashMap<DataCoordinates, PendingEntry>,
    pinned: HashSet<DataCoordinates>,
    memory_bytes: usize,
    /// Bumped on every mutation so `get` can detect changes that happened
    /// between its table miss and its storage miss.
    generation: u64,
}

impl Table {
    fn insert(
        &mut self,
        coords: DataCoordinates,
        data: DataBuffer,
        metadata: Value,
        future: Option<Arc<FutureCore>>,
    ) {
        let bytes = data.memory_bytes();
        if let Some(old) = self.entries.insert(
            coords,
            PendingEntry {
                data,
                metadata,
                future,
                stored: false,
            },
        ) {
            self.memory_bytes = self.memory_bytes.saturating_sub(old.data.memory_bytes());
        }
        self.memory_bytes += bytes;
        self.generation += 1;
    }

    fn remove(&mut self, coords: &DataCoordinates) -> Option<PendingEntry> {
        let entry = self.entries.remove(coords);
        if let Some(entry) = &entry {
            self.memory_bytes = self.memory_bytes.saturating_sub(entry.data.memory_bytes());
        }
        self.generation += 1;
        entry
    }
}

struct HandlerShared {
    table: Mutex<Table>,
    cond: Condvar,
    storage: RwLock<Box<dyn StorageBackend>>,
    failure: Mutex<Option<EngineError>>,
    /// No further puts accepted.
    finished: AtomicBool,
    /// Storage has been finished and closed.
    closed: AtomicBool,
    bus: NotificationBus,
    memory_bound: Option<usize>,
}

impl HandlerShared {
    fn latched_failure(&self) -> Option<EngineError> {
        self.failure.lock().clone()
    }

    /// Latch the first failure, announce it, and wake every waiter.
    fn fail(&self, message: String) {
        log::error!("data handler failure: {}", message);
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(EngineError::Storage(message.clone()));
            }
        }
        self.bus.publish(Notification::storage_failed(&message));
        self.table.lock().generation += 1;
        self.cond.notify_all();
    }
}

/// In-memory stage between data-producing events and a storage backend.
pub struct DataHandler {
    shared: Arc<HandlerShared>,
    intake_tx: Sender<PipelineMsg>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DataHandler {
    /// Handler writing straight to storage.
    pub fn new(engine: &Engine, storage: impl StorageBackend) -> Arc<Self> {
        Self::build(engine, Box::new(storage), None)
    }

    /// Handler routing every item through `processor` before storage. The
    /// processor runs on its own thread and may drop, transform, or multiply
    /// items; whatever it emits is what gets persisted and what `get` sees.
    pub fn with_processor(
        engine: &Engine,
        storage: impl StorageBackend,
        processor: impl FnMut(DataItem) -> Processed + Send + 'static,
    ) -> Arc<Self> {
        Self::build(engine, Box::new(storage), Some(Box::new(processor)))
    }

    fn build(
        engine: &Engine,
        storage: Box<dyn StorageBackend>,
        processor: Option<ProcessorFn>,
    ) -> Arc<Self> {
        let (intake_tx, intake_rx) = unbounded();
        let shared = Arc::new(HandlerShared {
            table: Mutex::new(Table::default()),
            cond: Condvar::new(),
            storage: RwLock::new(storage),
            failure: Mutex::new(None),
            finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            bus: engine.bus().clone(),
            memory_bound: engine.config().handler_memory_bound,
        });

        let mut threads = Vec::new();
        let storage_rx = match processor {
            Some(processor) => {
                let (processed_tx, processed_rx) = unbounded();
                let processor_shared = Arc::clone(&shared);
                threads.push(
                    std::thread::Builder::new()
                        .name("data-processor".to_string())
                        .spawn(move || {
                            processor_loop(processor_shared, intake_rx, processed_tx, processor)
                        })
                        .expect("failed to spawn data processor thread"),
                );
                processed_rx
            }
            None => intake_rx,
        };
        let storage_shared = Arc::clone(&shared);
        threads.push(
            std::thread::Builder::new()
                .name("data-storage".to_string())
                .spawn(move || storage_loop(storage_shared, storage_rx))
                .expect("failed to spawn data storage thread"),
        );

        Arc::new(Self {
            shared,
            intake_tx,
            threads: Mutex::new(threads),
        })
    }

    /// Hand one item to the pipeline. Non-blocking.
    pub fn put(
        &self,
        coords: DataCoordinates,
        data: impl Into<DataBuffer>,
        metadata: Value,
    ) -> EngineResult<()> {
        self.put_with_future(coords, data.into(), metadata, None)
    }

    pub(crate) fn put_with_future(
        &self,
        coords: DataCoordinates,
        data: DataBuffer,
        metadata: Value,
        future: Option<Arc<FutureCore>>,
    ) -> EngineResult<()> {
        if let Some(err) = self.shared.latched_failure() {
            return Err(err);
        }
        if self.shared.finished.load(Ordering::Acquire) {
            return Err(EngineError::UnknownCoordinates(coords));
        }
        let over_bound = {
            let mut table = self.shared.table.lock();
            table.insert(coords.clone(), data, metadata, future);
            self.shared.cond.notify_all();
            self.shared
                .memory_bound
                .filter(|bound| table.memory_bytes > *bound)
                .map(|_| table.memory_bytes)
        };
        if let Some(bytes) = over_bound {
            log::warn!(
                "data handler holds {} bytes, over the configured bound. This indicates \
                 backpressure - data produced faster than the storage backend persists it.",
                bytes
            );
        }
        self.intake_tx
            .send(PipelineMsg::Item(coords))
            .map_err(|_| EngineError::Storage("data pipeline threads are not running".to_string()))
    }

    /// Block until the coordinates are available in memory or persisted, and
    /// return the requested pieces.
    pub fn get(
        &self,
        coords: &DataCoordinates,
        return_data: bool,
        return_metadata: bool,
        timeout: Option<Duration>,
    ) -> EngineResult<(Option<DataBuffer>, Option<Value>)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(err) = self.shared.latched_failure() {
                return Err(err);
            }

            let generation = {
                let table = self.shared.table.lock();
                if let Some(entry) = table.entries.get(coords) {
                    return Ok((
                        return_data.then(|| entry.data.clone()),
                        return_metadata.then(|| entry.metadata.clone()),
                    ));
                }
                table.generation
            };

            {
                let storage = self.shared.storage.read();
                if storage.contains(coords) {
                    let data = if return_data {
                        Some(storage.get_data(coords).ok_or_else(|| {
                            EngineError::Storage(format!("backend lost data for {}", coords))
                        })?)
                    } else {
                        None
                    };
                    let metadata = if return_metadata {
                        Some(storage.get_metadata(coords).ok_or_else(|| {
                            EngineError::Storage(format!("backend lost metadata for {}", coords))
                        })?)
                    } else {
                        None
                    };
                    return Ok((data, metadata));
                }
            }

            if self.shared.closed.load(Ordering::Acquire) {
                return Err(EngineError::UnknownCoordinates(coords.clone()));
            }

            let mut table = self.shared.table.lock();
            while table.generation == generation {
                match deadline {
                    Some(deadline) => {
                        if self.shared.cond.wait_until(&mut table, deadline).timed_out()
                            && table.generation == generation
                        {
                            return Err(EngineError::Timeout(timeout.unwrap_or_default()));
                        }
                    }
                    None => self.shared.cond.wait(&mut table),
                }
            }
        }
    }

    /// Keep the item at `coords` in memory even after it is persisted.
    pub fn pin(&self, coords: &DataCoordinates) {
        self.shared.table.lock().pinned.insert(coords.clone());
    }

    /// Release a pin; an already-persisted item is evicted immediately.
    pub fn unpin(&self, coords: &DataCoordinates) {
        let mut table = self.shared.table.lock();
        table.pinned.remove(coords);
        let evict = table
            .entries
            .get(coords)
            .map(|entry| entry.stored)
            .unwrap_or(false);
        if evict {
            table.remove(coords);
        }
    }

    /// Bytes of payload currently held in memory.
    pub fn memory_bytes(&self) -> usize {
        self.shared.table.lock().memory_bytes
    }

    /// Signal that no further puts will arrive. The pipeline flushes what it
    /// holds, then finishes and closes the storage backend. Returns
    /// immediately; use [`await_completion`](Self::await_completion) to block
    /// on the flush.
    pub fn finish(&self) -> EngineResult<()> {
        if let Some(err) = self.shared.latched_failure() {
            return Err(err);
        }
        if self.shared.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.intake_tx
            .send(PipelineMsg::Finish)
            .map_err(|_| EngineError::Storage("data pipeline threads are not running".to_string()))
    }

    /// Block until the pipeline has flushed and the backend is closed, then
    /// join the pipeline threads.
    pub fn await_completion(&self, timeout: Option<Duration>) -> EngineResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut table = self.shared.table.lock();
            while !self.shared.closed.load(Ordering::Acquire) {
                if let Some(err) = self.shared.latched_failure() {
                    return Err(err);
                }
                match deadline {
                    Some(deadline) => {
                        if self.shared.cond.wait_until(&mut table, deadline).timed_out()
                            && !self.shared.closed.load(Ordering::Acquire)
                        {
                            return Err(EngineError::Timeout(timeout.unwrap_or_default()));
                        }
                    }
                    None => self.shared.cond.wait(&mut table),
                }
            }
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                log::error!("data pipeline thread panicked");
            }
        }
        self.shared.latched_failure().map_or(Ok(()), Err)
    }
}

fn processor_loop(
    shared: Arc<HandlerShared>,
    rx: Receiver<PipelineMsg>,
    tx: Sender<PipelineMsg>,
    mut processor: ProcessorFn,
) {
    for msg in rx {
        let coords = match msg {
            PipelineMsg::Finish => {
                tx.send(PipelineMsg::Finish).ok();
                return;
            }
            PipelineMsg::Item(coords) => coords,
        };

        let snapshot = {
            let table = shared.table.lock();
            table.entries.get(&coords).map(|entry| {
                (
                    DataItem {
                        coords: coords.clone(),
                        data: entry.data.clone(),
                        metadata: entry.metadata.clone(),
                    },
                    entry.future.clone(),
                )
            })
        };
        let Some((item, future)) = snapshot else {
            continue;
        };

        let outputs = match catch_unwind(AssertUnwindSafe(|| processor(item))) {
            Ok(Processed::Drop) => Vec::new(),
            Ok(Processed::One(item)) => vec![item],
            Ok(Processed::Many(items)) => items,
            Err(_) => {
                shared.fail("processor panicked".to_string());
                return;
            }
        };

        {
            let mut table = shared.table.lock();
            let mut replaced_original = false;
            for out in &outputs {
                if out.coords == coords {
                    replaced_original = true;
                }
                table.insert(
                    out.coords.clone(),
                    out.data.clone(),
                    out.metadata.clone(),
                    future.clone(),
                );
            }
            if !replaced_original {
                table.remove(&coords);
            }
            shared.cond.notify_all();
        }
        for out in outputs {
            tx.send(PipelineMsg::Item(out.coords)).ok();
        }
    }
}

fn storage_loop(shared: Arc<HandlerShared>, rx: Receiver<PipelineMsg>) {
    for msg in rx {
        let coords = match msg {
            PipelineMsg::Finish => {
                let flush = {
                    let mut storage = shared.storage.write();
                    storage.finish().and_then(|_| storage.close())
                };
                if let Err(err) = flush {
                    shared.fail(format!("storage finish failed: {:#}", err));
                    return;
                }
                shared.closed.store(true, Ordering::Release);
                shared.table.lock().generation += 1;
                shared.cond.notify_all();
                log::debug!("data pipeline flushed and storage closed");
                return;
            }
            PipelineMsg::Item(coords) => coords,
        };

        let snapshot = {
            let table = shared.table.lock();
            table
                .entries
                .get(&coords)
                .map(|entry| (entry.data.clone(), entry.metadata.clone(), entry.future.clone()))
        };
        let Some((data, metadata, future)) = snapshot else {
            continue;
        };

        let put_result = shared.storage.write().put(&coords, &data, &metadata);
        if let Err(err) = put_result {
            shared.fail(format!("storage put failed for {}: {:#}", coords, err));
            return;
        }

        {
            let mut table = shared.table.lock();
            if table.pinned.contains(&coords) {
                if let Some(entry) = table.entries.get_mut(&coords) {
                    entry.stored = true;
                }
                table.generation += 1;
            } else {
                table.remove(&coords);
            }
            shared.cond.notify_all();
        }
        let notification = Notification::data_stored(&coords);
        if let Some(future) = future {
            future.push_notification(notification.clone());
        }
        shared.bus.publish(notification);
    }
}
