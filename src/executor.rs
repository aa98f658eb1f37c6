//! Named single-threaded workers and the dispatch loop that drains them.
//!
//! Each worker owns a strictly FIFO queue and exactly one long-lived OS
//! thread. Workers are created lazily the first time a submission names them
//! and live until engine shutdown; they are never transient pool threads, so
//! thread-affinity guarantees given to devices hold for the engine's
//! lifetime.
//!
//! The dispatch loop isolates item failures: an error or panic from
//! `execute()` is recorded on the item's future and the worker moves on.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};

use crate::bus::NotificationBus;
use crate::data::handler::DataHandler;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventContext, ExecutorEvent};
use crate::future::{ExecutionPhase, FutureCore};
use crate::notification::Notification;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Name of the worker the calling thread belongs to, if it is a worker
/// thread. The device proxy uses this to execute re-entrant calls inline
/// instead of re-enqueueing them.
pub fn current_worker() -> Option<String> {
    CURRENT_WORKER.with(|w| w.borrow().clone())
}

/// Type-erased queued unit of work.
pub(crate) trait WorkItem: Send {
    fn run(&mut self, bus: &NotificationBus);
    /// Fail the item without running it (queue dropped by `shutdown(false)`).
    fn cancel(&mut self, bus: &NotificationBus);
}

/// A submitted event paired with the shared state its future observes.
pub(crate) struct EventTask<E: ExecutorEvent> {
    pub(crate) event: E,
    pub(crate) core: Arc<FutureCore>,
    pub(crate) result: Arc<Mutex<Option<E::Output>>>,
    pub(crate) handler: Option<Arc<DataHandler>>,
}

impl<E: ExecutorEvent> EventTask<E> {
    /// Record the terminal outcome and publish the single `EventExecuted`
    /// notification, strictly after the future has transitioned.
    fn finish(&self, phase: ExecutionPhase, error: Option<EngineError>, bus: &NotificationBus) {
        self.core.complete(phase, error.clone());
        let notification = Notification::event_executed(error.as_ref());
        self.core.push_notification(notification.clone());
        bus.publish(notification);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<E: ExecutorEvent> WorkItem for EventTask<E> {
    fn run(&mut self, bus: &NotificationBus) {
        self.core.mark_running();
        let ctx = EventContext::new(
            Arc::clone(&self.core),
            bus.clone(),
            self.handler.clone(),
        );

        let retries = self.event.max_retries();
        let mut outcome: Result<E::Output, EngineError> =
            Err(EngineError::execution(anyhow!("event never executed")));
        for attempt in 0..=retries {
            let attempt_result = catch_unwind(AssertUnwindSafe(|| self.event.execute(&ctx)));
            outcome = match attempt_result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(EngineError::execution(err)),
                Err(payload) => Err(EngineError::execution(anyhow!(
                    "event panicked: {}",
                    panic_message(payload)
                ))),
            };
            match &outcome {
                Ok(_) => break,
                Err(err) => {
                    if attempt < retries {
                        log::warn!(
                            "{} during event execution, retrying ({} attempts left)",
                            err,
                            retries - attempt
                        );
                    }
                }
            }
        }

        let caps = self.core.capabilities();
        let aborted = caps.abortable && self.core.abort_requested();
        let stopped = caps.stoppable && self.core.stop_requested();
        match outcome {
            Ok(value) => {
                *self.result.lock() = Some(value);
                let phase = if aborted {
                    ExecutionPhase::Aborted
                } else if stopped {
                    ExecutionPhase::Stopped
                } else {
                    ExecutionPhase::Succeeded
                };
                self.finish(phase, None, bus);
            }
            Err(err) => {
                let phase = if aborted {
                    ExecutionPhase::Aborted
                } else {
                    ExecutionPhase::Failed
                };
                self.finish(phase, Some(err), bus);
            }
        }
    }

    fn cancel(&mut self, bus: &NotificationBus) {
        self.finish(ExecutionPhase::Failed, Some(EngineError::Cancelled), bus);
    }
}

struct QueueState {
    items: VecDeque<Box<dyn WorkItem>>,
    /// Drain remaining items, then exit.
    draining: bool,
    /// Cancel remaining items, then exit.
    cancelling: bool,
}

struct WorkerQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    max_depth: Option<usize>,
}

/// A named FIFO queue plus the single thread draining it.
pub(crate) struct Worker {
    name: String,
    queue: Arc<WorkerQueue>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn spawn(
        name: String,
        max_depth: Option<usize>,
        bus: NotificationBus,
    ) -> Arc<Self> {
        let queue = Arc::new(WorkerQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                draining: false,
                cancelling: false,
            }),
            cond: Condvar::new(),
            max_depth,
        });

        let thread_queue = Arc::clone(&queue);
        let worker_name = name.clone();
        let join = std::thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || {
                CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(worker_name.clone()));
                log::debug!("worker '{}' started", worker_name);
                loop {
                    let mut item = {
                        let mut state = thread_queue.state.lock();
                        loop {
                            if state.cancelling {
                                let remaining: Vec<_> = state.items.drain(..).collect();
                                drop(state);
                                for mut item in remaining {
                                    item.cancel(&bus);
                                }
                                log::debug!("worker '{}' cancelled and exited", worker_name);
                                return;
                            }
                            if let Some(item) = state.items.pop_front() {
                                break item;
                            }
                            if state.draining {
                                log::debug!("worker '{}' drained and exited", worker_name);
                                return;
                            }
                            thread_queue.cond.wait(&mut state);
                        }
                    };
                    item.run(&bus);
                }
            })
            .expect("failed to spawn worker thread");

        Arc::new(Self {
            name,
            queue,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) fn enqueue(&self, item: Box<dyn WorkItem>) -> EngineResult<()> {
        self.enqueue_batch(vec![item])
    }

    /// Append items contiguously, in order, under a single queue lock, so a
    /// concurrent submission cannot interleave with the batch.
    pub(crate) fn enqueue_batch(&self, items: Vec<Box<dyn WorkItem>>) -> EngineResult<()> {
        let mut state = self.queue.state.lock();
        if state.draining || state.cancelling {
            return Err(EngineError::SubmissionRejected);
        }
        if let Some(depth) = self.queue.max_depth {
            if state.items.len() + items.len() > depth {
                return Err(EngineError::QueueFull {
                    worker: self.name.clone(),
                    depth,
                });
            }
        }
        state.items.extend(items);
        self.queue.cond.notify_all();
        Ok(())
    }

    /// Ask the thread to exit: draining the queue first when `wait`, else
    /// cancelling everything still queued. Running items always finish on
    /// their own terms.
    pub(crate) fn signal_shutdown(&self, wait: bool) {
        let mut state = self.queue.state.lock();
        if wait {
            state.draining = true;
        } else {
            state.cancelling = true;
        }
        self.queue.cond.notify_all();
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.join.lock().take() {
            if handle.join().is_err() {
                log::error!("worker '{}' panicked", self.name);
            }
        }
    }
}
