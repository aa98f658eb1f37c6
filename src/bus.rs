//! Broadcast bus fanning notifications out to external listeners.
//!
//! Publication is decoupled from delivery: publishers enqueue onto a bounded
//! channel and return immediately; a single dispatch thread drains the queue
//! and invokes handlers. Handlers therefore run on the dispatch thread, and a
//! slow handler slows only other handlers, never a worker. Notifications from
//! one publishing event are delivered in publication order; no global order
//! is guaranteed across events.
//!
//! The subscriber registry sits behind a read/write lock because the dispatch
//! loop only ever reads it; subscribe/unsubscribe are rare.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::notification::{Notification, NotificationCategory};

/// Which notifications a subscriber receives.
#[derive(Clone, Debug, Default)]
pub enum NotificationFilter {
    /// Every notification.
    #[default]
    All,
    /// Exact kind match, e.g. `"EventExecuted"`.
    Kind(String),
    /// Every notification in a category.
    Category(NotificationCategory),
}

impl NotificationFilter {
    fn matches(&self, notification: &Notification) -> bool {
        match self {
            NotificationFilter::All => true,
            NotificationFilter::Kind(kind) => notification.kind == *kind,
            NotificationFilter::Category(category) => notification.category == *category,
        }
    }
}

/// Token identifying one subscription, for [`NotificationBus::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type HandlerFn = Box<dyn Fn(&Notification) + Send + Sync + 'static>;

struct Subscriber {
    id: u64,
    filter: NotificationFilter,
    handler: HandlerFn,
}

struct BusShared {
    registry: RwLock<Vec<Subscriber>>,
    sender: Mutex<Option<Sender<Notification>>>,
    next_id: AtomicU64,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the engine's notification bus. Cloneable; all clones publish to
/// the same dispatch queue.
#[derive(Clone)]
pub struct NotificationBus {
    shared: Arc<BusShared>,
}

impl NotificationBus {
    pub(crate) fn new(queue_depth: usize) -> Self {
        let (sender, receiver) = bounded::<Notification>(queue_depth);
        let shared = Arc::new(BusShared {
            registry: RwLock::new(Vec::new()),
            sender: Mutex::new(Some(sender)),
            next_id: AtomicU64::new(0),
            dispatch: Mutex::new(None),
        });

        let dispatch_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("notification-dispatch".to_string())
            .spawn(move || {
                for notification in receiver {
                    let registry = dispatch_shared.registry.read();
                    for subscriber in registry.iter() {
                        if !subscriber.filter.matches(&notification) {
                            continue;
                        }
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            (subscriber.handler)(&notification)
                        }));
                        if outcome.is_err() {
                            log::error!(
                                "notification handler {} panicked on kind '{}'; keeping it subscribed",
                                subscriber.id,
                                notification.kind
                            );
                        }
                    }
                }
            })
            .expect("failed to spawn notification dispatch thread");
        *shared.dispatch.lock() = Some(handle);

        Self { shared }
    }

    /// Register a listener. The handler runs on the dispatch thread; an
    /// exception it raises is logged and does not unsubscribe it.
    pub fn subscribe(
        &self,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
        filter: NotificationFilter,
    ) -> SubscriptionHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.registry.write().push(Subscriber {
            id,
            filter,
            handler: Box::new(handler),
        });
        SubscriptionHandle(id)
    }

    /// Remove a subscription. Returns false if the handle was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut registry = self.shared.registry.write();
        let before = registry.len();
        registry.retain(|s| s.id != handle.0);
        registry.len() != before
    }

    /// Enqueue for delivery. Never blocks the publisher: when the queue is
    /// full the notification is dropped with a warning.
    pub fn publish(&self, notification: Notification) {
        let sender = self.shared.sender.lock();
        let Some(sender) = sender.as_ref() else {
            log::debug!(
                "notification '{}' published after bus shutdown; dropping",
                notification.kind
            );
            return;
        };
        match sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                log::warn!(
                    "notification queue full; dropping '{}'. This indicates backpressure - \
                     notifications published faster than handlers consume.",
                    n.kind
                );
            }
            Err(TrySendError::Disconnected(n)) => {
                log::debug!("notification dispatch gone; dropping '{}'", n.kind);
            }
        }
    }

    /// Stop accepting publications, drain the queue, and join the dispatch
    /// thread.
    pub(crate) fn shutdown(&self) {
        self.shared.sender.lock().take();
        if let Some(handle) = self.shared.dispatch.lock().take() {
            if handle.join().is_err() {
                log::error!("notification dispatch thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::EVENT_EXECUTED;
    use std::sync::mpsc;
    use std::time::Duration;

    fn wait_for<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(2)).expect("delivery")
    }

    #[test]
    fn test_subscriber_receives_notification() {
        let bus = NotificationBus::new(16);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |n| {
                tx.send(n.kind.clone()).ok();
            },
            NotificationFilter::All,
        );
        bus.publish(Notification::event_executed(None));
        assert_eq!(wait_for(&rx), EVENT_EXECUTED);
        bus.shutdown();
    }

    #[test]
    fn test_kind_filter() {
        let bus = NotificationBus::new(16);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |n| {
                tx.send(n.kind.clone()).ok();
            },
            NotificationFilter::Kind("StorageFailed".to_string()),
        );
        bus.publish(Notification::event_executed(None));
        bus.publish(Notification::storage_failed("disk full"));
        assert_eq!(wait_for(&rx), "StorageFailed");
        bus.shutdown();
    }

    #[test]
    fn test_category_filter() {
        let bus = NotificationBus::new(16);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |n| {
                tx.send(n.kind.clone()).ok();
            },
            NotificationFilter::Category(NotificationCategory::Storage),
        );
        bus.publish(Notification::event_executed(None));
        bus.publish(Notification::storage_failed("nope"));
        assert_eq!(wait_for(&rx), "StorageFailed");
        bus.shutdown();
    }

    #[test]
    fn test_panicking_handler_stays_subscribed() {
        let bus = NotificationBus::new(16);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |n| {
                tx.send(n.kind.clone()).ok();
                panic!("handler bug");
            },
            NotificationFilter::All,
        );
        bus.publish(Notification::event_executed(None));
        assert_eq!(wait_for(&rx), EVENT_EXECUTED);
        bus.publish(Notification::event_executed(None));
        assert_eq!(wait_for(&rx), EVENT_EXECUTED);
        bus.shutdown();
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = NotificationBus::new(16);
        let (tx, rx) = mpsc::channel();
        let handle = bus.subscribe(
            move |n| {
                tx.send(n.kind.clone()).ok();
            },
            NotificationFilter::All,
        );
        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        bus.publish(Notification::event_executed(None));
        bus.shutdown();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_after_shutdown_is_dropped() {
        let bus = NotificationBus::new(16);
        bus.shutdown();
        bus.publish(Notification::event_executed(None));
    }
}
