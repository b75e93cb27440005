//! Event subscriptions: pattern-matched handlers and bounded streams.
//!
//! Handlers run serially, in subscription order, on the dispatch thread; a
//! panicking handler is captured and does not block the rest. Streams are
//! bounded channels that drop events on overflow and count the drops, so a
//! slow observer can never stall the engine.

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::error;
use uuid::Uuid;

use crate::error::{ExecutionError, VerdictError, VerdictResult};
use crate::event::Event;
use crate::pattern::{topic_pattern, KeyPattern};

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A callback invoked for every matching event.
///
/// The event's topic is available on the event itself, so wildcard
/// subscribers see which concrete topic matched.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event);
    }
}

enum Sink {
    Handler(Arc<dyn EventHandler>),
    Stream {
        tx: Sender<Event>,
        dropped: Arc<AtomicU64>,
    },
}

struct Subscription {
    id: SubscriptionId,
    pattern: Arc<KeyPattern>,
    sink: Sink,
}

/// Engine-private subscription table.
#[derive(Default)]
pub struct SubscriberRegistry {
    subs: Vec<Subscription>,
    retired: Arc<Mutex<HashSet<SubscriptionId>>>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a topic glob.
    pub fn subscribe(
        &mut self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subs.push(Subscription {
            id,
            pattern: topic_pattern(pattern),
            sink: Sink::Handler(handler),
        });
        id
    }

    /// Registers a bounded stream for a topic glob.
    pub fn subscribe_stream(&mut self, pattern: &str, capacity: usize) -> EventStream {
        let id = SubscriptionId::new();
        let (tx, rx) = bounded::<Event>(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        self.subs.push(Subscription {
            id,
            pattern: topic_pattern(pattern),
            sink: Sink::Stream {
                tx,
                dropped: Arc::clone(&dropped),
            },
        });

        EventStream {
            subscription_id: id,
            rx,
            retired: Arc::clone(&self.retired),
            dropped,
            unregistered: AtomicBool::new(false),
        }
    }

    /// Removes a subscription. Returns whether one existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.id != id);
        before != self.subs.len()
    }

    /// Delivers an event to every matching subscription, in registration
    /// order. Returns the number of handler panics captured.
    pub fn dispatch(&mut self, event: &Event) -> u64 {
        self.prune_retired();

        let mut handler_errors = 0;
        for sub in &self.subs {
            if !sub.pattern.matches(&event.topic) {
                continue;
            }
            match &sub.sink {
                Sink::Handler(handler) => {
                    let handler = Arc::clone(handler);
                    if catch_unwind(AssertUnwindSafe(|| handler.handle(event))).is_err() {
                        handler_errors += 1;
                        error!(
                            subscription = %sub.id,
                            topic = %event.topic,
                            "event handler panicked"
                        );
                    }
                }
                Sink::Stream { tx, dropped } => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                },
            }
        }
        handler_errors
    }

    fn prune_retired(&mut self) {
        let Ok(mut retired) = self.retired.lock() else {
            return;
        };
        if retired.is_empty() {
            return;
        }
        self.subs.retain(|s| !retired.contains(&s.id));
        retired.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

/// A subscription stream over matching events.
///
/// Dropping the stream retires the subscription; the registry prunes it on
/// the next dispatch.
#[derive(Debug)]
pub struct EventStream {
    subscription_id: SubscriptionId,
    rx: Receiver<Event>,
    retired: Arc<Mutex<HashSet<SubscriptionId>>>,
    dropped: Arc<AtomicU64>,
    unregistered: AtomicBool,
}

impl EventStream {
    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Events dropped because the stream buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Best-effort explicit unregistration. Idempotent.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut retired) = self.retired.lock() {
            retired.insert(self.subscription_id);
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> VerdictResult<Event> {
        self.rx.recv().map_err(|_| {
            VerdictError::Execution(ExecutionError::Disconnected {
                path: "event_stream".to_string(),
            })
        })
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> VerdictResult<Event> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => VerdictError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => VerdictError::Execution(ExecutionError::Disconnected {
                path: "event_stream".to_string(),
            }),
        })
    }

    /// Receive without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.unregistered.swap(true, Ordering::AcqRel) {
            if let Ok(mut retired) = self.retired.lock() {
                retired.insert(self.subscription_id);
            }
        }
    }
}
