use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};

use crate::metrics::SyncMetrics;
use crate::realtime::topic::Topic;

/// Open/closed latch guarding one callback.
///
/// Callbacks run while holding the latch and `close` takes the same latch,
/// so once `close` returns no invocation is running or will start. The lock
/// is reentrant: a callback may close its own subscription.
pub(crate) struct Gate {
    open: ReentrantMutex<Cell<bool>>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            open: ReentrantMutex::new(Cell::new(true)),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.lock().get()
    }

    /// Run `f` only if the gate is still open.
    pub(crate) fn pass<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let guard = self.open.lock();
        if guard.get() {
            Some(f())
        } else {
            None
        }
    }

    /// Returns whether the gate was open.
    pub(crate) fn close(&self) -> bool {
        self.open.lock().replace(false)
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// Live handle on a topic stream.
///
/// Closing (explicitly or by dropping the handle) stops further callback
/// invocations before returning, then releases whatever the subscription
/// holds: heartbeat timers, aggregator references, and finally the
/// underlying transport link when this was its last user.
pub struct Subscription {
    topic: Topic,
    gate: Arc<Gate>,
    releases: Vec<Release>,
}

impl Subscription {
    pub(crate) fn new(topic: Topic, gate: Arc<Gate>) -> Self {
        Self {
            topic,
            gate,
            releases: Vec::new(),
        }
    }

    /// Register cleanup; runs in reverse registration order on close.
    pub(crate) fn on_close(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.releases.push(Box::new(release));
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Stop callbacks and release resources. Idempotent.
    pub fn close(&mut self) {
        self.gate.close();
        while let Some(release) = self.releases.pop() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic.to_string())
            .field("active", &self.is_active())
            .finish()
    }
}

pub(crate) type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Watcher<T> {
    id: u64,
    gate: Arc<Gate>,
    callback: Callback<T>,
}

impl<T> Clone for Watcher<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            gate: self.gate.clone(),
            callback: self.callback.clone(),
        }
    }
}

/// Gated fan-out list shared by the registry, presence and leaderboards.
pub(crate) struct Watchers<T> {
    next_id: AtomicU64,
    list: RwLock<Vec<Watcher<T>>>,
}

impl<T> Watchers<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            list: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, callback: Callback<T>) -> (u64, Arc<Gate>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(Gate::new());
        self.list.write().push(Watcher {
            id,
            gate: gate.clone(),
            callback,
        });
        (id, gate)
    }

    /// Returns how many watchers remain.
    pub(crate) fn remove(&self, id: u64) -> usize {
        let mut list = self.list.write();
        list.retain(|w| w.id != id);
        list.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Deliver `value` to every open watcher, in registration order.
    pub(crate) fn emit(&self, value: &T, metrics: &SyncMetrics) {
        // Snapshot so callbacks may add or remove watchers
        let watchers: Vec<Watcher<T>> = self.list.read().clone();
        for watcher in &watchers {
            deliver(watcher, value, metrics);
        }
    }

    pub(crate) fn emit_to(&self, id: u64, value: &T, metrics: &SyncMetrics) {
        let watcher = self.list.read().iter().find(|w| w.id == id).cloned();
        if let Some(watcher) = watcher {
            deliver(&watcher, value, metrics);
        }
    }
}

fn deliver<T>(watcher: &Watcher<T>, value: &T, metrics: &SyncMetrics) {
    watcher.gate.pass(|| {
        let outcome = catch_unwind(AssertUnwindSafe(|| (watcher.callback)(value)));
        if outcome.is_err() {
            metrics.record_callback_panic();
            log::error!("subscriber callback {} panicked; continuing fan-out", watcher.id);
        }
    });
}
