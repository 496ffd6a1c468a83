//! Observer registry keyed by subscription handle
//!
//! Callbacks are snapshotted under the lock and invoked after it is released,
//! so a callback may register or unregister listeners (itself included)
//! without deadlocking.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`ListenerRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(u64);

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Callback receiving events of type `E`
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of listeners for events of type `E`
pub struct ListenerRegistry<E: ?Sized> {
    listeners: Mutex<Vec<(ListenerHandle, Listener<E>)>>,
    next_handle: AtomicU64,
}

impl<E: ?Sized> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ?Sized> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl<E: ?Sized> ListenerRegistry<E> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Add a listener; dispatch order is registration order
    pub fn register(&self, listener: Listener<E>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((handle, listener));
        handle
    }

    /// Remove a listener. Returns false if the handle was unknown.
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    /// Invoke every listener registered at the time of the call
    pub fn dispatch(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// True if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}
