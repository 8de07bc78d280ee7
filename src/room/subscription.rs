// --- Observer registry ---

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use super::error::lock;

/// Callback invoked for each event of type `T`.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Explicit listener registration owned by the component that emits `T`.
///
/// Once detached, the registry stays empty: late registrations are dropped and
/// `notify` becomes a no-op, so a callback racing with teardown never runs.
pub struct Observers<T> {
    entries: Mutex<Vec<(ObserverId, Callback<T>)>>,
    next_id: AtomicU64,
    detached: AtomicBool,
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        }
    }

    pub fn register(&self, callback: Callback<T>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if !self.detached.load(Ordering::Acquire) {
            lock(&self.entries).push((id, callback));
        }
        id
    }

    /// Removes one listener. Returns whether it was registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Calls every listener in registration order.
    pub fn notify(&self, event: &T) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        // Snapshot the list so a listener may (un)register without deadlocking.
        let callbacks: Vec<Callback<T>> = lock(&self.entries)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Drops all listeners and refuses new ones.
    pub fn detach_all(&self) {
        self.detached.store(true, Ordering::Release);
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("listeners", &self.len())
            .field("detached", &self.detached.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Callback<u32>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        let callback: Callback<u32> = Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    #[test]
    fn unregistered_listener_stops_receiving() {
        let observers = Observers::new();
        let (hits, callback) = counter();
        let id = observers.register(callback);

        observers.notify(&1);
        assert!(observers.unregister(id));
        observers.notify(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!observers.unregister(id));
    }

    #[test]
    fn detached_registry_ignores_everything() {
        let observers = Observers::new();
        let (hits, callback) = counter();
        observers.register(Arc::clone(&callback));
        observers.detach_all();

        observers.register(callback);
        observers.notify(&7);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(observers.is_empty());
    }
}
