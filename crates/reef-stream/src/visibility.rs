use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type VisibilityListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Page visibility service: streams pause while the tab is hidden and
/// resume when it is shown again.
#[derive(Clone, Default)]
pub struct PageVisibility {
    inner: Arc<VisibilityInner>,
}

#[derive(Default)]
struct VisibilityInner {
    hidden: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, VisibilityListener)>>,
}

impl PageVisibility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_hidden(&self) -> bool {
        self.inner.hidden.load(Ordering::SeqCst)
    }

    /// Registers a change listener; returns the id used to deregister.
    pub fn on_change<F>(&self, listener: F) -> u64
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.inner
            .listeners
            .lock()
            .retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Driven by the embedding process when the document's visibility
    /// changes.
    pub fn set_hidden(&self, hidden: bool) {
        self.inner.hidden.store(hidden, Ordering::SeqCst);
        let snapshot: Vec<VisibilityListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(hidden);
        }
    }
}
