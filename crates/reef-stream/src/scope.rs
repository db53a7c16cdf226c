use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::channel::ApplyFn;

type DestroyHook = Arc<dyn Fn() + Send + Sync>;

/// UI binding context a stream writes into: named value slots, an apply
/// boundary, and destroy hooks.
///
/// Once destroyed, the apply boundary drops every callback, so late
/// deliveries cannot mutate the slots.
#[derive(Clone, Default)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Default)]
struct ScopeInner {
    slots: Mutex<HashMap<String, Value>>,
    destroyed: AtomicBool,
    next_id: AtomicU64,
    destroy_hooks: Mutex<Vec<(u64, DestroyHook)>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, expression: &str) -> Option<Value> {
        self.inner.slots.lock().get(expression).cloned()
    }

    pub fn set(&self, expression: &str, value: Value) {
        if !self.is_destroyed() {
            self.inner
                .slots
                .lock()
                .insert(expression.to_string(), value);
        }
    }

    /// Change-detection boundary: callbacks run only while the scope is
    /// alive.
    pub fn apply_fn(&self) -> ApplyFn {
        let inner = self.inner.clone();
        Arc::new(move |callback| {
            if !inner.destroyed.load(Ordering::SeqCst) {
                callback();
            }
        })
    }

    pub fn on_destroy<F>(&self, hook: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .destroy_hooks
            .lock()
            .push((id, Arc::new(hook)));
        id
    }

    pub fn remove_destroy_hook(&self, id: u64) {
        self.inner
            .destroy_hooks
            .lock()
            .retain(|(hook_id, _)| *hook_id != id);
    }

    /// Fires destroy hooks exactly once; later calls are no-ops.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks: Vec<DestroyHook> = {
            let mut registered = self.inner.destroy_hooks.lock();
            registered.drain(..).map(|(_, hook)| hook).collect()
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}
