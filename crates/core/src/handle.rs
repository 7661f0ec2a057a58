//! Cancelable callback registration.
//!
//! Grounded in `original_source/include/ftl/handle.hpp`. The original header
//! documents two open hazards: a raw pointer from `Handle` back to its
//! `Handler` that dangles if the handler is destroyed first, and a
//! `return false to remove this callback` convention whose removal path
//! throws `not implemented`. Both are resolved here rather than carried
//! forward: the back-reference is a `Weak`, and `trigger` logs and ignores a
//! `false` return instead of erroring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Implemented by the handler lists `Handle` can detach from. Kept
/// object-safe (no generic `Args`) so a `Handle` can hold a single
/// `Weak<dyn BaseHandler>` regardless of which callback list produced it.
pub trait BaseHandler: Send + Sync {
    fn remove(&self, id: u64);
}

/// A cancelable registration returned by `Handler::on`. Dropping it removes
/// the callback; it can also be cancelled explicitly via `cancel`.
pub struct Handle {
    id: u64,
    owner: Weak<dyn BaseHandler>,
}

impl Handle {
    fn new(id: u64, owner: Weak<dyn BaseHandler>) -> Self {
        Self { id, owner }
    }

    /// Detach the callback early. A no-op if the owning `Handler` has
    /// already been dropped.
    pub fn cancel(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

type Callback<Args> = Box<dyn Fn(&Args) -> bool + Send + Sync>;

struct Slot<Args> {
    id: u64,
    callback: Callback<Args>,
}

/// A thread-safe, ordered list of callbacks invoked with a shared `&Args`.
/// Mirrors `ftl::Handler<Args...>` from the original header: `on` registers,
/// `trigger` calls every live callback in registration order.
pub struct Handler<Args> {
    slots: Mutex<Vec<Slot<Args>>>,
    next_id: AtomicU64,
}

impl<Args> Default for Handler<Args> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<Args: 'static> Handler<Args> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a callback, returning a `Handle` that removes it on drop.
    pub fn on<F>(self: &Arc<Self>, callback: F) -> Handle
    where
        F: Fn(&Args) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push(Slot { id, callback: Box::new(callback) });
        let owner: Weak<dyn BaseHandler> = Arc::downgrade(self) as Weak<dyn BaseHandler>;
        Handle::new(id, owner)
    }

    /// Call every registered callback in order.
    ///
    /// The original convention lets a callback return `false` to remove
    /// itself; that path is documented in the original as unimplemented
    /// ("Return value callback removal not implemented"). We keep that
    /// behaviour: a `false` return is logged and otherwise ignored, rather
    /// than invented as a new removal mechanism. Use the returned `Handle`
    /// to remove a callback instead.
    pub fn trigger(&self, args: &Args) {
        let callbacks: Vec<_> = {
            let slots = self.slots.lock();
            slots.iter().map(|s| (s.id, s.callback.as_ref() as *const _)).collect()
        };
        // Re-borrow per call rather than holding the lock across callback
        // execution, since callbacks may themselves call `on`/`cancel`.
        let snapshot_ids: Vec<u64> = callbacks.iter().map(|(id, _)| *id).collect();
        for id in snapshot_ids {
            let called = {
                let slots = self.slots.lock();
                slots.iter().find(|s| s.id == id).map(|s| (s.callback)(args))
            };
            if let Some(false) = called {
                tracing::warn!(callback_id = id, "callback requested removal via false return; not implemented, ignoring");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Args: 'static> BaseHandler for Handler<Args> {
    fn remove(&self, id: u64) {
        self.slots.lock().retain(|s| s.id != id);
    }
}

/// Single-slot variant for callbacks that only ever have one subscriber
/// (`onConnect` in the original). Registering a new callback replaces the
/// previous one rather than appending.
pub struct SingletonHandler<Args> {
    slot: Mutex<Option<(u64, Callback<Args>)>>,
    next_id: AtomicU64,
}

impl<Args> Default for SingletonHandler<Args> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<Args: 'static> SingletonHandler<Args> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on<F>(self: &Arc<Self>, callback: F) -> Handle
    where
        F: Fn(&Args) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self.slot.lock() = Some((id, Box::new(callback)));
        let owner: Weak<dyn BaseHandler> = Arc::downgrade(self) as Weak<dyn BaseHandler>;
        Handle::new(id, owner)
    }

    pub fn trigger(&self, args: &Args) {
        let result = {
            let slot = self.slot.lock();
            slot.as_ref().map(|(id, cb)| (*id, cb(args)))
        };
        if let Some((id, false)) = result {
            tracing::warn!(callback_id = id, "singleton callback requested removal via false return; not implemented, ignoring");
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<Args: 'static> BaseHandler for SingletonHandler<Args> {
    fn remove(&self, id: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|(sid, _)| *sid == id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn trigger_calls_registered_callback() {
        let handler: Arc<Handler<i32>> = Handler::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _handle = handler.on(move |v| {
            seen2.fetch_add(*v as usize, Ordering::SeqCst);
            true
        });
        handler.trigger(&5);
        handler.trigger(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn dropping_handle_removes_callback() {
        let handler: Arc<Handler<i32>> = Handler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handle = handler.on(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            true
        });
        handler.trigger(&0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(handle);
        handler.trigger(&0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handler.is_empty());
    }

    #[test]
    fn explicit_cancel_removes_callback() {
        let handler: Arc<Handler<()>> = Handler::new();
        let handle = handler.on(|_| true);
        assert_eq!(handler.len(), 1);
        handle.cancel();
        assert_eq!(handler.len(), 0);
    }

    #[test]
    fn false_return_is_ignored_not_removed() {
        let handler: Arc<Handler<()>> = Handler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let _handle = handler.on(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            false
        });
        handler.trigger(&());
        handler.trigger(&());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.len(), 1);
    }

    #[test]
    fn handle_outliving_handler_is_harmless() {
        let handler: Arc<Handler<()>> = Handler::new();
        let handle = handler.on(|_| true);
        drop(handler);
        handle.cancel();
    }

    #[test]
    fn singleton_handler_replaces_previous_callback() {
        let handler: Arc<SingletonHandler<i32>> = SingletonHandler::new();
        let total = Arc::new(AtomicUsize::new(0));
        let total1 = total.clone();
        let _h1 = handler.on(move |v| {
            total1.fetch_add(*v as usize, Ordering::SeqCst);
            true
        });
        let total2 = total.clone();
        let _h2 = handler.on(move |v| {
            total2.fetch_add(10 * *v as usize, Ordering::SeqCst);
            true
        });
        handler.trigger(&1);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }
}
