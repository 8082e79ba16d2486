//! Event subscription registry.
//!
//! The single home of once/on/off semantics for sessions and streams. A
//! [`Hub`] holds typed one-shot and persistent handlers; subscribing returns
//! a [`Subscription`], a first-class unsubscribe capability that is always
//! safe to invoke, including twice or after the event already fired.
//!
//! Terminal events (close, error, want-trailers) use the sticky latch:
//! [`Hub::latch`] records the value at most once, [`Hub::flush`] delivers it
//! to pending handlers, and any subscription made after the latch fires the
//! handler synchronously so a late listener can never miss the event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type OnceHandler<T> = Box<dyn FnOnce(T) + Send>;
type PersistentHandler<T> = Box<dyn FnMut(T) + Send>;

struct HubState<T> {
    next_id: u64,
    once: Vec<(u64, OnceHandler<T>)>,
    persistent: Vec<(u64, PersistentHandler<T>)>,
    latched: Option<T>,
    flushed: bool,
    dispatching: bool,
    removed_mid_dispatch: Vec<u64>,
    /// Values emitted while a dispatch is in progress, reentrantly or from
    /// another thread; the active dispatcher drains them in order.
    queued: VecDeque<(T, bool)>,
}

/// A typed event source with one-shot and persistent subscriptions.
pub struct Hub<T> {
    inner: Arc<Mutex<HubState<T>>>,
}

impl<T> Default for Hub<T> {
    fn default() -> Self {
        Hub::new()
    }
}

impl<T> Hub<T> {
    pub fn new() -> Self {
        Hub {
            inner: Arc::new(Mutex::new(HubState {
                next_id: 0,
                once: Vec::new(),
                persistent: Vec::new(),
                latched: None,
                flushed: false,
                dispatching: false,
                removed_mid_dispatch: Vec::new(),
                queued: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone + Send + 'static> Hub<T> {
    /// Registers a handler that fires at most once, then detaches itself.
    ///
    /// If the hub is already latched the handler is invoked synchronously on
    /// the caller's thread and the returned subscription is inert.
    pub fn subscribe_once(&self, handler: impl FnOnce(T) + Send + 'static) -> Subscription {
        let mut st = self.state();
        if let Some(value) = st.latched.clone() {
            drop(st);
            handler(value);
            return Subscription::inert();
        }
        let id = st.next_id;
        st.next_id += 1;
        st.once.push((id, Box::new(handler)));
        drop(st);
        Subscription::attached(&self.inner, id)
    }

    /// Registers a handler that fires on every occurrence until unsubscribed.
    ///
    /// On an already-latched hub the handler fires synchronously once; a
    /// latched event is terminal, so nothing further will be delivered.
    pub fn subscribe(&self, mut handler: impl FnMut(T) + Send + 'static) -> Subscription {
        let mut st = self.state();
        if let Some(value) = st.latched.clone() {
            drop(st);
            handler(value);
            return Subscription::inert();
        }
        let id = st.next_id;
        st.next_id += 1;
        st.persistent.push((id, Box::new(handler)));
        drop(st);
        Subscription::attached(&self.inner, id)
    }

    /// Delivers a non-terminal occurrence to every registered handler.
    pub fn emit(&self, value: T) {
        self.dispatch(value, false);
    }

    /// Records the terminal value. Returns `false` if already latched, which
    /// makes at-most-once delivery hold no matter how many paths race to
    /// settle the same entity.
    pub fn latch(&self, value: T) -> bool {
        let mut st = self.state();
        if st.latched.is_some() {
            return false;
        }
        st.latched = Some(value);
        true
    }

    pub fn is_latched(&self) -> bool {
        self.state().latched.is_some()
    }

    /// Delivers the latched value to handlers registered before the latch.
    /// Handlers registered after the latch were already invoked at
    /// subscription time.
    pub fn flush(&self) {
        let value = {
            let mut st = self.state();
            if st.flushed {
                return;
            }
            match st.latched.clone() {
                Some(value) => {
                    st.flushed = true;
                    value
                }
                None => return,
            }
        };
        self.dispatch(value, true);
    }

    fn dispatch(&self, value: T, terminal: bool) {
        {
            let mut st = self.state();
            if st.dispatching {
                // Another dispatch is running, reentrantly or on another
                // thread; hand the value to it so nothing is lost.
                st.queued.push_back((value, terminal));
                return;
            }
            st.dispatching = true;
        }

        let mut next = Some((value, terminal));
        while let Some((value, terminal)) = next.take() {
            // Handlers are moved out before invocation so they may subscribe
            // or unsubscribe on this hub reentrantly without deadlocking.
            let (once, mut persistent) = {
                let mut st = self.state();
                (
                    std::mem::take(&mut st.once),
                    std::mem::take(&mut st.persistent),
                )
            };

            for (id, handler) in once {
                if self.removed_during_dispatch(id) {
                    continue;
                }
                handler(value.clone());
            }
            for (id, handler) in persistent.iter_mut() {
                if self.removed_during_dispatch(*id) {
                    continue;
                }
                handler(value.clone());
            }

            let mut st = self.state();
            let removed = std::mem::take(&mut st.removed_mid_dispatch);
            if !terminal {
                persistent.retain(|(id, _)| !removed.contains(id));
                // Handlers added during dispatch landed in the state; keep
                // them after the ones that were already registered.
                let added = std::mem::take(&mut st.persistent);
                persistent.extend(added);
                st.persistent = persistent;
            }
            // Stay marked as dispatching until the queue is drained so late
            // arrivals keep funneling through this call.
            match st.queued.pop_front() {
                Some(item) => next = Some(item),
                None => st.dispatching = false,
            }
        }
    }

    fn removed_during_dispatch(&self, id: u64) -> bool {
        self.state().removed_mid_dispatch.contains(&id)
    }
}

/// Erased removal target so `Subscription` is the same type for every hub.
trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: Send + 'static> Detach for Mutex<HubState<T>> {
    fn detach(&self, id: u64) {
        let mut st = match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if st.dispatching {
            st.removed_mid_dispatch.push(id);
        }
        st.once.retain(|(i, _)| *i != id);
        st.persistent.retain(|(i, _)| *i != id);
    }
}

/// Deterministic unsubscribe capability returned by every subscription.
///
/// [`Subscription::unsubscribe`] is idempotent: invoking it twice, after the
/// event fired, or after the hub was dropped is a no-op, never an error.
pub struct Subscription {
    target: Option<Weak<dyn Detach>>,
    id: u64,
}

impl Subscription {
    fn inert() -> Subscription {
        Subscription { target: None, id: 0 }
    }

    fn attached<T: Send + 'static>(inner: &Arc<Mutex<HubState<T>>>, id: u64) -> Subscription {
        let erased: Arc<dyn Detach> = inner.clone();
        Subscription {
            target: Some(Arc::downgrade(&erased)),
            id,
        }
    }

    pub fn unsubscribe(&self) {
        if let Some(weak) = &self.target {
            if let Some(target) = weak.upgrade() {
                target.detach(self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let reader = {
            let count = count.clone();
            move || count.load(Ordering::SeqCst)
        };
        (count, reader)
    }

    #[test]
    fn once_fires_at_most_one_time() {
        let hub: Hub<u32> = Hub::new();
        let (count, read) = counter();
        hub.subscribe_once(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        hub.emit(1);
        hub.emit(2);
        assert_eq!(read(), 1);
    }

    #[test]
    fn persistent_fires_until_unsubscribed() {
        let hub: Hub<u32> = Hub::new();
        let (count, read) = counter();
        let sub = hub.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        hub.emit(1);
        hub.emit(2);
        sub.unsubscribe();
        hub.emit(3);
        assert_eq!(read(), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_safe_after_fire() {
        let hub: Hub<u32> = Hub::new();
        let (count, read) = counter();
        let sub = hub.subscribe_once(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        hub.emit(1);
        sub.unsubscribe();
        sub.unsubscribe();
        hub.emit(2);
        assert_eq!(read(), 1);
    }

    #[test]
    fn unsubscribe_before_fire_detaches() {
        let hub: Hub<u32> = Hub::new();
        let (count, read) = counter();
        let sub = hub.subscribe_once(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        hub.emit(1);
        assert_eq!(read(), 0);
    }

    #[test]
    fn latch_is_at_most_once() {
        let hub: Hub<u32> = Hub::new();
        assert!(hub.latch(7));
        assert!(!hub.latch(9));
        let (count, read) = counter();
        {
            let count = count.clone();
            hub.subscribe_once(move |v| {
                assert_eq!(v, 7);
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Subscribed after the latch: fired synchronously, flush must not
        // deliver a second time.
        hub.flush();
        hub.flush();
        assert_eq!(read(), 1);
    }

    #[test]
    fn flush_delivers_to_handlers_registered_before_latch() {
        let hub: Hub<u32> = Hub::new();
        let (count, read) = counter();
        hub.subscribe_once(move |v| {
            assert_eq!(v, 3);
            count.fetch_add(1, Ordering::SeqCst);
        });
        hub.latch(3);
        assert_eq!(read(), 0);
        hub.flush();
        assert_eq!(read(), 1);
    }

    #[test]
    fn subscription_outliving_hub_is_inert() {
        let sub = {
            let hub: Hub<u32> = Hub::new();
            hub.subscribe(|_| {})
        };
        sub.unsubscribe();
    }

    #[test]
    fn reentrant_emit_is_delivered_to_every_handler() {
        let hub: Hub<u32> = Hub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            hub.subscribe(move |v| seen.lock().unwrap().push(v));
        }
        {
            let hub2 = Hub {
                inner: hub.inner.clone(),
            };
            hub.subscribe(move |v| {
                if v == 1 {
                    hub2.emit(2);
                }
            });
        }
        hub.emit(1);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn emits_from_other_threads_are_not_lost() {
        let hub = Arc::new(Hub::<u32>::new());
        let (count, read) = counter();
        hub.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let first = {
            let hub = hub.clone();
            std::thread::spawn(move || hub.emit(1))
        };
        let second = {
            let hub = hub.clone();
            std::thread::spawn(move || hub.emit(2))
        };
        first.join().unwrap();
        second.join().unwrap();
        // An emit queued behind a concurrent dispatch is delivered before
        // either call returns.
        assert_eq!(read(), 2);
    }

    #[test]
    fn handler_may_subscribe_reentrantly() {
        let hub: Hub<u32> = Hub::new();
        let (count, read) = counter();
        {
            let hub2 = Hub {
                inner: hub.inner.clone(),
            };
            hub.subscribe_once(move |_| {
                let count = count.clone();
                hub2.subscribe_once(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            });
        }
        hub.emit(1);
        assert_eq!(read(), 0);
        hub.emit(2);
        assert_eq!(read(), 1);
    }
}
