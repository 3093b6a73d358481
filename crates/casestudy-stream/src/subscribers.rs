use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

use crate::snapshot::SessionSnapshot;

type Callback = Box<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct Entry {
    id: u64,
    active: AtomicBool,
    callback: Callback,
}

/// Subscriber list plus an ordered delivery queue.
///
/// Snapshots are queued in publication order and delivered by whichever
/// caller wins the drain flag, so callbacks never run concurrently, always
/// see snapshots in revision order, and may call back into the session
/// (cancel, subscribe, unsubscribe) without deadlocking.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    entries: Mutex<Vec<Arc<Entry>>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<Arc<SessionSnapshot>>>,
    draining: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SubscriberRegistry {
    pub(crate) fn add<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push(Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        }));
        Subscription {
            registry: Arc::downgrade(self),
            id,
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = lock(&self.entries);
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = entries.remove(pos);
        entry.active.store(false, Ordering::Release);
        true
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Queues a snapshot. Callers hold the session lock so queue order
    /// matches revision order.
    pub(crate) fn enqueue(&self, snapshot: Arc<SessionSnapshot>) {
        lock(&self.queue).push_back(snapshot);
    }

    /// Delivers queued snapshots unless another caller is already doing so.
    ///
    /// Must be called without holding the session lock.
    pub(crate) fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _guard = DrainGuard(&self.draining);
                loop {
                    let next = lock(&self.queue).pop_front();
                    let Some(snapshot) = next else {
                        break;
                    };
                    // Stable copy: callbacks may (un)subscribe while we iterate.
                    let entries: Vec<Arc<Entry>> = lock(&self.entries).clone();
                    for entry in entries {
                        if entry.active.load(Ordering::Acquire) {
                            deliver(&entry, &snapshot);
                        }
                    }
                }
            }
            // A snapshot may have been queued after the last pop but before
            // the flag was released.
            if lock(&self.queue).is_empty() {
                return;
            }
        }
    }
}

/// Runs one callback. A panicking callback is logged and skipped; it must
/// not take down the task that publishes.
fn deliver(entry: &Entry, snapshot: &SessionSnapshot) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.callback)(snapshot))) {
        warn!(
            subscriber = entry.id,
            revision = snapshot.revision,
            panic = panic_message(payload.as_ref()),
            "subscriber callback panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// Handle returned by `StreamingSession::subscribe`.
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Clone, Debug)]
pub struct Subscription {
    registry: Weak<SubscriberRegistry>,
    id: u64,
}

impl Subscription {
    /// Stops further deliveries to this callback. Idempotent; safe to call
    /// from inside any subscriber callback, including this one.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    /// Whether the callback will still receive snapshots.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| lock(&registry.entries).iter().any(|e| e.id == self.id))
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn snapshot(revision: u64) -> Arc<SessionSnapshot> {
        let mut snapshot = SessionSnapshot::idle(uuid::Uuid::nil());
        snapshot.revision = revision;
        Arc::new(snapshot)
    }

    #[test]
    fn delivers_in_queue_order_to_every_subscriber() {
        let registry = Arc::new(SubscriberRegistry::default());
        let seen_a = Arc::new(StdMutex::new(Vec::new()));
        let seen_b = Arc::new(StdMutex::new(Vec::new()));
        let a = seen_a.clone();
        let b = seen_b.clone();
        registry.add(move |s| a.lock().expect("a").push(s.revision));
        registry.add(move |s| b.lock().expect("b").push(s.revision));

        for rev in 1..=3 {
            registry.enqueue(snapshot(rev));
        }
        registry.drain();
        assert_eq!(*seen_a.lock().expect("a"), vec![1, 2, 3]);
        assert_eq!(*seen_b.lock().expect("b"), vec![1, 2, 3]);
    }

    #[test]
    fn unsubscribe_inside_callback_keeps_other_deliveries() {
        let registry = Arc::new(SubscriberRegistry::default());
        let own: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let own_in_cb = own.clone();
        let first_calls = Arc::new(AtomicU64::new(0));
        let first_calls_cb = first_calls.clone();
        let sub = registry.add(move |_| {
            first_calls_cb.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = own_in_cb.lock().expect("own").as_ref() {
                sub.unsubscribe();
            }
        });
        *own.lock().expect("own") = Some(sub.clone());

        let second_calls = Arc::new(AtomicU64::new(0));
        let second_calls_cb = second_calls.clone();
        registry.add(move |_| {
            second_calls_cb.fetch_add(1, Ordering::SeqCst);
        });

        registry.enqueue(snapshot(1));
        registry.enqueue(snapshot(2));
        registry.drain();

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 2);
        assert!(!sub.is_active());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unsubscribing_a_later_subscriber_mid_delivery_skips_it() {
        let registry = Arc::new(SubscriberRegistry::default());
        let victim: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let victim_cb = victim.clone();
        registry.add(move |_| {
            if let Some(sub) = victim_cb.lock().expect("victim").as_ref() {
                sub.unsubscribe();
            }
        });
        let victim_calls = Arc::new(AtomicU64::new(0));
        let victim_calls_cb = victim_calls.clone();
        let sub = registry.add(move |_| {
            victim_calls_cb.fetch_add(1, Ordering::SeqCst);
        });
        *victim.lock().expect("victim") = Some(sub);

        registry.enqueue(snapshot(1));
        registry.drain();
        assert_eq!(victim_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reentrant_enqueue_is_delivered_after_current_snapshot() {
        let registry = Arc::new(SubscriberRegistry::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let weak = Arc::downgrade(&registry);
        registry.add(move |s| {
            seen_cb.lock().expect("seen").push(s.revision);
            if s.revision == 1
                && let Some(registry) = weak.upgrade()
            {
                registry.enqueue(snapshot(2));
                registry.drain();
            }
        });
        registry.enqueue(snapshot(1));
        registry.drain();
        assert_eq!(*seen.lock().expect("seen"), vec![1, 2]);
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let registry = Arc::new(SubscriberRegistry::default());
        registry.add(|s| {
            if s.revision == 1 {
                panic!("render failed");
            }
        });
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        registry.add(move |s| seen_cb.lock().expect("seen").push(s.revision));

        registry.enqueue(snapshot(1));
        registry.enqueue(snapshot(2));
        registry.drain();
        assert_eq!(*seen.lock().expect("seen"), vec![1, 2]);

        // The drain flag was released; later snapshots still flow.
        registry.enqueue(snapshot(3));
        registry.drain();
        assert_eq!(*seen.lock().expect("seen"), vec![1, 2, 3]);
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_a_no_op() {
        let registry = Arc::new(SubscriberRegistry::default());
        let sub = registry.add(|_| {});
        drop(registry);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
