//! Fan-out of snapshot updates to independent consumers. Subscribing replays
//! the current entries synchronously, then delivers every later commit
//! exactly once until the subscription is dropped or unsubscribed.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::snapshot::Entries;

pub type UpdateFn = Arc<dyn Fn(&Entries) + Send + Sync>;

struct Slot {
    id: u64,
    /// Commit version the subscriber has already seen, starting at the one
    /// it replayed.
    seen: u64,
    callback: UpdateFn,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    subscribers: Vec<Slot>,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `current` (the state at commit `version`) to the callback,
    /// then register it for later commits. The caller holds the lock that
    /// serializes commits across both steps, so every commit lands either in
    /// the replay or in a later `notify`, never both and never neither.
    pub fn subscribe(
        &self,
        current: &Entries,
        version: u64,
        callback: impl Fn(&Entries) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: UpdateFn = Arc::new(callback);
        callback(current);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Slot {
            id,
            seen: version,
            callback,
        });
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver the commit tagged `version`. Subscribers whose replay already
    /// covered it are skipped, so a subscription racing an in-flight commit
    /// still sees that state exactly once.
    pub fn notify(&self, version: u64, entries: &Entries) {
        // Snapshot the callback list so a callback may subscribe or
        // unsubscribe without deadlocking on the registry lock.
        let callbacks: Vec<UpdateFn> = {
            let mut inner = self.inner.lock();
            inner
                .subscribers
                .iter_mut()
                .filter_map(|slot| {
                    if slot.seen >= version {
                        return None;
                    }
                    slot.seen = version;
                    Some(slot.callback.clone())
                })
                .collect()
        };
        for callback in callbacks {
            callback(entries);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }
}

/// Unsubscribe guard. Calling `unsubscribe` more than once is harmless, as
/// is outliving the registry.
pub struct Subscription {
    registry: Weak<Mutex<RegistryInner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().subscribers.retain(|slot| slot.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribe_replays_current_state() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(&Entries::list([json!("a")]), 0, move |entries| {
            sink.lock().push(entries.to_value());
        });
        assert_eq!(*seen.lock(), vec![json!(["a"])]);
    }

    #[test]
    fn every_subscriber_sees_each_update_once() {
        let registry = SubscriberRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let empty = Entries::empty_list();

        let counter = first.clone();
        let _a = registry.subscribe(&empty, 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        let _b = registry.subscribe(&empty, 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify(1, &Entries::list([json!(1)]));
        registry.notify(2, &Entries::list([json!(1), json!(2)]));

        // One replay plus two updates each.
        assert_eq!(first.load(Ordering::SeqCst), 3);
        assert_eq!(second.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn replayed_commit_is_not_redelivered() {
        let registry = SubscriberRegistry::new();
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));

        let counter = early.clone();
        let _a = registry.subscribe(&Entries::empty_list(), 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // Registered after commit 1, replaying the state it produced.
        let counter = late.clone();
        let _b = registry.subscribe(&Entries::list([json!(1)]), 1, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Commit 1's own notification arrives after the registration: the
        // late subscriber already saw it via replay and must be skipped.
        registry.notify(1, &Entries::list([json!(1)]));
        assert_eq!(early.load(Ordering::SeqCst), 2);
        assert_eq!(late.load(Ordering::SeqCst), 1);

        registry.notify(2, &Entries::list([json!(1), json!(2)]));
        assert_eq!(early.load(Ordering::SeqCst), 3);
        assert_eq!(late.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sub = registry.subscribe(&Entries::empty_list(), 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        sub.unsubscribe();
        registry.notify(1, &Entries::list([json!(1)]));
        assert_eq!(count.load(Ordering::SeqCst), 1); // replay only
        assert!(registry.is_empty());
    }

    #[test]
    fn callback_may_unsubscribe_during_notify() {
        let registry = SubscriberRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner_slot = slot.clone();
        let sub = registry.subscribe(&Entries::empty_list(), 0, move |_| {
            if let Some(sub) = inner_slot.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        registry.notify(1, &Entries::empty_list());
        assert!(registry.is_empty());
    }
}
