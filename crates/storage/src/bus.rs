//! LocalChangeBus: in-process change signal fan-out
//!
//! Implements [`ChangeBus`] with a `DashMap` of subscriptions. Publishing is
//! synchronous: matching callbacks run on the publishing thread, after the
//! map guards are dropped so a callback may subscribe or unsubscribe.
//!
//! Every engine instance sharing one bus sees every publish, the publisher
//! included, which is what the cross-process contract requires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use sharedprefs_core::{Address, ChangeBus, ChangeCallback, SubscriptionId};

struct Subscription {
    address: Address,
    descendants: bool,
    callback: ChangeCallback,
}

impl Subscription {
    fn matches(&self, published: &Address) -> bool {
        if self.descendants {
            published.is_descendant_of(&self.address)
        } else {
            *published == self.address
        }
    }
}

#[derive(Default)]
struct BusInner {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
    published: AtomicU64,
}

/// Address-keyed publish/subscribe shared by clones
#[derive(Clone, Default)]
pub struct LocalChangeBus {
    inner: Arc<BusInner>,
}

impl LocalChangeBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Number of publish calls so far
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LocalChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChangeBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published_count())
            .finish()
    }
}

impl ChangeBus for LocalChangeBus {
    fn subscribe(
        &self,
        address: Address,
        descendants: bool,
        callback: ChangeCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        trace!(target: "sharedprefs::notify", %address, descendants, %id, "subscribed");
        self.inner.subscriptions.insert(
            id,
            Subscription {
                address,
                descendants,
                callback,
            },
        );
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.remove(&id).is_some()
    }

    fn publish(&self, address: &Address) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let mut targets: Vec<(SubscriptionId, ChangeCallback)> = self
            .inner
            .subscriptions
            .iter()
            .filter(|s| s.value().matches(address))
            .map(|s| (*s.key(), Arc::clone(&s.value().callback)))
            .collect();
        targets.sort_by_key(|(id, _)| *id);

        trace!(target: "sharedprefs::notify", %address, subscribers = targets.len(), "publish");
        for (_, callback) in targets {
            callback(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sharedprefs_core::RowId;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, ChangeCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let cb: ChangeCallback = Arc::new(move |a: &Address| s.lock().push(a.to_string()));
        (seen, cb)
    }

    #[test]
    fn test_descendant_subscription_sees_rows() {
        let bus = LocalChangeBus::new();
        let (seen, cb) = recorder();
        bus.subscribe(Address::table("p"), true, cb);

        bus.publish(&Address::row("p", RowId::new(4)));
        bus.publish(&Address::key("p", "volume"));
        bus.publish(&Address::row("q", RowId::new(4)));

        assert_eq!(*seen.lock(), vec!["p/rows/4".to_string()]);
    }

    #[test]
    fn test_exact_subscription() {
        let bus = LocalChangeBus::new();
        let (seen, cb) = recorder();
        bus.subscribe(Address::table("p"), false, cb);

        bus.publish(&Address::row("p", RowId::new(1)));
        bus.publish(&Address::table("p"));

        assert_eq!(*seen.lock(), vec!["p/rows".to_string()]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = LocalChangeBus::new();
        let (seen, cb) = recorder();
        let id = bus.subscribe(Address::key("p", "k"), false, cb);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&Address::key("p", "k"));
        assert!(seen.lock().is_empty());
        assert_eq!(bus.published_count(), 1);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let bus = LocalChangeBus::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (b, s) = (bus.clone(), Arc::clone(&slot));
        let id = bus.subscribe(
            Address::key("p", "once"),
            false,
            Arc::new(move |_: &Address| {
                if let Some(id) = s.lock().take() {
                    b.unsubscribe(id);
                }
            }),
        );
        *slot.lock() = Some(id);

        bus.publish(&Address::key("p", "once"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
