//! Change notifier
//!
//! Listens on the table address of the change bus. For every published row
//! address it re-reads that row from the store and hands the result to the
//! cache: a missing row is a removal, anything else is decoded and applied
//! as an insert or update. Key addresses share the bus and are ignored here.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use sharedprefs_core::{Address, ChangeBus, RowId, RowStore, SubscriptionId};

use crate::cache::{CachedRow, MemoryCache};

/// Subscription that keeps one cache in sync with the store
pub struct ChangeNotifier {
    bus: Arc<dyn ChangeBus>,
    table: Address,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("table", &self.table)
            .field("subscription", &*self.subscription.lock())
            .finish()
    }
}

impl ChangeNotifier {
    /// Subscribe `cache` to row changes under `authority`
    pub fn attach(
        bus: Arc<dyn ChangeBus>,
        authority: &str,
        store: Arc<dyn RowStore>,
        cache: Arc<MemoryCache>,
    ) -> Self {
        let table = Address::table(authority);
        let id = bus.subscribe(
            table.clone(),
            true,
            Arc::new(move |address: &Address| {
                if let Some(id) = address.row_id() {
                    refresh_row(store.as_ref(), &cache, id);
                } else {
                    trace!(target: "sharedprefs::notify", %address, "Ignoring non-row address");
                }
            }),
        );
        debug!(target: "sharedprefs::notify", %table, subscription = %id, "Notifier attached");

        Self {
            bus,
            table,
            subscription: Mutex::new(Some(id)),
        }
    }

    /// Address the notifier listens on
    pub fn table(&self) -> &Address {
        &self.table
    }

    /// True until [`detach`](Self::detach) is called
    pub fn is_attached(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Stop listening. Returns false if already detached.
    pub fn detach(&self) -> bool {
        match self.subscription.lock().take() {
            Some(id) => {
                debug!(target: "sharedprefs::notify", table = %self.table, subscription = %id, "Notifier detached");
                self.bus.unsubscribe(id)
            }
            None => false,
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Re-read row `id` and apply what the store holds to `cache`
pub fn refresh_row(store: &dyn RowStore, cache: &MemoryCache, id: RowId) {
    match store.query_id(id) {
        Ok(Some(row)) => {
            trace!(target: "sharedprefs::notify", %id, key = %row.key, "Row changed");
            cache.apply_persisted(id, Some(CachedRow::decode(&row)));
        }
        Ok(None) => {
            trace!(target: "sharedprefs::notify", %id, "Row removed");
            cache.apply_persisted(id, None);
        }
        Err(e) => {
            warn!(target: "sharedprefs::notify", %id, error = %e, "Failed to re-read changed row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharedprefs_core::{Origin, PrefValue, RawValue, Row};
    use sharedprefs_storage::{LocalChangeBus, MemoryStore};

    fn row(key: &str, value: i64) -> Row {
        Row {
            id: RowId::UNASSIGNED,
            key: key.to_string(),
            type_tag: Some("long".to_string()),
            value: RawValue::Integer(value),
            origin: Some(Origin::new("me")),
        }
    }

    fn setup() -> (MemoryStore, LocalChangeBus, Arc<MemoryCache>, ChangeNotifier) {
        let store = MemoryStore::new();
        let bus = LocalChangeBus::new();
        let cache = Arc::new(MemoryCache::new());
        cache.complete_load(Vec::new());
        let notifier = ChangeNotifier::attach(
            Arc::new(bus.clone()),
            "test",
            Arc::new(store.clone()),
            Arc::clone(&cache),
        );
        (store, bus, cache, notifier)
    }

    #[test]
    fn test_row_address_refreshes_cache() {
        let (store, bus, cache, _notifier) = setup();
        let id = store.insert_raw(row("a", 5));

        bus.publish(&Address::row("test", id));
        assert_eq!(
            cache.get("a").unwrap().map(|e| e.value),
            Some(PrefValue::Long(5))
        );
    }

    #[test]
    fn test_missing_row_is_removal() {
        let (_store, bus, cache, _notifier) = setup();
        cache.apply_persisted(
            RowId::new(3),
            Some(CachedRow {
                key: "gone".into(),
                value: Ok(PrefValue::Int(1)),
                origin: None,
            }),
        );

        bus.publish(&Address::row("test", RowId::new(3)));
        assert!(!cache.contains("gone"));
    }

    #[test]
    fn test_other_addresses_ignored() {
        let (store, bus, cache, _notifier) = setup();
        let id = store.insert_raw(row("a", 5));

        bus.publish(&Address::key("test", "a"));
        bus.publish(&Address::row("elsewhere", id));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failed_reread_keeps_cache() {
        let (store, bus, cache, _notifier) = setup();
        let id = store.insert_raw(row("a", 5));
        bus.publish(&Address::row("test", id));

        store.fail_next_reads(1);
        bus.publish(&Address::row("test", id));
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_detach() {
        let (store, bus, cache, notifier) = setup();
        assert!(notifier.is_attached());
        assert_eq!(bus.subscriber_count(), 1);

        assert!(notifier.detach());
        assert!(!notifier.detach());
        assert_eq!(bus.subscriber_count(), 0);

        let id = store.insert_raw(row("a", 5));
        bus.publish(&Address::row("test", id));
        assert!(cache.is_empty());
    }
}
