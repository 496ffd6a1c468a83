//! Preferences store handle
//!
//! One [`Preferences`] per process and store. Opening it wires the pieces
//! together:
//!
//! ```text
//! Editor ──stage──► MemoryCache ◄──apply_persisted── ChangeNotifier
//!    │                  │                                  ▲
//!    │ apply/commit     │ cache events                     │ row addresses
//!    ▼                  ▼                                  │
//! SerialQueue ──► StorageCoordinator ──dirty rows──► ChangeBus
//!                                                          ▲
//!                 change listeners + key addresses ────────┘
//! ```
//!
//! The handle is created explicitly and passed to its users; there is no
//! process-wide instance.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use sharedprefs_core::{
    Address, ChangeBus, ChangeCallback, Error, PrefValue, Result, RowStore, SubscriptionId,
    ValueType,
};

use crate::cache::{spawn_warm_load, CacheEvent, MemoryCache};
use crate::config::PrefsConfig;
use crate::coordinator::{StorageCoordinator, TransactionMetrics};
use crate::editor::{Commit, Editor};
use crate::listeners::{Listener, ListenerHandle, ListenerRegistry};
use crate::notifier::ChangeNotifier;
use crate::serial_queue::{QueueStats, SerialQueue};

/// Typed, cross-process key-value store handle
pub struct Preferences {
    config: PrefsConfig,
    cache: Arc<MemoryCache>,
    coordinator: Arc<StorageCoordinator>,
    queue: SerialQueue,
    bus: Arc<dyn ChangeBus>,
    notifier: ChangeNotifier,
    change_listeners: Arc<ListenerRegistry<str>>,
    watches: Mutex<FxHashSet<SubscriptionId>>,
    loader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preferences")
            .field("authority", &self.config.authority)
            .field("cache", &self.cache)
            .field("queue", &self.queue)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Preferences {
    /// Open a handle over `store`, listening for changes on `bus`
    ///
    /// Returns immediately; the cache warm-loads in the background.
    ///
    /// # Errors
    /// `Config` for an invalid configuration, `Persistence` if a worker
    /// thread cannot be started.
    pub fn open(
        config: PrefsConfig,
        store: Arc<dyn RowStore>,
        bus: Arc<dyn ChangeBus>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(MemoryCache::new());
        let coordinator = Arc::new(StorageCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            config.authority.clone(),
            config.origin(),
            config.batch_limits(),
            config.lock_timeout(),
        ));
        let queue = SerialQueue::new(config.queue_name.clone())?;
        let change_listeners: Arc<ListenerRegistry<str>> = Arc::new(ListenerRegistry::new());

        // Cache events fan out to change listeners and to key watchers
        {
            let listeners = Arc::clone(&change_listeners);
            let bus = Arc::downgrade(&bus);
            let authority = config.authority.clone();
            cache.add_listener(Arc::new(move |event: &CacheEvent| {
                let Some(key) = event.key() else {
                    return;
                };
                listeners.dispatch(key);
                if let Some(bus) = bus.upgrade() {
                    bus.publish(&Address::key(authority.clone(), key));
                }
            }));
        }

        let notifier = ChangeNotifier::attach(
            Arc::clone(&bus),
            &config.authority,
            Arc::clone(&store),
            Arc::clone(&cache),
        );

        let loader = spawn_warm_load(
            Arc::clone(&cache),
            move || store.query_all(),
            config.load_retries,
            Duration::from_millis(config.load_retry_backoff_ms),
        )?;

        info!(
            target: "sharedprefs::cache",
            authority = %config.authority,
            origin = %coordinator.origin(),
            "Preferences opened"
        );

        Ok(Self {
            config,
            cache,
            coordinator,
            queue,
            bus,
            notifier,
            change_listeners,
            watches: Mutex::new(FxHashSet::default()),
            loader: Mutex::new(Some(loader)),
            closed: AtomicBool::new(false),
        })
    }

    // === Reads ===

    fn get_typed<T>(
        &self,
        key: &str,
        default: T,
        expected: ValueType,
        extract: impl FnOnce(PrefValue) -> Option<T>,
    ) -> Result<T> {
        let Some(entry) = self.cache.get(key)? else {
            return Ok(default);
        };
        let actual = entry.value.type_name();
        extract(entry.value).ok_or_else(|| Error::TypeMismatch {
            key: key.to_string(),
            expected: expected.as_str(),
            actual,
        })
    }

    /// Bool stored at `key`, or `default` if absent
    ///
    /// # Errors
    /// `TypeMismatch` if `key` holds another type, `CorruptValue` if its row
    /// could not be decoded.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        self.get_typed(key, default, ValueType::Bool, |v| v.as_bool())
    }

    /// i32 stored at `key`, or `default` if absent
    pub fn get_int(&self, key: &str, default: i32) -> Result<i32> {
        self.get_typed(key, default, ValueType::Int, |v| v.as_int())
    }

    /// i64 stored at `key`, or `default` if absent
    pub fn get_long(&self, key: &str, default: i64) -> Result<i64> {
        self.get_typed(key, default, ValueType::Long, |v| v.as_long())
    }

    /// f32 stored at `key`, or `default` if absent
    pub fn get_float(&self, key: &str, default: f32) -> Result<f32> {
        self.get_typed(key, default, ValueType::Float, |v| v.as_float())
    }

    /// String stored at `key`, or `default` if absent
    pub fn get_string(&self, key: &str, default: &str) -> Result<String> {
        self.get_typed(key, default.to_string(), ValueType::String, |v| match v {
            PrefValue::String(s) => Some(s),
            _ => None,
        })
    }

    /// String set stored at `key`, or `default` if absent
    pub fn get_string_set(&self, key: &str, default: BTreeSet<String>) -> Result<BTreeSet<String>> {
        self.get_typed(key, default, ValueType::StringSet, |v| match v {
            PrefValue::StringSet(s) => Some(s),
            _ => None,
        })
    }

    /// Opaque value stored at `key`, deserialized into `T`
    ///
    /// # Errors
    /// `TypeMismatch` if `key` is not opaque, `CorruptValue` if it does not
    /// deserialize into `T`.
    pub fn get_opaque<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.cache.get(key)? else {
            return Ok(None);
        };
        match entry.value {
            PrefValue::Opaque(v) => {
                serde_json::from_value(v)
                    .map(Some)
                    .map_err(|e| Error::CorruptValue {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })
            }
            other => Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: ValueType::Opaque.as_str(),
                actual: other.type_name(),
            }),
        }
    }

    /// Untyped value stored at `key`
    pub fn get(&self, key: &str) -> Result<Option<PrefValue>> {
        Ok(self.cache.get(key)?.map(|entry| entry.value))
    }

    /// True if `key` has a value
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    /// Every readable key and value
    pub fn get_all(&self) -> BTreeMap<String, PrefValue> {
        self.cache.get_all()
    }

    // === Writes ===

    /// Start a batch of edits
    pub fn edit(&self) -> Editor<'_> {
        Editor::new(self)
    }

    pub(crate) fn on_apply(&self, commit: Commit) {
        if commit.is_empty() {
            return;
        }
        if self.is_closed() {
            warn!(target: "sharedprefs::queue", operations = commit.len(), "Dropping commit applied after close");
            return;
        }
        let ops = commit.operations();
        self.cache.stage(&ops);

        let coordinator = Arc::clone(&self.coordinator);
        let interval = self.config.commit_yield_interval;
        let submitted = self.queue.submit("apply", move || {
            commit.execute(&coordinator, interval).map(|_| ())
        });
        if let Err(e) = submitted {
            warn!(target: "sharedprefs::queue", error = %e, "Dropping applied commit");
            self.cache.discard(&ops);
        }
    }

    pub(crate) fn on_commit(&self, commit: Commit) -> bool {
        if commit.is_empty() {
            return true;
        }
        if self.is_closed() {
            warn!(target: "sharedprefs::queue", operations = commit.len(), "Rejecting commit after close");
            return false;
        }
        let ops = commit.operations();
        self.cache.stage(&ops);

        let interval = self.config.commit_yield_interval;
        match self
            .queue
            .run_inline("commit", || commit.execute(&self.coordinator, interval))
        {
            Ok(outcome) => {
                debug!(target: "sharedprefs::queue", operations = outcome.results.len(), yields = outcome.yields, "Commit persisted");
                true
            }
            Err(e) => {
                warn!(target: "sharedprefs::queue", error = %e, "Commit failed");
                if self.queue.is_shutdown() {
                    self.cache.discard(&ops);
                }
                false
            }
        }
    }

    /// Block until every applied commit has been persisted
    pub fn flush(&self) {
        self.queue.drain();
    }

    // === Listeners ===

    /// Call `listener` with the key of every store-confirmed change
    ///
    /// Listeners run on the thread that persisted the change. They must not
    /// call [`Editor::commit`], which would wait on itself.
    pub fn register_change_listener(&self, listener: Listener<str>) -> ListenerHandle {
        self.change_listeners.register(listener)
    }

    /// Remove a change listener. Returns false if it was not registered.
    pub fn unregister_change_listener(&self, handle: ListenerHandle) -> bool {
        self.change_listeners.unregister(handle)
    }

    /// Bus address on which changes of `key` are published
    pub fn address_for(&self, key: &str) -> Address {
        Address::key(self.config.authority.clone(), key)
    }

    /// Subscribe to changes of `key` made by any process sharing the bus
    pub fn watch_key(&self, key: &str, callback: ChangeCallback) -> SubscriptionId {
        let id = self.bus.subscribe(self.address_for(key), false, callback);
        self.watches.lock().insert(id);
        id
    }

    /// Cancel a [`watch_key`](Self::watch_key) subscription
    pub fn unwatch(&self, id: SubscriptionId) -> bool {
        self.watches.lock().remove(&id) && self.bus.unsubscribe(id)
    }

    // === State ===

    /// True once the warm load has completed
    pub fn is_loaded(&self) -> bool {
        self.cache.is_loaded()
    }

    /// Block until the warm load completes or `timeout` elapses
    pub fn wait_until_loaded(&self, timeout: Option<Duration>) -> bool {
        self.cache.wait_until_loaded(timeout)
    }

    /// Error of the last failed warm-load attempt
    pub fn load_error(&self) -> Option<Error> {
        self.cache.load_error()
    }

    /// Configuration in use
    pub fn config(&self) -> &PrefsConfig {
        &self.config
    }

    /// Transaction metrics of the store coordinator
    pub fn metrics(&self) -> TransactionMetrics {
        self.coordinator.metrics()
    }

    /// Commit queue metrics
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Store coordinator used for persistence
    pub fn coordinator(&self) -> &StorageCoordinator {
        &self.coordinator
    }

    /// True once [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Persist queued commits, then tear the handle down
    ///
    /// Stops listening on the bus, drops listeners and watches, and shuts the
    /// commit queue down. Later edits are dropped and `commit()` returns
    /// false. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.drain();
        self.queue.shutdown();
        self.notifier.detach();
        for id in self.watches.lock().drain() {
            self.bus.unsubscribe(id);
        }
        self.change_listeners.clear();
        self.cache.close();

        if let Some(handle) = self.loader.lock().take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        info!(target: "sharedprefs::cache", authority = %self.config.authority, "Preferences closed");
    }
}

impl Drop for Preferences {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharedprefs_core::{Origin, RawValue, Row, RowId};
    use sharedprefs_storage::{LocalChangeBus, MemoryStore};

    fn config() -> PrefsConfig {
        PrefsConfig {
            authority: "test".to_string(),
            origin: Some("me".to_string()),
            yield_sleep_ms: 0,
            ..PrefsConfig::default()
        }
    }

    fn open(store: &MemoryStore, bus: &LocalChangeBus) -> Preferences {
        let prefs =
            Preferences::open(config(), Arc::new(store.clone()), Arc::new(bus.clone())).unwrap();
        assert!(prefs.wait_until_loaded(Some(Duration::from_secs(5))));
        prefs
    }

    #[test]
    fn test_commit_then_read() {
        let prefs = open(&MemoryStore::new(), &LocalChangeBus::new());
        assert!(prefs.edit().put_string("a", "x").commit());
        assert_eq!(prefs.get_string("a", "").unwrap(), "x");
        assert_eq!(prefs.metrics().total_committed, 1);
    }

    #[test]
    fn test_absent_key_returns_default() {
        let prefs = open(&MemoryStore::new(), &LocalChangeBus::new());
        assert!(prefs.get_bool("missing", true).unwrap());
        assert_eq!(prefs.get_int("missing", -1).unwrap(), -1);
        assert_eq!(prefs.get_long("missing", 7).unwrap(), 7);
        assert_eq!(prefs.get_float("missing", 0.5).unwrap(), 0.5);
        assert!(prefs.get_string_set("missing", BTreeSet::new()).unwrap().is_empty());
        assert_eq!(prefs.get_opaque::<u32>("missing").unwrap(), None);
    }

    #[test]
    fn test_type_mismatch() {
        let prefs = open(&MemoryStore::new(), &LocalChangeBus::new());
        prefs.edit().put_int("n", 5).apply();
        let err = prefs.get_string("n", "dflt").unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch {
                key: "n".to_string(),
                expected: "string",
                actual: "int",
            }
        );
        assert_eq!(prefs.get_int("n", 0).unwrap(), 5);
    }

    #[test]
    fn test_loaded_rows_visible() {
        let store = MemoryStore::new();
        store.insert_raw(Row {
            id: RowId::UNASSIGNED,
            key: "seed".to_string(),
            type_tag: Some("bool".to_string()),
            value: RawValue::Integer(1),
            origin: Some(Origin::new("other")),
        });
        let prefs = open(&store, &LocalChangeBus::new());
        assert!(prefs.get_bool("seed", false).unwrap());
        assert!(prefs.contains("seed"));
        assert_eq!(prefs.get_all().len(), 1);
    }

    #[test]
    fn test_opaque_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Window {
            w: u32,
            h: u32,
        }

        let prefs = open(&MemoryStore::new(), &LocalChangeBus::new());
        assert!(prefs
            .edit()
            .put_opaque("window", &Window { w: 640, h: 480 })
            .unwrap()
            .commit());
        assert_eq!(
            prefs.get_opaque::<Window>("window").unwrap(),
            Some(Window { w: 640, h: 480 })
        );
        assert!(matches!(
            prefs.get_opaque::<Vec<String>>("window"),
            Err(Error::CorruptValue { .. })
        ));
    }

    #[test]
    fn test_change_listener_receives_keys() {
        let prefs = open(&MemoryStore::new(), &LocalChangeBus::new());
        let keys = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&keys);
        let handle = prefs.register_change_listener(Arc::new(move |key: &str| {
            k.lock().push(key.to_string())
        }));

        assert!(prefs.edit().put_bool("a", true).commit());
        assert!(prefs.edit().remove("a").commit());
        assert_eq!(*keys.lock(), vec!["a", "a"]);

        assert!(prefs.unregister_change_listener(handle));
        assert!(prefs.edit().put_bool("b", true).commit());
        assert_eq!(keys.lock().len(), 2);
    }

    #[test]
    fn test_watch_key() {
        let bus = LocalChangeBus::new();
        let prefs = open(&MemoryStore::new(), &bus);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let id = prefs.watch_key(
            "a",
            Arc::new(move |address: &Address| s.lock().push(address.clone())),
        );

        assert!(prefs.edit().put_int("a", 1).put_int("b", 2).commit());
        assert_eq!(*seen.lock(), vec![prefs.address_for("a")]);

        assert!(prefs.unwatch(id));
        assert!(!prefs.unwatch(id));
    }

    #[test]
    fn test_close_detaches_and_rejects_commits() {
        let bus = LocalChangeBus::new();
        let prefs = open(&MemoryStore::new(), &bus);
        prefs.watch_key("a", Arc::new(|_: &Address| {}));
        assert_eq!(bus.subscriber_count(), 2);

        prefs.close();
        prefs.close();
        assert!(prefs.is_closed());
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!prefs.edit().put_int("a", 1).commit());
    }

    #[test]
    fn test_writes_after_close_are_dropped() {
        let store = MemoryStore::new();
        let prefs = open(&store, &LocalChangeBus::new());
        prefs.edit().put_int("kept", 1).apply();
        prefs.close();

        prefs.edit().put_int("late", 42).apply();
        assert!(!prefs.edit().put_int("later", 43).commit());
        prefs.edit().remove("kept").apply();

        assert_eq!(prefs.get_int("late", -1).unwrap(), -1);
        assert_eq!(prefs.get_int("later", -1).unwrap(), -1);
        assert_eq!(prefs.get_int("kept", -1).unwrap(), 1);
        assert_eq!(prefs.cache.pending_len(), 0);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = PrefsConfig {
            authority: String::new(),
            ..PrefsConfig::default()
        };
        let err = Preferences::open(
            bad,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalChangeBus::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
