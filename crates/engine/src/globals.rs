//! Convenience facade over an optional [`Preferences`] handle
//!
//! [`Globals`] is created empty and becomes usable after
//! [`initialize`](Globals::initialize). Until then reads return the caller's
//! default and writes are dropped; both log a warning. Keys must be
//! non-empty, and an empty key is handled the same way.
//!
//! The facade is an ordinary value: create one per process and pass it
//! around, typically inside an `Arc`.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use sharedprefs_core::{Address, Error, PrefValue, Result};

use crate::listeners::{Listener, ListenerHandle, ListenerRegistry};
use crate::preferences::Preferences;

/// Facade with not-initialized semantics and key-only change listeners
pub struct Globals {
    prefs: RwLock<Option<Arc<Preferences>>>,
    listeners: Arc<ListenerRegistry<str>>,
    forward: Mutex<Option<(Arc<Preferences>, ListenerHandle)>>,
}

impl Default for Globals {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Globals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Globals")
            .field("initialized", &self.is_initialized())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Globals {
    /// Create an uninitialized facade
    pub fn new() -> Self {
        Self {
            prefs: RwLock::new(None),
            listeners: Arc::new(ListenerRegistry::new()),
            forward: Mutex::new(None),
        }
    }

    /// Bind the facade to `prefs`
    ///
    /// Re-initializing switches to the new handle; listeners registered on
    /// the facade stay registered.
    pub fn initialize(&self, prefs: Arc<Preferences>) {
        let listeners = Arc::clone(&self.listeners);
        let handle = prefs.register_change_listener(Arc::new(move |key: &str| {
            listeners.dispatch(key);
        }));

        let previous = self.forward.lock().replace((Arc::clone(&prefs), handle));
        if let Some((old, old_handle)) = previous {
            old.unregister_change_listener(old_handle);
        }
        *self.prefs.write() = Some(prefs);
    }

    /// True after [`initialize`](Self::initialize)
    pub fn is_initialized(&self) -> bool {
        self.prefs.read().is_some()
    }

    /// Bound handle, if initialized
    pub fn preferences(&self) -> Option<Arc<Preferences>> {
        let prefs = self.prefs.read().clone();
        if prefs.is_none() {
            warn!(target: "sharedprefs::globals", "Preferences requested before initialize");
        }
        prefs
    }

    /// Bound handle for `key`, or `None` with a warning
    fn usable(&self, key: &str, action: &str) -> Option<Arc<Preferences>> {
        let prefs = self.prefs.read().clone();
        match prefs {
            None => {
                warn!(target: "sharedprefs::globals", key, action, error = %Error::NotInitialized, "Ignoring call");
                None
            }
            Some(_) if key.is_empty() => {
                warn!(target: "sharedprefs::globals", action, "Ignoring call with empty key");
                None
            }
            Some(prefs) => Some(prefs),
        }
    }

    // === Reads ===

    /// Bool at `key`, or `default`
    ///
    /// # Errors
    /// `TypeMismatch` or `CorruptValue` from the bound handle.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.usable(key, "get") {
            Some(prefs) => prefs.get_bool(key, default),
            None => Ok(default),
        }
    }

    /// i32 at `key`, or `default`
    pub fn get_int(&self, key: &str, default: i32) -> Result<i32> {
        match self.usable(key, "get") {
            Some(prefs) => prefs.get_int(key, default),
            None => Ok(default),
        }
    }

    /// i64 at `key`, or `default`
    pub fn get_long(&self, key: &str, default: i64) -> Result<i64> {
        match self.usable(key, "get") {
            Some(prefs) => prefs.get_long(key, default),
            None => Ok(default),
        }
    }

    /// f32 at `key`, or `default`
    pub fn get_float(&self, key: &str, default: f32) -> Result<f32> {
        match self.usable(key, "get") {
            Some(prefs) => prefs.get_float(key, default),
            None => Ok(default),
        }
    }

    /// String at `key`, or `default`
    pub fn get_string(&self, key: &str, default: &str) -> Result<String> {
        match self.usable(key, "get") {
            Some(prefs) => prefs.get_string(key, default),
            None => Ok(default.to_string()),
        }
    }

    /// String set at `key`, or `default`
    pub fn get_string_set(&self, key: &str, default: BTreeSet<String>) -> Result<BTreeSet<String>> {
        match self.usable(key, "get") {
            Some(prefs) => prefs.get_string_set(key, default),
            None => Ok(default),
        }
    }

    // === Writes ===

    /// Write `key = value`, synchronously when `commit` is set
    ///
    /// Returns false if the write was dropped or a synchronous commit failed.
    pub fn put(&self, key: &str, value: impl Into<PrefValue>, commit: bool) -> bool {
        let Some(prefs) = self.usable(key, "put") else {
            return false;
        };
        let mut editor = prefs.edit();
        editor.put(key, value);
        finish(&mut editor, commit)
    }

    /// Write a bool
    pub fn put_bool(&self, key: &str, value: bool, commit: bool) -> bool {
        self.put(key, PrefValue::Bool(value), commit)
    }

    /// Write an i32
    pub fn put_int(&self, key: &str, value: i32, commit: bool) -> bool {
        self.put(key, PrefValue::Int(value), commit)
    }

    /// Write an i64
    pub fn put_long(&self, key: &str, value: i64, commit: bool) -> bool {
        self.put(key, PrefValue::Long(value), commit)
    }

    /// Write an f32
    pub fn put_float(&self, key: &str, value: f32, commit: bool) -> bool {
        self.put(key, PrefValue::Float(value), commit)
    }

    /// Write a string
    pub fn put_string(&self, key: &str, value: &str, commit: bool) -> bool {
        self.put(key, PrefValue::String(value.to_string()), commit)
    }

    /// Write a string set
    pub fn put_string_set(&self, key: &str, value: BTreeSet<String>, commit: bool) -> bool {
        self.put(key, PrefValue::StringSet(value), commit)
    }

    /// Remove `key`, synchronously when `commit` is set
    pub fn remove(&self, key: &str, commit: bool) -> bool {
        let Some(prefs) = self.usable(key, "remove") else {
            return false;
        };
        let mut editor = prefs.edit();
        editor.remove(key);
        finish(&mut editor, commit)
    }

    // === Listeners ===

    /// Call `listener` with every changed key
    ///
    /// Listeners may be registered before initialization; they start firing
    /// once a handle is bound.
    pub fn register_change_listener(&self, listener: Listener<str>) -> ListenerHandle {
        self.listeners.register(listener)
    }

    /// Remove a change listener
    pub fn unregister_change_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.unregister(handle)
    }

    /// Bus address for `key`, if initialized
    pub fn address_for(&self, key: &str) -> Option<Address> {
        self.usable(key, "address_for")
            .map(|prefs| prefs.address_for(key))
    }
}

fn finish(editor: &mut crate::editor::Editor<'_>, commit: bool) -> bool {
    if commit {
        editor.commit()
    } else {
        editor.apply();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefsConfig;
    use sharedprefs_storage::{LocalChangeBus, MemoryStore};
    use std::time::Duration;

    fn prefs() -> Arc<Preferences> {
        let config = PrefsConfig {
            authority: "test".to_string(),
            origin: Some("me".to_string()),
            ..PrefsConfig::default()
        };
        let prefs = Preferences::open(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalChangeBus::new()),
        )
        .unwrap();
        assert!(prefs.wait_until_loaded(Some(Duration::from_secs(5))));
        Arc::new(prefs)
    }

    #[test]
    fn test_uninitialized_reads_default_and_drops_writes() {
        let globals = Globals::new();
        assert!(!globals.is_initialized());
        assert!(globals.get_bool("a", true).unwrap());
        assert_eq!(globals.get_int("a", -1).unwrap(), -1);
        assert_eq!(globals.get_string("a", "d").unwrap(), "d");
        assert!(!globals.put_int("a", 1, true));
        assert!(!globals.remove("a", false));
        assert!(globals.address_for("a").is_none());
        assert!(globals.preferences().is_none());
    }

    #[test]
    fn test_initialized_round_trip() {
        let globals = Globals::new();
        globals.initialize(prefs());

        assert!(globals.put_string("name", "x", true));
        assert_eq!(globals.get_string("name", "").unwrap(), "x");
        assert!(globals.put_long("big", 1 << 40, false));
        assert_eq!(globals.get_long("big", 0).unwrap(), 1 << 40);
        assert!(globals.remove("name", true));
        assert_eq!(globals.get_string("name", "gone").unwrap(), "gone");
        assert_eq!(
            globals.address_for("name"),
            Some(Address::key("test", "name"))
        );
    }

    #[test]
    fn test_empty_key_is_dropped() {
        let globals = Globals::new();
        globals.initialize(prefs());
        assert!(!globals.put_bool("", true, true));
        assert!(matches!(globals.get_bool("", false), Ok(false)));
    }

    #[test]
    fn test_type_mismatch_surfaces() {
        let globals = Globals::new();
        globals.initialize(prefs());
        assert!(globals.put_int("n", 5, false));
        assert!(matches!(
            globals.get_float("n", 0.0),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_listeners_survive_reinitialize() {
        let globals = Globals::new();
        let keys = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&keys);
        globals.register_change_listener(Arc::new(move |key: &str| {
            k.lock().push(key.to_string())
        }));

        let first = prefs();
        globals.initialize(Arc::clone(&first));
        assert!(globals.put_bool("a", true, true));

        globals.initialize(prefs());
        assert!(globals.put_bool("b", true, true));
        // The first handle no longer forwards
        assert!(first.edit().put_bool("c", true).commit());

        assert_eq!(*keys.lock(), vec!["a", "b"]);
    }
}
