//! End-to-end tests of the preferences store
//!
//! Two `Preferences` handles over one `MemoryStore` and one `LocalChangeBus`
//! stand in for two processes sharing the same backing store.

use parking_lot::Mutex;
use sharedprefs::{
    Address, ChangeBus, Error, LocalChangeBus, MemoryStore, PrefValue, Preferences, PrefsConfig,
    RowStore,
};
use sharedprefs_core::RawValue;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const AUTHORITY: &str = "prefs";

fn config(origin: &str) -> PrefsConfig {
    PrefsConfig {
        authority: AUTHORITY.to_string(),
        origin: Some(origin.to_string()),
        yield_sleep_ms: 0,
        ..PrefsConfig::default()
    }
}

fn open(store: &MemoryStore, bus: &LocalChangeBus, origin: &str) -> Preferences {
    let prefs = Preferences::open(
        config(origin),
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
    )
    .unwrap();
    assert!(prefs.wait_until_loaded(Some(Duration::from_secs(5))));
    prefs
}

// ============================================================================
// Read-your-writes
// ============================================================================

/// Test: a value staged with apply() is readable before it is persisted
#[test]
fn test_apply_is_visible_immediately() {
    let store = MemoryStore::new();
    let prefs = open(&store, &LocalChangeBus::new(), "app");

    prefs
        .edit()
        .put_bool("flag", true)
        .put_int("int", -3)
        .put_long("long", i64::MAX)
        .put_float("float", 1.5)
        .put_string("string", "x")
        .put_string_set("set", ["b", "a"])
        .apply();

    assert!(prefs.get_bool("flag", false).unwrap());
    assert_eq!(prefs.get_int("int", 0).unwrap(), -3);
    assert_eq!(prefs.get_long("long", 0).unwrap(), i64::MAX);
    assert_eq!(prefs.get_float("float", 0.0).unwrap(), 1.5);
    assert_eq!(prefs.get_string("string", "").unwrap(), "x");
    let expected: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
    assert_eq!(prefs.get_string_set("set", BTreeSet::new()).unwrap(), expected);

    prefs.flush();
    assert_eq!(store.row_count(), 6);
}

/// Test: commit() returns true and the value reads back
#[test]
fn test_commit_scenario() {
    let prefs = open(&MemoryStore::new(), &LocalChangeBus::new(), "app");
    assert!(prefs.edit().put_string("a", "x").commit());
    assert_eq!(prefs.get_string("a", "").unwrap(), "x");
}

/// Test: a typed read of a differently typed key fails instead of coercing
#[test]
fn test_type_mismatch_scenario() {
    let prefs = open(&MemoryStore::new(), &LocalChangeBus::new(), "app");
    prefs.edit().put_int("n", 5).apply();
    assert!(matches!(
        prefs.get_string("n", "dflt"),
        Err(Error::TypeMismatch { .. })
    ));
    prefs.flush();
    assert!(matches!(
        prefs.get_string("n", "dflt"),
        Err(Error::TypeMismatch { .. })
    ));
}

// ============================================================================
// Cross-process convergence
// ============================================================================

/// Test: another instance sees an applied value once it is persisted
#[test]
fn test_other_instance_converges() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let a = open(&store, &bus, "a");
    let b = open(&store, &bus, "b");

    a.edit().put_string("theme", "dark").apply();
    a.flush();

    assert_eq!(b.get_string("theme", "light").unwrap(), "dark");

    // A freshly opened instance loads it too
    let c = open(&store, &bus, "c");
    assert_eq!(c.get_string("theme", "light").unwrap(), "dark");
}

/// Test: change listeners of every instance fire for a persisted change
#[test]
fn test_listeners_fire_in_every_instance() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let a = open(&store, &bus, "a");
    let b = open(&store, &bus, "b");

    let seen = Arc::new(Mutex::new(Vec::new()));
    for (name, prefs) in [("a", &a), ("b", &b)] {
        let s = Arc::clone(&seen);
        prefs.register_change_listener(Arc::new(move |key: &str| {
            s.lock().push(format!("{}:{}", name, key))
        }));
    }

    assert!(a.edit().put_int("volume", 3).commit());
    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["a:volume", "b:volume"]);
}

/// Test: key watchers get the key address of a change made elsewhere
#[test]
fn test_watch_key_across_instances() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let a = open(&store, &bus, "a");
    let b = open(&store, &bus, "b");

    let hits = Arc::new(Mutex::new(Vec::new()));
    let h = Arc::clone(&hits);
    b.watch_key(
        "volume",
        Arc::new(move |address: &Address| h.lock().push(address.to_string())),
    );

    assert!(a.edit().put_int("volume", 3).commit());
    let hits = hits.lock().clone();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|a| a == "prefs/keys/volume"));
}

// ============================================================================
// Ordering
// ============================================================================

/// Test: applied commits reach the store in submission order
#[test]
fn test_applies_persist_in_order() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let prefs = open(&store, &bus, "app");

    let observed = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&observed);
    let reader = store.clone();
    bus.subscribe(
        Address::table(AUTHORITY),
        true,
        Arc::new(move |_: &Address| {
            if let Ok(Some(row)) = reader.query_key("counter") {
                if let RawValue::Integer(n) = row.value {
                    o.lock().push(n);
                }
            }
        }),
    );

    for i in 0..50 {
        prefs.edit().put_int("counter", i).apply();
    }
    prefs.flush();

    let observed = observed.lock().clone();
    assert_eq!(observed, (0..50).collect::<Vec<i64>>());
    assert_eq!(prefs.get_int("counter", -1).unwrap(), 49);
}

/// Test: commit() waits for earlier applies, so its write lands last
#[test]
fn test_commit_after_applies_wins() {
    let store = MemoryStore::new();
    let prefs = open(&store, &LocalChangeBus::new(), "app");

    for i in 0..20 {
        prefs.edit().put_int("k", i).apply();
    }
    assert!(prefs.edit().put_int("k", 100).commit());

    let fresh = open(&store, &LocalChangeBus::new(), "other");
    assert_eq!(fresh.get_int("k", -1).unwrap(), 100);
}

// ============================================================================
// Clear and ownership
// ============================================================================

/// Test: clear runs first in its commit, so the put of the same commit survives
#[test]
fn test_clear_then_put_in_one_commit() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let prefs = open(&store, &bus, "app");
    assert!(prefs.edit().put_int("a", 1).put_int("b", 2).commit());

    assert!(prefs.edit().put_string("k", "v").clear().commit());

    assert!(!prefs.contains("a"));
    assert!(!prefs.contains("b"));
    assert_eq!(prefs.get_string("k", "").unwrap(), "v");
    assert_eq!(store.row_count(), 1);

    let other = open(&store, &bus, "other");
    let keys: Vec<_> = other.get_all().into_keys().collect();
    assert_eq!(keys, vec!["k"]);
}

/// Test: deleting another origin's key leaves the row and every cache intact
#[test]
fn test_remove_of_foreign_key_is_noop() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let owner = open(&store, &bus, "owner");
    let intruder = open(&store, &bus, "intruder");

    assert!(owner.edit().put_string("k", "v").commit());
    assert_eq!(store.row_count(), 1);

    assert!(intruder.edit().remove("k").commit());
    assert_eq!(store.row_count(), 1);
    assert_eq!(intruder.get_string("k", "").unwrap(), "v");
    assert_eq!(owner.get_string("k", "").unwrap(), "v");
}

/// Test: clear only removes the caller's own rows
#[test]
fn test_clear_keeps_foreign_rows() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let mine = open(&store, &bus, "mine");
    let theirs = open(&store, &bus, "theirs");

    assert!(mine.edit().put_int("own", 1).commit());
    assert!(theirs.edit().put_int("foreign", 2).commit());

    assert!(mine.edit().clear().commit());
    assert_eq!(store.row_count(), 1);
    assert!(!mine.contains("own"));
    assert_eq!(mine.get_int("foreign", 0).unwrap(), 2);
}

// ============================================================================
// Failures
// ============================================================================

/// Test: a failed commit reports false and keeps the cache write
#[test]
fn test_failed_commit_reports_false() {
    let store = MemoryStore::new();
    let prefs = open(&store, &LocalChangeBus::new(), "app");

    store.fail_next_begin();
    assert!(!prefs.edit().put_int("k", 1).commit());
    assert_eq!(prefs.get_int("k", 0).unwrap(), 1);
    assert_eq!(store.row_count(), 0);

    // The next commit is unaffected
    assert!(prefs.edit().put_int("k", 2).commit());
    assert_eq!(store.row_count(), 1);
}

/// Test: a failed apply is logged and does not block later commits
#[test]
fn test_failed_apply_is_swallowed() {
    let store = MemoryStore::new();
    let prefs = open(&store, &LocalChangeBus::new(), "app");

    store.fail_next_begin();
    prefs.edit().put_int("a", 1).apply();
    prefs.edit().put_int("b", 2).apply();
    prefs.flush();

    let stats = prefs.queue_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert!(store.query_key("a").unwrap().is_none());
    assert!(store.query_key("b").unwrap().is_some());
}

/// Test: a commit that cannot get the write lock in time is interrupted
#[test]
fn test_lock_timeout_interrupts_commit() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let prefs = Preferences::open(
        PrefsConfig {
            lock_timeout_ms: Some(20),
            ..config("app")
        },
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
    )
    .unwrap();
    assert!(prefs.wait_until_loaded(Some(Duration::from_secs(5))));

    let held = store.begin(AUTHORITY, None).unwrap();
    assert!(!prefs.edit().put_int("k", 1).commit());
    drop(held);

    assert_eq!(prefs.queue_stats().cancelled, 1);
    assert!(prefs.edit().put_int("k", 1).commit());
}

/// Test: a transient read failure during warm load is retried
#[test]
fn test_warm_load_retry() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    {
        let seed = open(&store, &bus, "seed");
        assert!(seed.edit().put_string("k", "v").commit());
    }

    store.fail_next_reads(1);
    let prefs = Preferences::open(
        PrefsConfig {
            load_retries: 2,
            load_retry_backoff_ms: 1,
            ..config("app")
        },
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
    )
    .unwrap();
    assert!(prefs.wait_until_loaded(Some(Duration::from_secs(5))));
    assert_eq!(prefs.get_string("k", "").unwrap(), "v");
}

// ============================================================================
// Concurrency
// ============================================================================

/// Test: concurrent editors on one key never duplicate its row
#[test]
fn test_concurrent_editors_same_key() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let prefs = Arc::new(open(&store, &bus, "app"));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|value| {
            let prefs = Arc::clone(&prefs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                prefs.edit().put_string("shared", value).apply();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    prefs.flush();

    assert_eq!(store.row_count(), 1);
    let persisted = store.query_key("shared").unwrap().unwrap();
    let RawValue::Text(persisted) = persisted.value else {
        panic!("expected text row");
    };
    assert!(persisted == "left" || persisted == "right");
    assert_eq!(prefs.get_string("shared", "").unwrap(), persisted);
}

/// Test: two instances hammering the same keys converge on the store
#[test]
fn test_instances_converge_under_contention() {
    let store = MemoryStore::new();
    let bus = LocalChangeBus::new();
    let a = Arc::new(open(&store, &bus, "a"));
    let b = Arc::new(open(&store, &bus, "b"));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [Arc::clone(&a), Arc::clone(&b)]
        .into_iter()
        .enumerate()
        .map(|(n, prefs)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..25 {
                    let value = (n as i64) * 1000 + i;
                    prefs
                        .edit()
                        .put_long("x", value)
                        .put_long("y", value)
                        .apply();
                }
                prefs.flush();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(store.row_count(), 2);
    for key in ["x", "y"] {
        let row = store.query_key(key).unwrap().unwrap();
        let RawValue::Integer(persisted) = row.value else {
            panic!("expected integer row");
        };
        assert_eq!(a.get_long(key, -1).unwrap(), persisted);
        assert_eq!(b.get_long(key, -1).unwrap(), persisted);
    }
    assert_eq!(
        a.get("x").unwrap(),
        Some(PrefValue::Long(a.get_long("y", -1).unwrap()))
    );
}
