//! Memory cache over the store
//!
//! The cache keeps two layers behind one mutex:
//! - `by_row`: the last persisted snapshot, keyed by row id (with a key index)
//! - `pending`: writes this process accepted but the store has not confirmed
//!   yet; a pending entry shadows the persisted row for the same key
//!
//! Reads that miss `pending` block until the warm load has finished. Writes
//! record the pending entry first and then wait for the load, so the stale
//! persisted row can be evicted; a load finishing after the write can then
//! not resurrect a superseded value.
//!
//! Store-confirmed changes arrive through [`MemoryCache::apply_persisted`].
//! They never wait for the load: a change seen while the load is still running
//! marks its row as touched, and the load result for a touched row is
//! discarded as older.

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use sharedprefs_concurrency::EditOp;
use sharedprefs_core::codec;
use sharedprefs_core::{Entry, Error, Origin, PrefValue, Result, Row, RowId};

use crate::listeners::{Listener, ListenerHandle, ListenerRegistry};

/// A persisted row as the cache holds it
///
/// A row that failed to decode keeps its error, which is returned to every
/// read of that key.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRow {
    /// Row key
    pub key: String,
    /// Decoded value or the decode failure
    pub value: Result<PrefValue>,
    /// Origin recorded on the row
    pub origin: Option<Origin>,
}

impl CachedRow {
    /// Decode a store row
    pub fn decode(row: &Row) -> Self {
        match codec::decode(row) {
            Ok(entry) => Self {
                key: entry.key,
                value: Ok(entry.value),
                origin: entry.origin,
            },
            Err(e) => Self {
                key: row.key.clone(),
                value: Err(e.into()),
                origin: row.origin.clone(),
            },
        }
    }
}

/// Change applied to the cache after the store confirmed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Row `id` now holds `key`
    InsertedOrUpdated {
        /// Row id
        id: RowId,
        /// Row key
        key: String,
    },
    /// Row `id` is gone; `key` is known if the cache held the row
    Removed {
        /// Row id
        id: RowId,
        /// Key of the removed row, if cached
        key: Option<String>,
    },
}

impl CacheEvent {
    /// Key affected by the change, when known
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::InsertedOrUpdated { key, .. } => Some(key),
            CacheEvent::Removed { key, .. } => key.as_deref(),
        }
    }

    /// Row affected by the change
    pub fn id(&self) -> RowId {
        match self {
            CacheEvent::InsertedOrUpdated { id, .. } | CacheEvent::Removed { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Pending {
    Put(PrefValue),
    Removed,
}

#[derive(Default)]
struct CacheState {
    by_row: FxHashMap<RowId, CachedRow>,
    by_key: FxHashMap<String, RowId>,
    pending: FxHashMap<String, Pending>,
    evicted: FxHashMap<RowId, String>,
    loaded: bool,
    touched: FxHashSet<RowId>,
    load_error: Option<Error>,
    closed: bool,
}

impl CacheState {
    fn insert_row(&mut self, id: RowId, row: CachedRow) {
        self.evicted.remove(&id);
        if let Some(old) = self.by_row.get(&id) {
            if old.key != row.key && self.by_key.get(&old.key) == Some(&id) {
                self.by_key.remove(&old.key);
            }
        }
        if let Some(stale) = self.by_key.insert(row.key.clone(), id) {
            if stale != id {
                self.by_row.remove(&stale);
            }
        }
        self.by_row.insert(id, row);
    }

    /// Drop row `id`, returning its key if the row was held or evicted
    fn remove_row(&mut self, id: RowId) -> Option<String> {
        let evicted = self.evicted.remove(&id);
        let Some(row) = self.by_row.remove(&id) else {
            return evicted;
        };
        if self.by_key.get(&row.key) == Some(&id) {
            self.by_key.remove(&row.key);
        }
        Some(row.key)
    }

    /// Drop the persisted row of `key`, remembering its id until the store
    /// confirms what happened to it
    fn evict_key(&mut self, key: &str) {
        if let Some(id) = self.by_key.remove(key) {
            self.by_row.remove(&id);
            self.evicted.insert(id, key.to_string());
        }
    }

    fn evict_all(&mut self) {
        for (id, row) in self.by_row.drain() {
            self.evicted.insert(id, row.key);
        }
        self.by_key.clear();
    }

    fn clear(&mut self) {
        self.evict_all();
        self.pending.clear();
    }

    fn ready(&self) -> bool {
        self.loaded || self.closed
    }
}

/// In-memory view of the store with a pending-write overlay
pub struct MemoryCache {
    state: Mutex<CacheState>,
    loaded: Condvar,
    listeners: ListenerRegistry<CacheEvent>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryCache")
            .field("rows", &state.by_row.len())
            .field("pending", &state.pending.len())
            .field("loaded", &state.loaded)
            .finish()
    }
}

impl MemoryCache {
    /// Create an empty, not yet loaded cache
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            loaded: Condvar::new(),
            listeners: ListenerRegistry::new(),
        }
    }

    fn wait_loaded(&self, state: &mut MutexGuard<'_, CacheState>) {
        while !state.ready() {
            self.loaded.wait(state);
        }
    }

    // === Reads ===

    /// True if `key` has a value, pending writes included
    pub fn contains(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.pending.get(key) {
            Some(Pending::Put(_)) => return true,
            Some(Pending::Removed) => return false,
            None => {}
        }
        self.wait_loaded(&mut state);
        state.by_key.contains_key(key)
    }

    /// Current entry for `key`
    ///
    /// A pending write is returned as an entry with an unassigned id.
    ///
    /// # Errors
    /// `CorruptValue` if the persisted row for `key` could not be decoded.
    pub fn get(&self, key: &str) -> Result<Option<Entry>> {
        let mut state = self.state.lock();
        match state.pending.get(key) {
            Some(Pending::Put(value)) => return Ok(Some(Entry::pending(key, value.clone()))),
            Some(Pending::Removed) => return Ok(None),
            None => {}
        }
        self.wait_loaded(&mut state);

        let Some(id) = state.by_key.get(key).copied() else {
            return Ok(None);
        };
        match state.by_row.get(&id) {
            Some(row) => Ok(Some(Entry {
                id,
                key: row.key.clone(),
                value: row.value.clone()?,
                origin: row.origin.clone(),
            })),
            None => Ok(None),
        }
    }

    /// Every readable key and value
    ///
    /// Rows that failed to decode are skipped.
    pub fn get_all(&self) -> BTreeMap<String, PrefValue> {
        let mut state = self.state.lock();
        self.wait_loaded(&mut state);

        let mut all = BTreeMap::new();
        for row in state.by_row.values() {
            match &row.value {
                Ok(value) => {
                    all.insert(row.key.clone(), value.clone());
                }
                Err(e) => {
                    warn!(target: "sharedprefs::cache", key = %row.key, error = %e, "Skipping corrupt row")
                }
            }
        }
        for (key, pending) in &state.pending {
            match pending {
                Pending::Put(value) => {
                    all.insert(key.clone(), value.clone());
                }
                Pending::Removed => {
                    all.remove(key);
                }
            }
        }
        all
    }

    // === Local writes ===

    /// Record a write of `key` not yet confirmed by the store
    pub fn put(&self, key: &str, value: PrefValue) {
        let mut state = self.state.lock();
        state.pending.insert(key.to_string(), Pending::Put(value));
        self.wait_loaded(&mut state);
        state.evict_key(key);
    }

    /// Record a removal of `key` not yet confirmed by the store
    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        state.pending.insert(key.to_string(), Pending::Removed);
        self.wait_loaded(&mut state);
        state.evict_key(key);
    }

    /// Drop every entry, persisted and pending
    pub fn clear(&self) {
        let mut state = self.state.lock();
        self.wait_loaded(&mut state);
        state.clear();
    }

    /// Apply the edits of one commit under a single lock
    ///
    /// A `Clear` runs before every other edit. Edits with an empty key are
    /// skipped.
    pub fn stage(&self, ops: &[EditOp]) {
        let clear = ops.iter().any(|op| matches!(op, EditOp::Clear));
        let mut state = self.state.lock();

        if clear {
            state.pending.clear();
        }
        for op in ops {
            match op {
                EditOp::InsertOrUpdate { key, value } if !key.is_empty() => {
                    state
                        .pending
                        .insert(key.clone(), Pending::Put(value.clone()));
                }
                EditOp::Remove { key } if !key.is_empty() => {
                    state.pending.insert(key.clone(), Pending::Removed);
                }
                _ => {}
            }
        }

        self.wait_loaded(&mut state);
        if clear {
            state.evict_all();
        }
        for op in ops {
            if let Some(key) = op.key() {
                state.evict_key(key);
            }
        }
    }

    /// Drop the pending writes of a commit that will never be persisted
    ///
    /// Rows evicted when the commit was staged stay evicted until the store
    /// reports on them again.
    pub fn discard(&self, ops: &[EditOp]) {
        let mut state = self.state.lock();
        for key in ops.iter().filter_map(EditOp::key) {
            state.pending.remove(key);
        }
    }

    // === Store-confirmed changes ===

    /// Apply a change confirmed by the store
    ///
    /// `None` means the row no longer exists. The pending entry for the row's
    /// key is dropped, and cache listeners are notified after the lock is
    /// released.
    pub fn apply_persisted(&self, id: RowId, row: Option<CachedRow>) {
        let event = {
            let mut state = self.state.lock();
            if !state.loaded {
                state.touched.insert(id);
            }
            match row {
                Some(row) => {
                    let key = row.key.clone();
                    state.pending.remove(&key);
                    state.evicted.retain(|_, evicted| *evicted != key);
                    state.insert_row(id, row);
                    CacheEvent::InsertedOrUpdated { id, key }
                }
                None => {
                    let key = state.remove_row(id);
                    if let Some(key) = &key {
                        state.pending.remove(key);
                    }
                    CacheEvent::Removed { id, key }
                }
            }
        };
        debug!(target: "sharedprefs::cache", ?event, "Applied persisted change");
        self.listeners.dispatch(&event);
    }

    // === Warm load ===

    /// Install the warm-load result and wake every waiter
    ///
    /// Rows changed through [`apply_persisted`](Self::apply_persisted) while
    /// the load was running keep their newer state.
    pub fn complete_load(&self, rows: Vec<Row>) {
        let mut state = self.state.lock();
        let mut corrupt = 0usize;
        let mut skipped = 0usize;
        let total = rows.len();

        for row in rows {
            if state.touched.contains(&row.id) || state.by_row.contains_key(&row.id) {
                skipped += 1;
                continue;
            }
            let cached = CachedRow::decode(&row);
            if let Err(e) = &cached.value {
                warn!(target: "sharedprefs::cache", key = %cached.key, error = %e, "Loaded corrupt row");
                corrupt += 1;
            }
            if state.by_key.contains_key(&cached.key) {
                skipped += 1;
                continue;
            }
            state.insert_row(row.id, cached);
        }

        state.loaded = true;
        state.load_error = None;
        state.touched.clear();
        drop(state);
        self.loaded.notify_all();

        info!(target: "sharedprefs::cache", rows = total, corrupt, skipped, "Warm load complete");
    }

    /// Record a failed warm load; the cache stays unloaded
    pub fn fail_load(&self, err: Error) {
        self.state.lock().load_error = Some(err);
    }

    /// Error of the last failed load attempt, if the cache is still unloaded
    pub fn load_error(&self) -> Option<Error> {
        self.state.lock().load_error.clone()
    }

    /// True once the warm load has completed
    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    /// Block until the warm load completes
    ///
    /// Returns false if `timeout` elapsed first or the cache was closed
    /// without loading.
    pub fn wait_until_loaded(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !state.ready() {
            match deadline {
                Some(deadline) => {
                    if self.loaded.wait_until(&mut state, deadline).timed_out() {
                        return state.loaded;
                    }
                }
                None => self.loaded.wait(&mut state),
            }
        }
        state.loaded
    }

    // === Listeners and teardown ===

    /// Register a cache listener
    pub fn add_listener(&self, listener: Listener<CacheEvent>) -> ListenerHandle {
        self.listeners.register(listener)
    }

    /// Remove a cache listener
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.unregister(handle)
    }

    /// Drop all listeners and release anyone waiting for the load
    ///
    /// Reads after closing no longer block; they see whatever the cache holds.
    pub fn close(&self) {
        self.listeners.clear();
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.evicted.clear();
            state.touched.clear();
        }
        self.loaded.notify_all();
    }

    /// Number of persisted rows held
    pub fn len(&self) -> usize {
        self.state.lock().by_row.len()
    }

    /// True if no persisted row is held
    pub fn is_empty(&self) -> bool {
        self.state.lock().by_row.is_empty()
    }

    /// Number of writes waiting for store confirmation
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Start the warm load of `cache` on a background thread
///
/// `source` is called up to `1 + retries` times, sleeping `backoff` between
/// attempts. When every attempt fails the cache stays unloaded and the last
/// error is kept in [`MemoryCache::load_error`].
///
/// # Errors
/// `Persistence` if the loader thread cannot be spawned.
pub fn spawn_warm_load<F>(
    cache: Arc<MemoryCache>,
    source: F,
    retries: u32,
    backoff: Duration,
) -> Result<JoinHandle<()>>
where
    F: Fn() -> Result<Vec<Row>> + Send + 'static,
{
    std::thread::Builder::new()
        .name("sharedprefs-load".to_string())
        .spawn(move || run_warm_load(&cache, source, retries, backoff))
        .map_err(|e| Error::persistence(format!("failed to spawn warm load: {}", e)))
}

fn run_warm_load<F>(cache: &MemoryCache, source: F, retries: u32, backoff: Duration)
where
    F: Fn() -> Result<Vec<Row>>,
{
    let started = Instant::now();
    for attempt in 0..=retries {
        if cache.state.lock().closed {
            return;
        }
        if attempt > 0 {
            std::thread::sleep(backoff);
        }
        debug!(target: "sharedprefs::cache", attempt, "Warm load started");
        match source() {
            Ok(rows) => {
                cache.complete_load(rows);
                debug!(target: "sharedprefs::cache", elapsed = ?started.elapsed(), "Warm load finished");
                return;
            }
            Err(e) => {
                warn!(target: "sharedprefs::cache", attempt, error = %e, "Warm load attempt failed");
                cache.fail_load(e);
            }
        }
    }
    error!(target: "sharedprefs::cache", attempts = retries + 1, "Warm load failed; cache stays unloaded");
}
