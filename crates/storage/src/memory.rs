//! MemoryStore: in-process reference backing store
//!
//! Implements [`RowStore`] over one table of `{id, key, type, value, origin}`
//! rows held in memory:
//! - `BTreeMap<id, Row>` plus an `FxHashMap<key, id>` unique-key index
//! - autoincrement ids, never reused
//! - one [`WriteLock`] serializing all writers
//!
//! A transaction works on a private copy of the table taken when it acquires
//! the lock. Commit publishes the copy, rollback discards it. A yield commits
//! the work so far, releases the lock, sleeps, re-acquires and takes a fresh
//! copy.
//!
//! Clones share the same table, so two engine instances opened on clones of
//! one `MemoryStore` behave like two processes sharing a database.
//!
//! Fault injection hooks (`fail_next_*`) let tests exercise failure paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use sharedprefs_core::{
    Error, Origin, Result, Row, RowId, RowStore, RowValues, Selection, StoreTxn,
};

use crate::lock::WriteLock;

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<RowId, Row>,
    by_key: FxHashMap<String, RowId>,
    next_id: i64,
}

impl Table {
    fn select(&self, selection: &Selection) -> Vec<Row> {
        match selection {
            Selection::All => self.rows.values().cloned().collect(),
            Selection::Key(key) => self
                .by_key
                .get(key)
                .and_then(|id| self.rows.get(id))
                .cloned()
                .into_iter()
                .collect(),
            Selection::Id(id) => self.rows.get(id).cloned().into_iter().collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_reads: AtomicUsize,
    fail_begin: AtomicBool,
    fail_insert: AtomicBool,
    fail_yield: AtomicBool,
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    yields: AtomicU64,
}

#[derive(Debug, Default)]
struct StoreInner {
    table: RwLock<Table>,
    lock: WriteLock,
    faults: Faults,
    counters: Counters,
}

impl StoreInner {
    fn check_read(&self) -> Result<()> {
        let failed = self
            .faults
            .fail_reads
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::persistence("store unreachable"));
        }
        Ok(())
    }
}

/// Snapshot of store counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    /// Committed rows
    pub rows: usize,
    /// Transactions committed
    pub commits: u64,
    /// Transactions rolled back
    pub rollbacks: u64,
    /// Yield points that released the lock
    pub yields: u64,
}

/// In-memory row store shared by clones
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows
    pub fn row_count(&self) -> usize {
        self.inner.table.read().rows.len()
    }

    /// Counters since creation
    pub fn stats(&self) -> StoreStats {
        let c = &self.inner.counters;
        StoreStats {
            rows: self.row_count(),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
            yields: c.yields.load(Ordering::Relaxed),
        }
    }

    /// True if a writer is waiting for the write lock
    pub fn is_contended(&self) -> bool {
        self.inner.lock.is_contended()
    }

    /// True while some transaction holds the write lock
    pub fn is_locked(&self) -> bool {
        self.inner.lock.is_held()
    }

    /// Interrupt every waiting and future `begin` with `Interrupted`
    pub fn shutdown(&self) {
        self.inner.lock.shutdown();
    }

    /// Fail the next `count` committed-row reads with `Persistence`
    pub fn fail_next_reads(&self, count: usize) {
        self.inner.faults.fail_reads.store(count, Ordering::Relaxed);
    }

    /// Fail the next `begin` with `Persistence`
    pub fn fail_next_begin(&self) {
        self.inner.faults.fail_begin.store(true, Ordering::Relaxed);
    }

    /// Fail the next insert with `Persistence`
    pub fn fail_next_insert(&self) {
        self.inner.faults.fail_insert.store(true, Ordering::Relaxed);
    }

    /// Make the next yield point that finds contention fail
    ///
    /// The failing yield commits the work so far and releases the lock but
    /// does not get it back, leaving the transaction without the lock.
    pub fn fail_next_yield(&self) {
        self.inner.faults.fail_yield.store(true, Ordering::Relaxed);
    }

    /// Write a raw row directly, bypassing the codec and the write lock
    ///
    /// Used to plant rows a well-behaved writer would never produce.
    pub fn insert_raw(&self, row: Row) -> RowId {
        let mut table = self.inner.table.write();
        let id = if row.id.is_assigned() {
            row.id
        } else {
            RowId::new(table.next_id + 1)
        };
        table.next_id = table.next_id.max(id.get());
        if let Some(old) = table.by_key.insert(row.key.clone(), id) {
            table.rows.remove(&old);
        }
        table.rows.insert(id, Row { id, ..row });
        id
    }
}

impl RowStore for MemoryStore {
    fn query_all(&self) -> Result<Vec<Row>> {
        self.inner.check_read()?;
        Ok(self.inner.table.read().select(&Selection::All))
    }

    fn query_id(&self, id: RowId) -> Result<Option<Row>> {
        self.inner.check_read()?;
        Ok(self.inner.table.read().rows.get(&id).cloned())
    }

    fn query_key(&self, key: &str) -> Result<Option<Row>> {
        self.inner.check_read()?;
        Ok(self
            .inner
            .table
            .read()
            .select(&Selection::Key(key.to_string()))
            .into_iter()
            .next())
    }

    fn begin(&self, tag: &str, wait: Option<Duration>) -> Result<Box<dyn StoreTxn>> {
        if self.inner.faults.fail_begin.swap(false, Ordering::Relaxed) {
            return Err(Error::persistence("cannot open database"));
        }
        self.inner.lock.acquire(wait)?;
        let working = self.inner.table.read().clone();
        trace!(target: "sharedprefs::store", tag, "write lock acquired");
        Ok(Box::new(MemoryTxn {
            inner: Arc::clone(&self.inner),
            tag: tag.to_string(),
            working,
            held: true,
            successful: false,
        }))
    }
}

/// Write transaction on a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryTxn {
    inner: Arc<StoreInner>,
    tag: String,
    working: Table,
    held: bool,
    successful: bool,
}

impl MemoryTxn {
    fn ensure_held(&self) -> Result<()> {
        if self.held {
            Ok(())
        } else {
            Err(Error::persistence(format!(
                "transaction on '{}' no longer holds the write lock",
                self.tag
            )))
        }
    }

    fn publish(&mut self) {
        *self.inner.table.write() = self.working.clone();
    }

    fn release(&mut self) {
        if self.held {
            self.held = false;
            self.inner.lock.release();
        }
    }
}

impl StoreTxn for MemoryTxn {
    fn query(&self, selection: &Selection) -> Result<Vec<Row>> {
        self.ensure_held()?;
        Ok(self.working.select(selection))
    }

    fn insert(&mut self, values: RowValues, origin: &Origin) -> Result<RowId> {
        self.ensure_held()?;
        if self.inner.faults.fail_insert.swap(false, Ordering::Relaxed) {
            return Err(Error::persistence("disk I/O error"));
        }
        if self.working.by_key.contains_key(&values.key) {
            return Err(Error::persistence(format!(
                "UNIQUE constraint failed: key '{}'",
                values.key
            )));
        }
        self.working.next_id += 1;
        let id = RowId::new(self.working.next_id);
        self.working.by_key.insert(values.key.clone(), id);
        self.working.rows.insert(
            id,
            Row {
                id,
                key: values.key,
                type_tag: Some(values.type_tag),
                value: values.value,
                origin: Some(origin.clone()),
            },
        );
        Ok(id)
    }

    fn update(&mut self, id: RowId, values: RowValues) -> Result<usize> {
        self.ensure_held()?;
        let old_key = match self.working.rows.get(&id) {
            Some(row) => row.key.clone(),
            None => return Ok(0),
        };
        if old_key != values.key {
            if self.working.by_key.contains_key(&values.key) {
                return Err(Error::persistence(format!(
                    "UNIQUE constraint failed: key '{}'",
                    values.key
                )));
            }
            self.working.by_key.remove(&old_key);
            self.working.by_key.insert(values.key.clone(), id);
        }
        if let Some(row) = self.working.rows.get_mut(&id) {
            row.key = values.key;
            row.type_tag = Some(values.type_tag);
            row.value = values.value;
        }
        Ok(1)
    }

    fn delete(&mut self, id: RowId, origin: &Origin) -> Result<usize> {
        self.ensure_held()?;
        let owned = self
            .working
            .rows
            .get(&id)
            .map_or(false, |row| row.origin.as_ref() == Some(origin));
        if !owned {
            return Ok(0);
        }
        if let Some(row) = self.working.rows.remove(&id) {
            self.working.by_key.remove(&row.key);
        }
        Ok(1)
    }

    fn yield_if_contended(&mut self, sleep: Duration) -> Result<bool> {
        self.ensure_held()?;
        if !self.inner.lock.is_contended() {
            return Ok(false);
        }

        self.publish();
        self.release();
        self.inner.counters.yields.fetch_add(1, Ordering::Relaxed);

        if self.inner.faults.fail_yield.swap(false, Ordering::Relaxed) {
            return Err(Error::YieldFailed(format!(
                "could not re-acquire '{}' after yielding",
                self.tag
            )));
        }

        debug!(target: "sharedprefs::store", tag = %self.tag, ?sleep, "yielded write lock");
        thread::sleep(sleep);
        self.inner.lock.acquire(None)?;
        self.held = true;
        self.working = self.inner.table.read().clone();
        Ok(true)
    }

    fn lock_held(&self) -> bool {
        self.held
    }

    fn set_successful(&mut self) {
        self.successful = true;
    }

    fn end(&mut self) -> Result<()> {
        self.ensure_held()?;
        if self.successful {
            self.publish();
            self.inner.counters.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        if self.held {
            self.inner.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            self.release();
        }
    }
}
