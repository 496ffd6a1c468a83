//! Storage transaction coordinator
//!
//! Translates edit operations into transactions against a [`RowStore`]:
//! - every unit of work (one single-row call, or one whole batch/bulk call)
//!   runs in one [`Transaction`]; helpers inside it take `&mut Transaction`
//!   and reuse it
//! - each insert/update/delete marks the affected row dirty
//! - when the unit ends, the transaction is finished first and the dirty rows
//!   are then published on the [`ChangeBus`], even after a rollback, so every
//!   cache re-reads the rows and converges on what the store holds
//! - batches yield the write lock at the operations flagged `yield_allowed`
//!   and refuse more than `max_operations_per_yield` operations in between
//! - insert-or-update looks the key up inside the transaction and updates the
//!   existing row by id, so a key never gets two rows
//! - deletes only touch rows stamped with this coordinator's origin; every
//!   matched row is marked dirty whether or not it was deleted
//!
//! The coordinator also keeps transaction metrics.
//!
//! # Memory Ordering
//!
//! The metric counters use Relaxed ordering: they are observational only and
//! do not synchronize other memory.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use sharedprefs_concurrency::{
    BatchLimits, BatchOperation, BatchOutcome, EditOp, OpResult, Transaction,
};
use sharedprefs_core::codec::encode_value;
use sharedprefs_core::{
    Address, ChangeBus, Error, Origin, PrefValue, Result, Row, RowId, RowStore, Selection,
};

/// Coordinates store transactions for one store instance
pub struct StorageCoordinator {
    store: Arc<dyn RowStore>,
    bus: Arc<dyn ChangeBus>,
    authority: String,
    origin: Origin,
    limits: BatchLimits,
    lock_timeout: Option<Duration>,
    next_txn_id: AtomicU64,
    /// Active transaction count (for metrics) - uses Relaxed ordering
    active_count: AtomicU64,
    /// Total transactions started - uses Relaxed ordering
    total_started: AtomicU64,
    /// Total transactions committed - uses Relaxed ordering
    total_committed: AtomicU64,
    /// Total transactions rolled back - uses Relaxed ordering
    total_aborted: AtomicU64,
    /// Yield points that released the lock - uses Relaxed ordering
    total_yields: AtomicU64,
}

impl std::fmt::Debug for StorageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCoordinator")
            .field("authority", &self.authority)
            .field("origin", &self.origin)
            .field("limits", &self.limits)
            .field("lock_timeout", &self.lock_timeout)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl StorageCoordinator {
    /// Create a coordinator over `store`, publishing changes on `bus`
    pub fn new(
        store: Arc<dyn RowStore>,
        bus: Arc<dyn ChangeBus>,
        authority: impl Into<String>,
        origin: Origin,
        limits: BatchLimits,
        lock_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            bus,
            authority: authority.into(),
            origin,
            limits,
            lock_timeout,
            next_txn_id: AtomicU64::new(1),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            total_yields: AtomicU64::new(0),
        }
    }

    /// Origin stamped on inserts and required for deletes
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Authority of published addresses
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Address of row `id`
    pub fn row_address(&self, id: RowId) -> Address {
        Address::row(self.authority.clone(), id)
    }

    // === Reads (outside any transaction) ===

    /// Every committed row
    pub fn query_all(&self) -> Result<Vec<Row>> {
        self.store.query_all()
    }

    /// Committed row `id`
    pub fn query_id(&self, id: RowId) -> Result<Option<Row>> {
        self.store.query_id(id)
    }

    /// Committed row for `key`
    pub fn query_key(&self, key: &str) -> Result<Option<Row>> {
        self.store.query_key(key)
    }

    // === Single-row units of work ===

    /// Insert a new row for `key`
    ///
    /// # Errors
    /// `Persistence` if the key already exists.
    pub fn insert(&self, key: &str, value: &PrefValue) -> Result<RowId> {
        self.run_unit(|c, txn| c.insert_in(txn, key, value))
    }

    /// Rewrite row `id`; the id never changes
    pub fn update(&self, id: RowId, key: &str, value: &PrefValue) -> Result<usize> {
        self.run_unit(|c, txn| c.update_in(txn, id, key, value))
    }

    /// Insert `key` or update its existing row
    pub fn insert_or_update(&self, key: &str, value: &PrefValue) -> Result<OpResult> {
        self.run_unit(|c, txn| c.upsert_in(txn, key, value))
    }

    /// Delete the rows matched by `selection` that this origin owns
    ///
    /// Rows owned by another origin are left alone; the count is then zero.
    pub fn delete(&self, selection: &Selection) -> Result<usize> {
        self.run_unit(|c, txn| c.delete_in(txn, selection))
    }

    // === Batch units of work ===

    /// Insert many rows in one batch transaction
    ///
    /// Yields every `bulk_inserts_per_yield` inserts; a limit of zero never
    /// yields. Returns the number of rows inserted.
    pub fn bulk_insert(&self, entries: &[(String, PrefValue)]) -> Result<usize> {
        self.run_batch(|c, txn| c.bulk_insert_in(txn, entries))
    }

    /// Apply a list of operations atomically, yielding where allowed
    ///
    /// # Errors
    /// - `MalformedBatch` if more than `max_operations_per_yield` operations
    ///   run between two yield points
    /// - `YieldFailed` if a yield point failed; work committed at earlier
    ///   yield points stays committed
    /// - any error of an individual operation, which rolls the batch back
    pub fn apply_batch(&self, operations: &[BatchOperation]) -> Result<BatchOutcome> {
        self.run_batch(|c, txn| c.apply_batch_in(txn, operations))
    }

    // === Helpers working inside a transaction ===

    fn insert_in(&self, txn: &mut Transaction, key: &str, value: &PrefValue) -> Result<RowId> {
        let values = encode_value(key, value)?;
        let id = txn.store()?.insert(values, &self.origin)?;
        txn.mark_dirty(id);
        txn.mark_successful(false);
        Ok(id)
    }

    fn update_in(
        &self,
        txn: &mut Transaction,
        id: RowId,
        key: &str,
        value: &PrefValue,
    ) -> Result<usize> {
        let values = encode_value(key, value)?;
        let count = txn.store()?.update(id, values)?;
        if count > 0 {
            txn.mark_dirty(id);
        }
        txn.mark_successful(false);
        Ok(count)
    }

    fn upsert_in(&self, txn: &mut Transaction, key: &str, value: &PrefValue) -> Result<OpResult> {
        let existing = txn.store()?.query(&Selection::Key(key.to_string()))?;
        match existing.as_slice() {
            [] => self.insert_in(txn, key, value).map(OpResult::Inserted),
            [row] => {
                let id = row.id;
                self.update_in(txn, id, key, value)?;
                Ok(OpResult::Updated(id))
            }
            rows => Err(Error::persistence(format!(
                "{} rows share key '{}'",
                rows.len(),
                key
            ))),
        }
    }

    fn delete_in(&self, txn: &mut Transaction, selection: &Selection) -> Result<usize> {
        let ids: Vec<RowId> = txn
            .store()?
            .query(selection)?
            .into_iter()
            .map(|row| row.id)
            .collect();

        // Rows kept because another origin owns them are still dirty, so
        // caches that already dropped them re-read the surviving row
        let mut count = 0;
        for id in ids {
            count += txn.store()?.delete(id, &self.origin)?;
            txn.mark_dirty(id);
        }
        txn.mark_successful(false);
        Ok(count)
    }

    fn bulk_insert_in(
        &self,
        txn: &mut Transaction,
        entries: &[(String, PrefValue)],
    ) -> Result<usize> {
        for (i, (key, value)) in entries.iter().enumerate() {
            self.insert_in(txn, key, value)?;
            if (i + 1).checked_rem(self.limits.bulk_inserts_per_yield) == Some(0) {
                self.yield_in(txn)?;
            }
        }
        Ok(entries.len())
    }

    fn apply_batch_in(
        &self,
        txn: &mut Transaction,
        operations: &[BatchOperation],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(operations.len()),
            yields: 0,
        };
        let mut since_yield = 0usize;

        for (i, operation) in operations.iter().enumerate() {
            if i > 0 && operation.yield_allowed {
                since_yield = 0;
                if self.yield_in(txn)? {
                    outcome.yields += 1;
                }
            }
            since_yield += 1;
            if since_yield > self.limits.max_operations_per_yield {
                return Err(Error::MalformedBatch {
                    operations: since_yield,
                });
            }
            outcome.results.push(self.apply_op_in(txn, &operation.op)?);
        }
        Ok(outcome)
    }

    fn apply_op_in(&self, txn: &mut Transaction, op: &EditOp) -> Result<OpResult> {
        trace!(target: "sharedprefs::txn", txn_id = txn.id(), op = op.name(), key = ?op.key(), "apply");
        match op {
            EditOp::InsertOrUpdate { key, value } => match self.upsert_in(txn, key, value) {
                Err(e @ Error::Encode { .. }) => {
                    warn!(target: "sharedprefs::txn", key = %key, error = %e, "Dropping write that cannot be encoded");
                    Ok(OpResult::Skipped)
                }
                other => other,
            },
            EditOp::Remove { key } => self
                .delete_in(txn, &Selection::Key(key.clone()))
                .map(OpResult::Deleted),
            EditOp::Clear => self.delete_in(txn, &Selection::All).map(OpResult::Deleted),
        }
    }

    fn yield_in(&self, txn: &mut Transaction) -> Result<bool> {
        let yielded = txn.yield_if_contended(self.limits.yield_sleep)?;
        if yielded {
            self.total_yields.fetch_add(1, Ordering::Relaxed);
        }
        Ok(yielded)
    }

    // === Unit-of-work lifecycle ===

    fn begin(&self, batch: bool) -> Result<Transaction> {
        let store_txn = self.store.begin(&self.authority, self.lock_timeout)?;
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        self.record_start();
        debug!(target: "sharedprefs::txn", txn_id = id, batch, "Transaction started");
        Ok(Transaction::new(id, self.authority.clone(), batch, store_txn))
    }

    fn run_unit<T>(&self, work: impl FnOnce(&Self, &mut Transaction) -> Result<T>) -> Result<T> {
        let mut txn = self.begin(false)?;
        let result = work(self, &mut txn);
        let ended = self.end_unit(&mut txn, false);
        let value = result?;
        ended?;
        Ok(value)
    }

    fn run_batch<T>(&self, work: impl FnOnce(&Self, &mut Transaction) -> Result<T>) -> Result<T> {
        let mut txn = self.begin(true)?;
        let result = work(self, &mut txn);
        if result.is_ok() {
            txn.mark_successful(true);
        }
        let ended = self.end_unit(&mut txn, true);
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Finish the transaction if `caller_is_batch` owns it, then publish the
    /// dirty rows
    fn end_unit(&self, txn: &mut Transaction, caller_is_batch: bool) -> Result<()> {
        let outcome = match txn.finish(caller_is_batch)? {
            Some(outcome) => outcome,
            None => return Ok(()),
        };

        if outcome.committed {
            self.record_commit();
            info!(target: "sharedprefs::txn", txn_id = txn.id(), dirty = outcome.dirty.len(), elapsed = ?txn.elapsed(), "Transaction committed");
        } else {
            self.record_abort();
            warn!(
                target: "sharedprefs::txn",
                txn_id = txn.id(),
                dirty = outcome.dirty.len(),
                end_skipped = outcome.end_skipped,
                "Transaction rolled back"
            );
        }

        self.notify(&outcome.dirty);

        match outcome.end_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn notify(&self, dirty: &BTreeSet<RowId>) {
        for id in dirty {
            self.bus.publish(&self.row_address(*id));
        }
    }

    // === Metrics ===

    fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    fn record_commit(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_abort(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get transaction metrics
    ///
    /// Returns current snapshot of transaction statistics.
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            total_yields: self.total_yields.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Transaction metrics
///
/// Provides statistics about transaction lifecycle.
#[derive(Debug, Clone)]
pub struct TransactionMetrics {
    /// Number of currently active transactions
    pub active_count: u64,
    /// Total number of transactions started
    pub total_started: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of transactions rolled back
    pub total_aborted: u64,
    /// Yield points that released the lock
    pub total_yields: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_aborted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
