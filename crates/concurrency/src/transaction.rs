//! Transaction context for the storage coordinator
//!
//! A [`Transaction`] wraps one open [`StoreTxn`] and tracks:
//! - whether it was opened for a batch request
//! - the dirty set: ids of rows changed inside it
//! - whether a yield point failed mid-batch
//!
//! The coordinator passes `&mut Transaction` down to every helper that works
//! inside the unit of work, so nested single-row calls reuse the enclosing
//! transaction. Only the caller that opened a batch transaction may mark it
//! successful or finish it; nested non-batch callers are ignored.
//!
//! # State Transitions
//!
//! `Active` → `Finished { committed }`, or `Active` → `YieldFailed` →
//! `Finished { committed: false }`.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use sharedprefs_core::{Error, Result, RowId, StoreTxn};

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Open, operations may run
    Active,
    /// A yield point failed; only finishing is allowed
    YieldFailed,
    /// Ended; `committed` is false for a rollback
    Finished {
        /// Whether the store committed
        committed: bool,
    },
}

/// What [`Transaction::finish`] did
#[derive(Debug, Clone, PartialEq)]
pub struct FinishOutcome {
    /// Whether the work was committed
    pub committed: bool,
    /// Rows changed inside the transaction
    pub dirty: BTreeSet<RowId>,
    /// True if the store end was skipped because the lock was already gone
    pub end_skipped: bool,
    /// Failure reported by the store while ending, if any
    pub end_error: Option<Error>,
}

/// One backing-store transaction and its bookkeeping
pub struct Transaction {
    id: u64,
    tag: String,
    batch: bool,
    store_txn: Option<Box<dyn StoreTxn>>,
    dirty: BTreeSet<RowId>,
    successful: bool,
    status: TransactionStatus,
    start_time: Instant,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("batch", &self.batch)
            .field("dirty", &self.dirty)
            .field("successful", &self.successful)
            .field("status", &self.status)
            .finish()
    }
}

impl Transaction {
    /// Wrap a freshly opened store transaction
    pub fn new(id: u64, tag: impl Into<String>, batch: bool, store_txn: Box<dyn StoreTxn>) -> Self {
        Self {
            id,
            tag: tag.into(),
            batch,
            store_txn: Some(store_txn),
            dirty: BTreeSet::new(),
            successful: false,
            status: TransactionStatus::Active,
            start_time: Instant::now(),
        }
    }

    /// Coordinator-assigned id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Store tag this transaction was opened against
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// True if opened for a batch request
    pub fn is_batch(&self) -> bool {
        self.batch
    }

    /// Current state
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// True while operations may run
    pub fn is_active(&self) -> bool {
        matches!(self.status, TransactionStatus::Active)
    }

    /// True after a yield point failed
    pub fn yield_failed(&self) -> bool {
        matches!(self.status, TransactionStatus::YieldFailed)
    }

    /// True once marked successful
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Time since the transaction was opened
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check that operations may run
    ///
    /// # Errors
    /// `YieldFailed` after a failed yield, `InvalidInput` once finished.
    pub fn ensure_active(&self) -> Result<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::YieldFailed => Err(Error::YieldFailed(format!(
                "transaction {} lost its lock at a yield point",
                self.id
            ))),
            TransactionStatus::Finished { .. } => Err(Error::invalid_input(format!(
                "transaction {} is already finished",
                self.id
            ))),
        }
    }

    /// The open store transaction
    pub fn store(&mut self) -> Result<&mut (dyn StoreTxn + 'static)> {
        self.ensure_active()?;
        let id = self.id;
        self.store_txn
            .as_deref_mut()
            .ok_or_else(|| Error::invalid_input(format!("transaction {} has no store", id)))
    }

    /// Record a changed row
    pub fn mark_dirty(&mut self, id: RowId) {
        self.dirty.insert(id);
    }

    /// Rows changed so far
    pub fn dirty(&self) -> &BTreeSet<RowId> {
        &self.dirty
    }

    /// True if any row changed
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Record that the transaction could not get its lock back after yielding
    pub fn mark_yield_failed(&mut self) {
        if self.is_active() {
            self.status = TransactionStatus::YieldFailed;
        }
    }

    /// True if `caller_is_batch` is allowed to mark or finish this transaction
    pub fn owned_by(&self, caller_is_batch: bool) -> bool {
        !self.batch || caller_is_batch
    }

    /// Mark the work done so far to be committed
    ///
    /// Ignored for a batch transaction unless the caller is the batch.
    pub fn mark_successful(&mut self, caller_is_batch: bool) {
        if !self.owned_by(caller_is_batch) || !self.is_active() {
            return;
        }
        if let Some(txn) = self.store_txn.as_deref_mut() {
            txn.set_successful();
            self.successful = true;
        }
    }

    /// Yield the store lock if another writer is waiting
    ///
    /// A failure marks the transaction so it is not finished normally.
    pub fn yield_if_contended(&mut self, sleep: Duration) -> Result<bool> {
        let result = self.store()?.yield_if_contended(sleep);
        match result {
            Ok(yielded) => {
                if yielded {
                    debug!(target: "sharedprefs::txn", txn_id = self.id, ?sleep, "yielded");
                }
                Ok(yielded)
            }
            Err(e) => {
                warn!(target: "sharedprefs::txn", txn_id = self.id, error = %e, "yield failed");
                self.mark_yield_failed();
                Err(e)
            }
        }
    }

    /// Commit or roll back, releasing the store lock
    ///
    /// Returns `None` when the caller does not own this batch transaction.
    /// If a yield failed and the lock is no longer held, the store end is
    /// skipped; the store transaction is still dropped, which releases
    /// anything it holds. The dirty set is handed back and cleared even when
    /// the store fails to end, so callers can still resynchronize.
    ///
    /// # Errors
    /// `InvalidInput` if the transaction was already finished.
    pub fn finish(&mut self, caller_is_batch: bool) -> Result<Option<FinishOutcome>> {
        if !self.owned_by(caller_is_batch) {
            return Ok(None);
        }
        if let TransactionStatus::Finished { .. } = self.status {
            return Err(Error::invalid_input(format!(
                "transaction {} is already finished",
                self.id
            )));
        }

        let yield_failed = self.yield_failed();
        let dirty = std::mem::take(&mut self.dirty);
        let mut store_txn = self.store_txn.take();

        let end_skipped = yield_failed
            && store_txn
                .as_deref()
                .map_or(true, |txn| !txn.lock_held());

        let ended = match store_txn.as_deref_mut() {
            Some(txn) if !end_skipped => txn.end(),
            _ => Ok(()),
        };
        drop(store_txn);

        let end_error = ended.err();
        let committed = self.successful && !yield_failed && end_error.is_none();
        self.status = TransactionStatus::Finished { committed };

        Ok(Some(FinishOutcome {
            committed,
            dirty,
            end_skipped,
            end_error,
        }))
    }
}
