//! Edit operations and batch requests
//!
//! An Editor stages [`EditOp`]s; the coordinator turns a commit into a list of
//! [`BatchOperation`]s and applies them in one transaction.

use std::time::Duration;

use sharedprefs_core::{PrefValue, RowId};

/// One staged edit
#[derive(Debug, Clone, PartialEq)]
pub enum EditOp {
    /// Insert the key, or update its existing row by id
    InsertOrUpdate {
        /// Key to write
        key: String,
        /// New value; its tag becomes the key's stored type
        value: PrefValue,
    },
    /// Delete the key's row if this origin owns it
    Remove {
        /// Key to delete
        key: String,
    },
    /// Delete every row this origin owns
    Clear,
}

impl EditOp {
    /// Key touched by this operation, `None` for `Clear`
    pub fn key(&self) -> Option<&str> {
        match self {
            EditOp::InsertOrUpdate { key, .. } | EditOp::Remove { key } => Some(key),
            EditOp::Clear => None,
        }
    }

    /// Short operation name for logs
    pub fn name(&self) -> &'static str {
        match self {
            EditOp::InsertOrUpdate { .. } => "insert_or_update",
            EditOp::Remove { .. } => "remove",
            EditOp::Clear => "clear",
        }
    }
}

/// An operation inside a batch request
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOperation {
    /// What to do
    pub op: EditOp,
    /// Whether the transaction may yield right before this operation
    pub yield_allowed: bool,
}

impl BatchOperation {
    /// Operation without a yield point
    pub fn new(op: EditOp) -> Self {
        Self {
            op,
            yield_allowed: false,
        }
    }

    /// Operation preceded by a yield point
    pub fn with_yield(op: EditOp) -> Self {
        Self {
            op,
            yield_allowed: true,
        }
    }
}

/// Outcome of one operation of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// A new row was inserted
    Inserted(RowId),
    /// An existing row was updated in place
    Updated(RowId),
    /// Rows deleted by a remove or clear; zero when not owned
    Deleted(usize),
    /// The operation was dropped (value could not be encoded)
    Skipped,
}

/// Result of a batch request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// One result per operation, in request order
    pub results: Vec<OpResult>,
    /// Yield points that actually released the lock
    pub yields: usize,
}

/// Tunables of the batch/bulk protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Bulk-insert operations between automatic yield points
    pub bulk_inserts_per_yield: usize,
    /// Cap on operations between two yield points
    pub max_operations_per_yield: usize,
    /// Pause before re-acquiring the lock after a real yield
    pub yield_sleep: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            bulk_inserts_per_yield: 50,
            max_operations_per_yield: 500,
            yield_sleep: Duration::from_millis(4000),
        }
    }
}
