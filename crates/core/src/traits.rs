//! Collaborator traits
//!
//! The engine never talks to a concrete database or IPC mechanism. It needs:
//! - [`RowStore`]: one table of `{id, key, type, value, origin}` rows with a
//!   unique key, keyed queries and transactions
//! - [`StoreTxn`]: an open write transaction holding the store's write lock,
//!   with a "yield under contention" primitive
//! - [`ChangeBus`]: address-keyed change signals visible to every process
//!   sharing the store, the originator included
//!
//! Thread safety: stores and buses are shared across threads (`Send + Sync`).
//! A transaction is owned by exactly one thread at a time (`Send` only).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Row, RowValues};
use crate::error::Result;
use crate::types::{Address, Origin, RowId};

/// Which rows a query touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every row
    All,
    /// The row with this key, if any
    Key(String),
    /// The row with this id, if any
    Id(RowId),
}

/// Backing store of preference rows
pub trait RowStore: Send + Sync {
    /// Read every committed row
    fn query_all(&self) -> Result<Vec<Row>>;

    /// Read the committed row with `id`
    fn query_id(&self, id: RowId) -> Result<Option<Row>>;

    /// Read the committed row for `key`
    fn query_key(&self, key: &str) -> Result<Option<Row>>;

    /// Open a write transaction
    ///
    /// Blocks until the store's write lock is available, or at most `wait`
    /// when given. `tag` names the logical database the transaction is
    /// opened against.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if the wait was cut short (timeout or the store
    /// shutting down) and `Persistence` if the store cannot be reached.
    fn begin(&self, tag: &str, wait: Option<Duration>) -> Result<Box<dyn StoreTxn>>;
}

/// An open write transaction
///
/// Dropping a transaction without calling [`StoreTxn::end`] rolls it back
/// and releases the write lock.
pub trait StoreTxn: Send {
    /// Read rows as this transaction sees them
    fn query(&self, selection: &Selection) -> Result<Vec<Row>>;

    /// Insert a new row stamped with `origin`
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the key already exists.
    fn insert(&mut self, values: RowValues, origin: &Origin) -> Result<RowId>;

    /// Replace the key, type and value of row `id`; the id never changes
    ///
    /// Returns the number of rows affected.
    fn update(&mut self, id: RowId, values: RowValues) -> Result<usize>;

    /// Delete row `id` if it was inserted by `origin`
    ///
    /// Returns the number of rows affected, zero when the row belongs to a
    /// different origin.
    fn delete(&mut self, id: RowId, origin: &Origin) -> Result<usize>;

    /// Let waiting writers in if there are any
    ///
    /// Work done so far is committed, the lock is released, the caller
    /// sleeps for `sleep` and then re-acquires the lock. Returns whether a
    /// yield actually happened.
    fn yield_if_contended(&mut self, sleep: Duration) -> Result<bool>;

    /// True while this transaction holds the write lock
    fn lock_held(&self) -> bool;

    /// Mark the work done so far to be committed by [`StoreTxn::end`]
    fn set_successful(&mut self);

    /// Commit if marked successful, roll back otherwise; releases the lock
    fn end(&mut self) -> Result<()>;
}

/// Handle returned by [`ChangeBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Wrap a raw handle value
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw handle value
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked with the address that changed
pub type ChangeCallback = Arc<dyn Fn(&Address) + Send + Sync>;

/// Cross-process "something changed at this address" signal
pub trait ChangeBus: Send + Sync {
    /// Subscribe to `address`, and to everything below it if `descendants`
    fn subscribe(
        &self,
        address: Address,
        descendants: bool,
        callback: ChangeCallback,
    ) -> SubscriptionId;

    /// Remove a subscription; returns false if it was unknown
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Signal a change at `address` to every matching subscriber
    fn publish(&self, address: &Address);
}
