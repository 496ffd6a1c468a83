//! Transaction layer for SharedPrefs
//!
//! This crate implements the pieces the storage coordinator builds on:
//! - Transaction: one store transaction with dirty-set tracking, batch
//!   ownership and failed-yield handling
//! - EditOp: the insert-or-update / remove / clear edit operations
//! - BatchOperation, BatchLimits: the batch/bulk yield protocol inputs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ops;
pub mod transaction;

pub use ops::{BatchLimits, BatchOperation, BatchOutcome, EditOp, OpResult};
pub use transaction::{FinishOutcome, Transaction, TransactionStatus};
