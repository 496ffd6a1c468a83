//! Reference collaborators for SharedPrefs
//!
//! This crate implements the two external collaborators the engine needs:
//! - MemoryStore: one table of rows with a unique key, autoincrement ids and
//!   transactions serialized by a contention-aware write lock
//! - LocalChangeBus: address-keyed publish/subscribe with descendant matching
//!
//! Clones of either share state, so several engine instances opened on
//! clones act like separate processes sharing one database and one
//! notification channel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod lock;
pub mod memory;

pub use bus::LocalChangeBus;
pub use lock::WriteLock;
pub use memory::{MemoryStore, MemoryTxn, StoreStats};
