//! SharedPrefs - typed key-value preferences shared across processes
//!
//! Every process opens one [`Preferences`] handle over the same backing store
//! and change bus. Reads are answered from an in-memory cache; writes are
//! visible to the writing process at once and persist through a single
//! serial worker.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sharedprefs::{LocalChangeBus, MemoryStore, Preferences, PrefsConfig};
//!
//! let store = Arc::new(MemoryStore::new());
//! let bus = Arc::new(LocalChangeBus::new());
//! let prefs = Preferences::open(PrefsConfig::default(), store, bus)?;
//!
//! prefs.edit().put_string("theme", "dark").put_int("volume", 7).apply();
//! assert_eq!(prefs.get_string("theme", "light")?, "dark");
//!
//! if !prefs.edit().remove("volume").commit() {
//!     // the store rejected the commit
//! }
//! ```
//!
//! # Architecture
//!
//! - `sharedprefs-core`: values, codec, errors, collaborator traits
//! - `sharedprefs-storage`: in-memory row store and change bus
//! - `sharedprefs-concurrency`: transactions and edit operations
//! - `sharedprefs-engine`: cache, commit pipeline, coordinator, handle

pub use sharedprefs_concurrency::{BatchLimits, BatchOperation, BatchOutcome, EditOp, OpResult};
pub use sharedprefs_core::{
    Address, AddressKind, ChangeBus, ChangeCallback, Entry, Error, Origin, PrefValue, Result,
    RowId, RowStore, Selection, StoreTxn, SubscriptionId, ValueType,
};
pub use sharedprefs_engine::*;
pub use sharedprefs_storage::{LocalChangeBus, MemoryStore, StoreStats};
