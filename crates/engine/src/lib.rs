//! Preferences engine
//!
//! This crate binds the cache to the store:
//! - Preferences: the store handle with typed reads, editors and listeners
//! - MemoryCache: persisted snapshot plus pending-write overlay, warm-loaded
//!   in the background
//! - ChangeNotifier: re-reads changed rows and feeds them to the cache
//! - Editor/Commit and SerialQueue: the commit pipeline
//! - StorageCoordinator: transactions, dirty sets and batch yielding
//! - Globals: facade with not-initialized semantics
//!
//! The engine is the only component that knows about:
//! - Cache/store consistency
//! - Commit ordering
//! - Change fan-out

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod editor;
pub mod globals;
pub mod listeners;
pub mod notifier;
pub mod preferences;
pub mod serial_queue;

pub use cache::{spawn_warm_load, CacheEvent, CachedRow, MemoryCache};
pub use config::{PrefsConfig, CONFIG_FILE_NAME};
pub use coordinator::{StorageCoordinator, TransactionMetrics};
pub use editor::{Commit, Editor};
pub use globals::Globals;
pub use listeners::{Listener, ListenerHandle, ListenerRegistry};
pub use notifier::{refresh_row, ChangeNotifier};
pub use preferences::Preferences;
pub use serial_queue::{QueueStats, SerialQueue, TaskId};
