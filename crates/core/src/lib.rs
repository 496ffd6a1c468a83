//! Core types and traits for SharedPrefs
//!
//! This crate defines the foundational types used throughout the system:
//! - PrefValue / ValueType: typed preference values and their stored tags
//! - RowId, Origin, Address: store identifiers and notification addresses
//! - Entry: one decoded key/type/value record
//! - Codec: conversion between entries and raw store rows
//! - Error: error type hierarchy
//! - Traits: collaborator contracts (RowStore, StoreTxn, ChangeBus)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod traits;
pub mod types;
pub mod value;

pub use codec::{CodecError, RawValue, Row, RowValues};
pub use error::{Error, Result};
pub use traits::{ChangeBus, ChangeCallback, RowStore, Selection, StoreTxn, SubscriptionId};
pub use types::{Address, AddressKind, Entry, Origin, RowId};
pub use value::{PrefValue, ValueType};
