//! Core types for the preferences store
//!
//! This module defines the foundational types:
//! - RowId: Store-assigned row identifier
//! - Origin: Identity of the process that wrote a row
//! - Address: Change-notification address (table, row or key)
//! - Entry: One decoded key/type/value record

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::PrefValue;

/// Identifier assigned to a row by the backing store
///
/// Entries that were never persisted carry [`RowId::UNASSIGNED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(i64);

impl RowId {
    /// Sentinel for entries not yet written to the store
    pub const UNASSIGNED: RowId = RowId(-1);

    /// Wrap a raw store identifier
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw identifier value
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// True once the store has assigned an identifier
    pub fn is_assigned(&self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the process or package that created a row
///
/// Only the origin that inserted a row may delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin(String);

impl Origin {
    /// Create an origin from any string-like name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Origin derived from the current process id
    pub fn current_process() -> Self {
        Self(format!("pid-{}", std::process::id()))
    }

    /// Origin name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an [`Address`] points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// The whole preferences table
    Table,
    /// One row of the table
    Row(RowId),
    /// One logical key, used for cross-process key watching
    Key(String),
}

/// Change-notification address
///
/// Formats as `<authority>/rows`, `<authority>/rows/<id>` or
/// `<authority>/keys/<key>`. A subscription made on an address with
/// descendants also receives changes of every address below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    authority: String,
    kind: AddressKind,
}

impl Address {
    /// Address of the whole table
    pub fn table(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            kind: AddressKind::Table,
        }
    }

    /// Address of a single row
    pub fn row(authority: impl Into<String>, id: RowId) -> Self {
        Self {
            authority: authority.into(),
            kind: AddressKind::Row(id),
        }
    }

    /// Address of a logical key
    pub fn key(authority: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            kind: AddressKind::Key(key.into()),
        }
    }

    /// Authority this address belongs to
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// What this address points at
    pub fn kind(&self) -> &AddressKind {
        &self.kind
    }

    /// Row id, if this is a row address
    pub fn row_id(&self) -> Option<RowId> {
        match self.kind {
            AddressKind::Row(id) => Some(id),
            _ => None,
        }
    }

    /// True if `self` equals `ancestor` or lies strictly below it
    pub fn is_descendant_of(&self, ancestor: &Address) -> bool {
        if self.authority != ancestor.authority {
            return false;
        }
        match (&ancestor.kind, &self.kind) {
            (AddressKind::Table, AddressKind::Table | AddressKind::Row(_)) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AddressKind::Table => write!(f, "{}/rows", self.authority),
            AddressKind::Row(id) => write!(f, "{}/rows/{}", self.authority, id),
            AddressKind::Key(key) => write!(f, "{}/keys/{}", self.authority, key),
        }
    }
}

/// One stored setting
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Store-assigned identifier, `UNASSIGNED` before first persistence
    pub id: RowId,
    /// Unique, non-empty key
    pub key: String,
    /// Typed value; its tag is the key's stored type
    pub value: PrefValue,
    /// Process that inserted the row, when known
    pub origin: Option<Origin>,
}

impl Entry {
    /// Entry that has not been persisted yet
    pub fn pending(key: impl Into<String>, value: PrefValue) -> Self {
        Self {
            id: RowId::UNASSIGNED,
            key: key.into(),
            value,
            origin: None,
        }
    }
}
