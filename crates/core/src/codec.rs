//! Value codec
//!
//! Converts between a decoded [`Entry`] and the raw row the store keeps in its
//! `{id, key, type, value, origin}` table. Dispatch is by the `type` column:
//!
//! | tag          | raw value                                   |
//! |--------------|---------------------------------------------|
//! | `bool`       | `Integer(0)` or `Integer(1)`                |
//! | `int`        | `Integer` within `i32` range                |
//! | `long`       | `Integer`                                   |
//! | `float`      | `Real` (an `Integer` is widened)            |
//! | `string`     | `Text`                                      |
//! | `string_set` | `Blob`, MessagePack array of strings        |
//! | anything else| `Blob`, MessagePack of a structured value   |
//!
//! Unknown tags go through the opaque path so rows written by a newer client
//! still load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::types::{Entry, Origin, RowId};
use crate::value::{PrefValue, ValueType};

/// Codec-local failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// The row's type/value pair cannot be interpreted
    #[error("corrupt row '{key}': {reason}")]
    Corrupt {
        /// Key of the row
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// An opaque value cannot be serialized
    #[error("cannot encode '{key}': {reason}")]
    Encode {
        /// Key being written
        key: String,
        /// Serializer message
        reason: String,
    },
}

/// A raw column value as the store holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    /// SQL NULL
    Null,
    /// 64-bit integer column
    Integer(i64),
    /// Double precision column
    Real(f64),
    /// Text column
    Text(String),
    /// Binary column
    Blob(Vec<u8>),
}

/// A full row read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Store-assigned identifier
    pub id: RowId,
    /// Unique key
    pub key: String,
    /// Type tag; `None` when the column is NULL
    pub type_tag: Option<String>,
    /// Encoded value
    pub value: RawValue,
    /// Origin stamped on insert
    pub origin: Option<Origin>,
}

/// Column values written by an insert or update
///
/// The id is assigned by the store and the origin is stamped by the
/// coordinator, so neither is part of the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RowValues {
    /// Unique key
    pub key: String,
    /// Type tag
    pub type_tag: String,
    /// Encoded value
    pub value: RawValue,
}

fn corrupt(key: &str, reason: impl Into<String>) -> CodecError {
    CodecError::Corrupt {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Encode a typed value for `key` into row columns
pub fn encode_value(key: &str, value: &PrefValue) -> Result<RowValues, CodecError> {
    let raw = match value {
        PrefValue::Bool(b) => RawValue::Integer(i64::from(*b)),
        PrefValue::Int(i) => RawValue::Integer(i64::from(*i)),
        PrefValue::Long(l) => RawValue::Integer(*l),
        PrefValue::Float(f) => RawValue::Real(f64::from(*f)),
        PrefValue::String(s) => RawValue::Text(s.clone()),
        PrefValue::StringSet(set) => {
            let items: Vec<&String> = set.iter().collect();
            RawValue::Blob(rmp_serde::to_vec(&items).map_err(|e| CodecError::Encode {
                key: key.to_string(),
                reason: e.to_string(),
            })?)
        }
        PrefValue::Opaque(v) => {
            RawValue::Blob(rmp_serde::to_vec(v).map_err(|e| CodecError::Encode {
                key: key.to_string(),
                reason: e.to_string(),
            })?)
        }
    };
    Ok(RowValues {
        key: key.to_string(),
        type_tag: value.type_name().to_string(),
        value: raw,
    })
}

/// Encode an entry into row columns
pub fn encode(entry: &Entry) -> Result<RowValues, CodecError> {
    encode_value(&entry.key, &entry.value)
}

/// Decode a raw row into an entry
///
/// Fails with [`CodecError::Corrupt`] when the tag is missing or the payload
/// does not fit it.
pub fn decode(row: &Row) -> Result<Entry, CodecError> {
    let key = row.key.as_str();
    let tag = row
        .type_tag
        .as_deref()
        .ok_or_else(|| corrupt(key, "missing type tag"))?;

    let value = match (ValueType::from_tag(tag), &row.value) {
        (ValueType::Bool, RawValue::Integer(0)) => PrefValue::Bool(false),
        (ValueType::Bool, RawValue::Integer(1)) => PrefValue::Bool(true),
        (ValueType::Bool, RawValue::Integer(n)) => {
            return Err(corrupt(key, format!("bool payload {}", n)))
        }
        (ValueType::Int, RawValue::Integer(n)) => PrefValue::Int(
            i32::try_from(*n).map_err(|_| corrupt(key, format!("int payload {} out of range", n)))?,
        ),
        (ValueType::Long, RawValue::Integer(n)) => PrefValue::Long(*n),
        (ValueType::Float, RawValue::Real(f)) => PrefValue::Float(*f as f32),
        (ValueType::Float, RawValue::Integer(n)) => PrefValue::Float(*n as f32),
        (ValueType::String, RawValue::Text(s)) => PrefValue::String(s.clone()),
        (ValueType::StringSet, RawValue::Blob(bytes)) => {
            let items: Vec<String> = rmp_serde::from_slice(bytes)
                .map_err(|e| corrupt(key, format!("string set payload: {}", e)))?;
            PrefValue::StringSet(items.into_iter().collect::<BTreeSet<_>>())
        }
        (ValueType::Opaque, RawValue::Blob(bytes)) => PrefValue::Opaque(
            rmp_serde::from_slice(bytes)
                .map_err(|e| corrupt(key, format!("opaque payload: {}", e)))?,
        ),
        (ty, raw) => {
            return Err(corrupt(
                key,
                format!("{} tag '{}' with {} payload", ty, tag, raw_kind(raw)),
            ))
        }
    };

    Ok(Entry {
        id: row.id,
        key: row.key.clone(),
        value,
        origin: row.origin.clone(),
    })
}

fn raw_kind(raw: &RawValue) -> &'static str {
    match raw {
        RawValue::Null => "null",
        RawValue::Integer(_) => "integer",
        RawValue::Real(_) => "real",
        RawValue::Text(_) => "text",
        RawValue::Blob(_) => "blob",
    }
}
