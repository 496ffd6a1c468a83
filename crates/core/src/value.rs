//! Value types for preferences
//!
//! This module defines:
//! - `ValueType`: the stored type tag of a key
//! - `PrefValue`: tagged union of every value a key can hold
//!
//! ## Type Rules
//!
//! - A key's type is whatever was written last; there is no implicit coercion.
//! - `Int(1) != Long(1)`: different tags are never equal.
//! - Floats are 32-bit and follow IEEE-754 equality.
//! - Anything that is not one of the six primitive tags is `Opaque`, a
//!   structured value carried as JSON in memory and MessagePack on disk.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::codec::CodecError;

/// Stored type tag of a preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Boolean, persisted as integer 0/1
    Bool,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// 32-bit float
    Float,
    /// UTF-8 string
    String,
    /// Set of strings
    StringSet,
    /// Any other serializable structured value
    Opaque,
}

impl ValueType {
    /// Tag written into the `type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::StringSet => "string_set",
            ValueType::Opaque => "opaque",
        }
    }

    /// Parse a stored tag. Unknown tags map to `Opaque`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "bool" => ValueType::Bool,
            "int" => ValueType::Int,
            "long" => ValueType::Long,
            "float" => ValueType::Float,
            "string" => ValueType::String,
            "string_set" => ValueType::StringSet,
            _ => ValueType::Opaque,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed preference value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrefValue {
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer
    Int(i32),
    /// 64-bit signed integer
    Long(i64),
    /// 32-bit floating point
    Float(f32),
    /// UTF-8 string
    String(String),
    /// Unordered set of strings
    StringSet(BTreeSet<String>),
    /// Structured value of a caller-defined type
    Opaque(serde_json::Value),
}

impl PartialEq for PrefValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PrefValue::Bool(a), PrefValue::Bool(b)) => a == b,
            (PrefValue::Int(a), PrefValue::Int(b)) => a == b,
            (PrefValue::Long(a), PrefValue::Long(b)) => a == b,
            (PrefValue::Float(a), PrefValue::Float(b)) => a == b,
            (PrefValue::String(a), PrefValue::String(b)) => a == b,
            (PrefValue::StringSet(a), PrefValue::StringSet(b)) => a == b,
            (PrefValue::Opaque(a), PrefValue::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl PrefValue {
    /// Wrap any serializable value as `Opaque`
    ///
    /// Fails when the value has no JSON representation (for example a map
    /// with non-string keys).
    pub fn opaque<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Self, CodecError> {
        serde_json::to_value(value)
            .map(PrefValue::Opaque)
            .map_err(|e| CodecError::Encode {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Build a string set from any iterator of strings
    pub fn string_set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PrefValue::StringSet(values.into_iter().map(Into::into).collect())
    }

    /// Type tag of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            PrefValue::Bool(_) => ValueType::Bool,
            PrefValue::Int(_) => ValueType::Int,
            PrefValue::Long(_) => ValueType::Long,
            PrefValue::Float(_) => ValueType::Float,
            PrefValue::String(_) => ValueType::String,
            PrefValue::StringSet(_) => ValueType::StringSet,
            PrefValue::Opaque(_) => ValueType::Opaque,
        }
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        self.value_type().as_str()
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PrefValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i32 if this is an Int value
    pub fn as_int(&self) -> Option<i32> {
        match self {
            PrefValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as i64 if this is a Long value
    pub fn as_long(&self) -> Option<i64> {
        match self {
            PrefValue::Long(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f32 if this is a Float value
    pub fn as_float(&self) -> Option<f32> {
        match self {
            PrefValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrefValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as a string set if this is a StringSet value
    pub fn as_string_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            PrefValue::StringSet(s) => Some(s),
            _ => None,
        }
    }

    /// Deserialize an Opaque value into a caller type
    ///
    /// Returns `None` for non-opaque values and for opaque values whose
    /// shape does not fit `T`.
    pub fn to_opaque<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            PrefValue::Opaque(v) => serde_json::from_value(v.clone()).ok(),
            _ => None,
        }
    }
}

impl From<bool> for PrefValue {
    fn from(b: bool) -> Self {
        PrefValue::Bool(b)
    }
}

impl From<i32> for PrefValue {
    fn from(i: i32) -> Self {
        PrefValue::Int(i)
    }
}

impl From<i64> for PrefValue {
    fn from(i: i64) -> Self {
        PrefValue::Long(i)
    }
}

impl From<f32> for PrefValue {
    fn from(f: f32) -> Self {
        PrefValue::Float(f)
    }
}

impl From<String> for PrefValue {
    fn from(s: String) -> Self {
        PrefValue::String(s)
    }
}

impl From<&str> for PrefValue {
    fn from(s: &str) -> Self {
        PrefValue::String(s.to_string())
    }
}

impl From<BTreeSet<String>> for PrefValue {
    fn from(s: BTreeSet<String>) -> Self {
        PrefValue::StringSet(s)
    }
}
