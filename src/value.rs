//! Element values and keys stored in arrays

use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::array::Array;

/// Type tag of a [`TypedValue`], used where only the type matters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    /// Absent value marker
    Uninit,
    /// Null
    Null,
    /// Boolean
    Bool,
    /// 64-bit integer
    Int,
    /// Double
    Double,
    /// String
    Str,
    /// Nested array
    Arr,
}

/// A runtime value. `Uninit` is never stored in an array; reads return it to
/// signal a missing key.
#[derive(Clone)]
pub enum TypedValue {
    /// Absent value marker
    Uninit,
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// Double
    Double(f64),
    /// Immutable shared string
    Str(Arc<str>),
    /// Nested array, holding one reference
    Arr(Array),
}

impl Default for TypedValue {
    fn default() -> Self {
        TypedValue::Uninit
    }
}

impl TypedValue {
    /// Creates a string value.
    pub fn str(s: &str) -> Self {
        TypedValue::Str(Arc::from(s))
    }

    /// Returns false only for the absent marker.
    pub fn is_init(&self) -> bool {
        !matches!(self, TypedValue::Uninit)
    }

    /// The value's type tag.
    pub fn data_type(&self) -> DataType {
        match self {
            TypedValue::Uninit => DataType::Uninit,
            TypedValue::Null => DataType::Null,
            TypedValue::Bool(_) => DataType::Bool,
            TypedValue::Int(_) => DataType::Int,
            TypedValue::Double(_) => DataType::Double,
            TypedValue::Str(_) => DataType::Str,
            TypedValue::Arr(_) => DataType::Arr,
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TypedValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the nested array, if any.
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            TypedValue::Arr(a) => Some(a),
            _ => None,
        }
    }

    /// Total order used by the default sort: values of different types order
    /// by type, arrays order by size.
    pub fn compare(&self, other: &TypedValue) -> Ordering {
        use TypedValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Int(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Str(a), Str(b)) => a.cmp(b),
            (Arr(a), Arr(b)) => a.size().cmp(&b.size()),
            _ => self.data_type().cmp(&other.data_type()),
        }
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        use TypedValue::*;
        match (self, other) {
            (Uninit, Uninit) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Arr(a), Arr(b)) => a == b,
            _ => false,
        }
    }
}

impl Debug for TypedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Uninit => f.write_str("uninit"),
            TypedValue::Null => f.write_str("null"),
            TypedValue::Bool(b) => Debug::fmt(b, f),
            TypedValue::Int(i) => Debug::fmt(i, f),
            TypedValue::Double(d) => Debug::fmt(d, f),
            TypedValue::Str(s) => Debug::fmt(s, f),
            TypedValue::Arr(a) => Debug::fmt(a, f),
        }
    }
}

impl From<bool> for TypedValue {
    fn from(b: bool) -> Self {
        TypedValue::Bool(b)
    }
}

impl From<i64> for TypedValue {
    fn from(i: i64) -> Self {
        TypedValue::Int(i)
    }
}

impl From<i32> for TypedValue {
    fn from(i: i32) -> Self {
        TypedValue::Int(i64::from(i))
    }
}

impl From<f64> for TypedValue {
    fn from(d: f64) -> Self {
        TypedValue::Double(d)
    }
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        TypedValue::str(s)
    }
}

impl From<Arc<str>> for TypedValue {
    fn from(s: Arc<str>) -> Self {
        TypedValue::Str(s)
    }
}

impl From<Array> for TypedValue {
    fn from(a: Array) -> Self {
        TypedValue::Arr(a)
    }
}

impl From<Key> for TypedValue {
    fn from(k: Key) -> Self {
        match k {
            Key::Int(i) => TypedValue::Int(i),
            Key::Str(s) => TypedValue::Str(s),
        }
    }
}

/// An array key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Integer key
    Int(i64),
    /// String key
    Str(Arc<str>),
}

impl Key {
    /// Creates a string key.
    pub fn str(s: &str) -> Self {
        Key::Str(Arc::from(s))
    }

    /// Converts a value usable as a key (integers and strings).
    pub fn from_value(value: &TypedValue) -> Option<Self> {
        match value {
            TypedValue::Int(i) => Some(Key::Int(*i)),
            TypedValue::Str(s) => Some(Key::Str(s.clone())),
            _ => None,
        }
    }

    /// Integer keys before string keys, then natural order.
    pub fn compare(&self, other: &Key) -> Ordering {
        match (self, other) {
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Str(a), Key::Str(b)) => a.cmp(b),
            (Key::Int(_), Key::Str(_)) => Ordering::Less,
            (Key::Str(_), Key::Int(_)) => Ordering::Greater,
        }
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => Debug::fmt(i, f),
            Key::Str(s) => Debug::fmt(s, f),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::str(s)
    }
}
