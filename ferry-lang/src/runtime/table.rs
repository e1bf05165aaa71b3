//! Guest tables: ordered maps from normalized keys to values.

use std::cmp::Ordering;
use std::sync::Arc;

use kempt::Map;

use crate::error::{Error, Expected};
use crate::runtime::value::{ObjectId, Value};

/// A normalized table key.
///
/// Floats with an integral value are stored as integers so that `1` and
/// `1.0` address the same entry. `nil` and NaN cannot be keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// A boolean key.
    Bool(bool),
    /// An integer key.
    Int(i64),
    /// A non-integral float key.
    Float(FloatKey),
    /// A string key.
    String(Arc<str>),
    /// A table used as a key.
    Table(ObjectId),
    /// A function used as a key.
    Function(ObjectId),
    /// An opaque object used as a key.
    Opaque(ObjectId),
    /// A coroutine used as a key.
    Thread(ObjectId),
}

impl Key {
    /// Normalizes `value` into a key.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is `nil` or NaN.
    pub fn from_value(value: &Value) -> Expected<Self> {
        Ok(match value {
            Value::Nil => return Err(Error::runtime("table index is nil")),
            Value::Bool(b) => Key::Bool(*b),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) if f.is_nan() => return Err(Error::runtime("table index is NaN")),
            Value::Float(f) => match integral(*f) {
                Some(i) => Key::Int(i),
                None => Key::Float(FloatKey(*f)),
            },
            Value::String(s) => Key::String(s.clone()),
            Value::Table(id) => Key::Table(*id),
            Value::Function(id) => Key::Function(*id),
            Value::Opaque(id) => Key::Opaque(*id),
            Value::Thread(id) => Key::Thread(*id),
        })
    }

    /// Returns the value this key was normalized from.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Float(f) => Value::Float(f.0),
            Key::String(s) => Value::String(s.clone()),
            Key::Table(id) => Value::Table(*id),
            Key::Function(id) => Value::Function(*id),
            Key::Opaque(id) => Value::Opaque(*id),
            Key::Thread(id) => Value::Thread(*id),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::String(Arc::from(value))
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

/// A float table key, totally ordered by [`f64::total_cmp`].
#[derive(Debug, Clone, Copy)]
pub struct FloatKey(f64);

impl PartialEq for FloatKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloatKey {}

impl PartialOrd for FloatKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::hash::Hash for FloatKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// Returns `value` as an `i64` if it has no fractional part and fits.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
pub(crate) fn integral(value: f64) -> Option<i64> {
    // 2^63 is exactly representable; every float below it in magnitude that
    // has no fraction fits in an i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (value.fract() == 0.0 && value >= -LIMIT && value < LIMIT).then(|| value as i64)
}

/// A guest table.
#[derive(Debug, Default)]
pub struct Table {
    entries: Map<Key, Value>,
    pub(crate) metatable: Option<ObjectId>,
}

impl Table {
    /// Returns an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored at `key`.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Returns the value stored under the string key `name`.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&Value> {
        self.entries.get(&Key::from(name))
    }

    /// Stores `value` at `key`. Storing `nil` removes the entry.
    pub fn set(&mut self, key: Key, value: Value) {
        if value.is_nil() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// Returns the number of entries in this table.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the length of the sequence part of this table: the number of
    /// consecutive integer keys starting at 1.
    #[must_use]
    pub fn sequence_len(&self) -> usize {
        let mut len = 0_usize;
        while let Ok(next) = i64::try_from(len + 1) {
            if self.entries.get(&Key::Int(next)).is_none() {
                break;
            }
            len += 1;
        }
        len
    }

    /// Iterates the entries of this table in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> + '_ {
        self.entries.iter().map(|field| (field.key(), &field.value))
    }

    /// Returns this table's metatable.
    #[must_use]
    pub const fn metatable(&self) -> Option<ObjectId> {
        self.metatable
    }
}
