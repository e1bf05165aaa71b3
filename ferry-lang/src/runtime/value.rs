//! The dynamically typed values held on the guest stack.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use alot::LotId;

/// A generation-checked reference to an object in a guest machine's heap.
///
/// An id whose object was collected never resolves to a newer object that
/// reuses the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) LotId);

impl Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectId").field(&self.0).finish()
    }
}

/// A guest value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The empty value.
    #[default]
    Nil,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Int(i64),
    /// A double precision float.
    Float(f64),
    /// An immutable string.
    String(Arc<str>),
    /// A table.
    Table(ObjectId),
    /// A function, optionally closing over upvalues.
    Function(ObjectId),
    /// A host object embedded in guest memory.
    Opaque(ObjectId),
    /// A coroutine.
    Thread(ObjectId),
}

impl Value {
    /// Returns the guest type of this value.
    #[must_use]
    pub const fn kind(&self) -> Type {
        match self {
            Value::Nil => Type::Nil,
            Value::Bool(_) => Type::Boolean,
            Value::Int(_) => Type::Integer,
            Value::Float(_) => Type::Float,
            Value::String(_) => Type::String,
            Value::Table(_) => Type::Table,
            Value::Function(_) => Type::Function,
            Value::Opaque(_) => Type::Opaque,
            Value::Thread(_) => Type::Thread,
        }
    }

    /// Returns the heap object this value refers to, if any.
    #[must_use]
    pub const fn object(&self) -> Option<ObjectId> {
        match self {
            Value::Table(id) | Value::Function(id) | Value::Opaque(id) | Value::Thread(id) => {
                Some(*id)
            }
            _ => None,
        }
    }

    /// Returns true if this value is [`Value::Nil`].
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns false for `nil` and `false`, and true for everything else.
    #[must_use]
    pub const fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Returns this value as a string slice, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! impl_from_value {
    ($($from:ty => $variant:ident),+ $(,)?) => {
        $(impl From<$from> for Value {
            fn from(value: $from) -> Self {
                Self::$variant(value.into())
            }
        })+
    };
}

impl_from_value!(
    bool => Bool,
    i64 => Int,
    f64 => Float,
    Arc<str> => String,
    &str => String,
    String => String,
);

/// The type of a guest value, including the absence of a value at an
/// unoccupied stack position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// No value exists at the inspected position.
    None,
    /// `nil`.
    Nil,
    /// A boolean.
    Boolean,
    /// An integer.
    Integer,
    /// A float.
    Float,
    /// A string.
    String,
    /// A table.
    Table,
    /// A function.
    Function,
    /// An opaque host object.
    Opaque,
    /// A coroutine.
    Thread,
}

impl Type {
    /// Returns the name guest code uses for this type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Type::None => "no value",
            Type::Nil => "nil",
            Type::Boolean => "boolean",
            Type::Integer => "integer",
            Type::Float => "float",
            Type::String => "string",
            Type::Table => "table",
            Type::Function => "function",
            Type::Opaque => "opaque",
            Type::Thread => "thread",
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
