//! Conversions between host values and guest stack entries.
//!
//! [`Push`] deposits exactly one stack entry for a host value. [`Read`]
//! inspects an entry and either returns a host value or an error naming the
//! expected and actual guest types. Neither performs silent coercions:
//! integers narrow only when they fit, floats never read as integers, and
//! integers widen into floats only when the float represents them exactly.
//!
//! Every strategy declares a [`StackEstimate`]: an upper bound on the number
//! of stack slots the conversion uses. Callers reserve that many slots before
//! converting. Strategies with an [`StackEstimate::Unknown`] estimate reserve
//! their own space as they go.

use std::sync::Arc;

use crate::error::{Error, Expected};
use crate::runtime::table::integral;
use crate::runtime::value::{Type, Value};
use crate::vm::{StackIndex, Vm};

mod containers;
mod record;

pub use containers::Variadic;
pub use record::{FieldReader, FieldWriter, Fields, Record};

/// An upper bound on the guest stack slots a conversion uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEstimate {
    /// At most this many slots.
    Slots(usize),
    /// The bound cannot be computed ahead of time.
    Unknown,
}

impl StackEstimate {
    /// No slots.
    pub const ZERO: Self = Self::Slots(0);

    /// Returns this estimate plus `slots`.
    #[must_use]
    pub const fn plus(self, slots: usize) -> Self {
        match self {
            Self::Slots(count) => Self::Slots(count.saturating_add(slots)),
            Self::Unknown => Self::Unknown,
        }
    }

    /// Returns the sum of two estimates.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        match other {
            Self::Slots(count) => self.plus(count),
            Self::Unknown => Self::Unknown,
        }
    }

    /// Returns the larger of two estimates.
    #[must_use]
    pub const fn max(self, other: Self) -> Self {
        match (self, other) {
            (Self::Slots(a), Self::Slots(b)) => Self::Slots(if a > b { a } else { b }),
            _ => Self::Unknown,
        }
    }

    /// Returns the number of slots, if known.
    #[must_use]
    pub const fn slots(self) -> Option<usize> {
        match self {
            Self::Slots(count) => Some(count),
            Self::Unknown => None,
        }
    }
}

/// Reserves the slots described by `estimate` on the current frame.
///
/// Unknown estimates reserve nothing; their conversions reserve as they go.
pub fn reserve(vm: &mut Vm, estimate: StackEstimate) -> Expected<()> {
    match estimate {
        StackEstimate::Slots(slots) if !vm.reserve_stack(slots) => Err(Error::StackExhausted),
        _ => Ok(()),
    }
}

/// A host value that can be pushed onto the guest stack.
pub trait Push: Sized {
    /// The most stack slots pushing a value of this type uses, including the
    /// slot left holding the value.
    const ESTIMATE: StackEstimate;

    /// Pushes exactly one entry representing `self`.
    ///
    /// On failure nothing is left on the stack.
    fn push(self, vm: &mut Vm) -> Expected<()>;
}

/// A host value that can be read from the guest stack.
pub trait Read: Sized {
    /// The most stack slots reading a value of this type uses temporarily.
    const ESTIMATE: StackEstimate = StackEstimate::ZERO;

    /// Reads the entry at `index`. The stack is left as it was found.
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self>;

    /// Reads argument `position` (1-based) of the running host function.
    ///
    /// Most types read the entry at `position`. Types like [`Variadic`]
    /// consume every remaining argument instead.
    fn read_arg(vm: &mut Vm, position: usize) -> Expected<Self> {
        let index = StackIndex::try_from(position).map_err(|_| Error::StackExhausted)?;
        Self::read(vm, index)
    }
}

/// A list of host values pushed as separate stack entries, such as function
/// arguments.
pub trait PushMany: Sized {
    /// The most stack slots pushing these values uses.
    const ESTIMATE: StackEstimate;

    /// Pushes every value, returning how many entries were pushed. On
    /// failure, nothing is left on the stack.
    fn push_many(self, vm: &mut Vm) -> Expected<usize>;
}

impl PushMany for () {
    const ESTIMATE: StackEstimate = StackEstimate::ZERO;

    fn push_many(self, _vm: &mut Vm) -> Expected<usize> {
        Ok(0)
    }
}

macro_rules! impl_push_many {
    ($($name:ident: $type:ident),+) => {
        impl<$($type: Push),+> PushMany for ($($type,)+) {
            const ESTIMATE: StackEstimate = StackEstimate::ZERO $(.add($type::ESTIMATE))+;

            fn push_many(self, vm: &mut Vm) -> Expected<usize> {
                let ($($name,)+) = self;
                let mut pushed = 0;
                $(
                    if let Err(err) = $name.push(vm) {
                        vm.pop(pushed);
                        return Err(err);
                    }
                    pushed += 1;
                )+
                Ok(pushed)
            }
        }
    };
}

impl_push_many!(a: A);
impl_push_many!(a: A, b: B);
impl_push_many!(a: A, b: B, c: C);
impl_push_many!(a: A, b: B, c: C, d: D);
impl_push_many!(a: A, b: B, c: C, d: D, e: E);
impl_push_many!(a: A, b: B, c: C, d: D, e: E, f: F);
impl_push_many!(a: A, b: B, c: C, d: D, e: E, f: F, g: G);
impl_push_many!(a: A, b: B, c: C, d: D, e: E, f: F, g: G, h: H);

/// Returns an error describing the entry at `index` as the wrong type.
pub fn mismatch(vm: &Vm, expected: impl std::fmt::Display, index: StackIndex) -> Error {
    Error::mismatch(expected, vm.type_name(index))
}

/// The guest `nil` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nil;

impl Push for Nil {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_nil();
        Ok(())
    }
}

impl Read for Nil {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        match vm.get_type(index) {
            Type::Nil | Type::None => Ok(Nil),
            _ => Err(mismatch(vm, Type::Nil, index)),
        }
    }
}

impl Push for bool {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_bool(self);
        Ok(())
    }
}

impl Read for bool {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        vm.to_bool(index)
            .ok_or_else(|| mismatch(vm, Type::Boolean, index))
    }
}

fn read_integer(vm: &Vm, index: StackIndex) -> Expected<i64> {
    vm.to_int(index)
        .ok_or_else(|| mismatch(vm, Type::Integer, index))
}

macro_rules! impl_integers {
    ($($type:ty),+) => {$(
        impl Push for $type {
            const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

            #[allow(clippy::useless_conversion)]
            fn push(self, vm: &mut Vm) -> Expected<()> {
                let value = i64::try_from(self).map_err(|_| {
                    Error::conversion(format_args!(
                        "integer {self} does not fit in a guest integer"
                    ))
                })?;
                vm.push_int(value);
                Ok(())
            }
        }

        impl Read for $type {
            #[allow(clippy::useless_conversion)]
            fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
                let value = read_integer(vm, index)?;
                <$type>::try_from(value).map_err(|_| {
                    if value < 0 && <$type>::MIN == 0 {
                        Error::conversion(format_args!(
                            "negative integer {value} cannot be read as {}",
                            stringify!($type)
                        ))
                    } else {
                        Error::conversion(format_args!(
                            "integer {value} is out of range for {}",
                            stringify!($type)
                        ))
                    }
                })
            }
        }
    )+};
}

impl_integers!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// Returns `value` as a float if the float represents it exactly.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn exact_float(value: i64) -> Option<f64> {
    let float = value as f64;
    (integral(float) == Some(value)).then_some(float)
}

impl Push for f64 {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_float(self);
        Ok(())
    }
}

impl Read for f64 {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        match vm.get(index) {
            Some(Value::Float(value)) => Ok(*value),
            Some(Value::Int(value)) => exact_float(*value).ok_or_else(|| {
                Error::conversion(format_args!(
                    "integer {value} cannot be represented exactly as a float"
                ))
            }),
            _ => Err(mismatch(vm, Type::Float, index)),
        }
    }
}

impl Push for f32 {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_float(f64::from(self));
        Ok(())
    }
}

impl Read for f32 {
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let value = f64::read(vm, index)?;
        let narrowed = value as f32;
        if value.is_nan() || f64::from(narrowed) == value {
            Ok(narrowed)
        } else {
            Err(Error::conversion(format_args!(
                "float {value} cannot be represented exactly as f32"
            )))
        }
    }
}

impl Push for &str {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_string(self);
        Ok(())
    }
}

impl Push for &String {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_string(self);
        Ok(())
    }
}

impl Push for String {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_value(Value::String(Arc::from(self)));
        Ok(())
    }
}

impl Push for Arc<str> {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        vm.push_value(Value::String(self));
        Ok(())
    }
}

impl Read for String {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let value = vm
            .to_str(index)
            .ok_or_else(|| mismatch(vm, Type::String, index))?;
        let mut string = String::new();
        string.try_reserve_exact(value.len())?;
        string.push_str(value);
        Ok(string)
    }
}

impl Read for Arc<str> {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        match vm.get(index) {
            Some(Value::String(value)) => Ok(value.clone()),
            _ => Err(mismatch(vm, Type::String, index)),
        }
    }
}

impl Push for char {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        let mut buffer = [0; 4];
        vm.push_string(self.encode_utf8(&mut buffer));
        Ok(())
    }
}

impl Read for char {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let value = vm
            .to_str(index)
            .ok_or_else(|| mismatch(vm, "character", index))?;
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => Ok(ch),
            _ => Err(Error::conversion(format_args!(
                "expected a single character, found a string of {} bytes",
                value.len()
            ))),
        }
    }
}

impl Push for Value {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        if let Some(object) = self.object() {
            if !vm.heap.contains(object) {
                return Err(Error::ObjectCollected);
            }
        }
        vm.push_value(self);
        Ok(())
    }
}

impl Read for Value {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        Ok(vm.value(index))
    }
}
