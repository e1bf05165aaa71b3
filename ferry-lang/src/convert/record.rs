use super::{mismatch, reserve, Push, Read, StackEstimate};
use crate::error::Expected;
use crate::runtime::value::Type;
use crate::vm::{StackIndex, Vm};

/// A host struct converted to and from a guest table by visiting its named
/// fields in order.
///
/// ```rust
/// use ferry_lang::convert::{FieldReader, FieldWriter, Record};
/// use ferry_lang::error::Expected;
///
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// impl Record for Point {
///     fn write_fields(self, fields: &mut FieldWriter<'_>) -> Expected<()> {
///         fields.field("x", self.x)?;
///         fields.field("y", self.y)
///     }
///
///     fn read_fields(fields: &mut FieldReader<'_>) -> Expected<Self> {
///         Ok(Self {
///             x: fields.field("x")?,
///             y: fields.field("y")?,
///         })
///     }
/// }
/// ```
pub trait Record: Sized {
    /// Writes every field of `self`.
    fn write_fields(self, fields: &mut FieldWriter<'_>) -> Expected<()>;

    /// Reads every field of a new value.
    fn read_fields(fields: &mut FieldReader<'_>) -> Expected<Self>;
}

/// Writes named fields into a guest table.
pub struct FieldWriter<'a> {
    vm: &'a mut Vm,
    table: StackIndex,
}

impl FieldWriter<'_> {
    /// Stores `value` under `name`.
    pub fn field<T: Push>(&mut self, name: &str, value: T) -> Expected<()> {
        reserve(self.vm, T::ESTIMATE.max(StackEstimate::Slots(1)))?;
        value
            .push(self.vm)
            .and_then(|()| self.vm.set_field(self.table, name))
            .map_err(|err| err.prepend_context(format_args!("in field `{name}`")))
    }
}

/// Reads named fields from a guest table.
pub struct FieldReader<'a> {
    vm: &'a mut Vm,
    table: StackIndex,
}

impl FieldReader<'_> {
    /// Reads the value stored under `name`.
    pub fn field<T: Read>(&mut self, name: &str) -> Expected<T> {
        reserve(self.vm, T::ESTIMATE.plus(1))?;
        let result = self.vm.get_field(self.table, name).and_then(|_| {
            let value = T::read(self.vm, -1);
            self.vm.pop(1);
            value
        });
        result.map_err(|err| err.prepend_context(format_args!("in field `{name}`")))
    }
}

/// Converts a [`Record`] as a guest table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fields<T>(pub T);

impl<T: Record> Push for Fields<T> {
    const ESTIMATE: StackEstimate = StackEstimate::Unknown;

    fn push(self, vm: &mut Vm) -> Expected<()> {
        reserve(vm, StackEstimate::Slots(1))?;
        vm.new_table();
        let table = vm.absolute(-1);
        let result = self.0.write_fields(&mut FieldWriter { vm, table });
        if result.is_err() {
            vm.pop(1);
        }
        result
    }
}

impl<T: Record> Read for Fields<T> {
    const ESTIMATE: StackEstimate = StackEstimate::Unknown;

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let table = vm.absolute(index);
        if vm.get_type(table) != Type::Table {
            return Err(mismatch(vm, Type::Table, table));
        }
        T::read_fields(&mut FieldReader { vm, table }).map(Fields)
    }
}
