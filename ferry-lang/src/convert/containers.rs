use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{BuildHasher, Hash};

use super::{mismatch, reserve, Push, Read, StackEstimate};
use crate::error::{Error, Expected};
use crate::runtime::value::{Type, Value};
use crate::vm::{StackIndex, Vm};

impl<T: Push> Push for Option<T> {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1).max(T::ESTIMATE);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        match self {
            Some(value) => value.push(vm),
            None => {
                vm.push_nil();
                Ok(())
            }
        }
    }
}

impl<T: Read> Read for Option<T> {
    const ESTIMATE: StackEstimate = T::ESTIMATE;

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        match vm.get_type(index) {
            Type::Nil | Type::None => Ok(None),
            _ => T::read(vm, index).map(Some),
        }
    }
}

fn index_key(position: usize) -> Expected<i64> {
    i64::try_from(position).map_err(|_| Error::conversion("sequence is too long"))
}

fn push_sequence<T: Push>(vm: &mut Vm, items: impl IntoIterator<Item = T>) -> Expected<()> {
    vm.new_table();
    for (offset, item) in items.into_iter().enumerate() {
        let position = offset + 1;
        if let Err(err) = reserve(vm, T::ESTIMATE) {
            vm.pop(1);
            return Err(err);
        }
        if let Err(err) = item.push(vm) {
            vm.pop(1);
            return Err(err.prepend_context(format_args!("in index [{position}]")));
        }
        let stored = index_key(position).and_then(|key| vm.raw_set_index(-2, key));
        if let Err(err) = stored {
            vm.pop(1);
            return Err(err);
        }
    }
    Ok(())
}

fn read_element<T: Read>(vm: &mut Vm, table: StackIndex, position: usize) -> Expected<T> {
    vm.raw_get_index(table, index_key(position)?)?;
    let element = T::read(vm, -1);
    vm.pop(1);
    element.map_err(|err| err.prepend_context(format_args!("in index [{position}]")))
}

fn read_sequence<T: Read>(vm: &mut Vm, index: StackIndex) -> Expected<Vec<T>> {
    let table = vm.absolute(index);
    if vm.get_type(table) != Type::Table {
        return Err(mismatch(vm, "sequence", table));
    }
    let len = vm.raw_len(table);
    let mut elements = Vec::new();
    elements.try_reserve_exact(len)?;
    for position in 1..=len {
        Vec::push(&mut elements, read_element(vm, table, position)?);
    }
    Ok(elements)
}

impl<T: Push> Push for Vec<T> {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1).add(<T as Push>::ESTIMATE);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        push_sequence(vm, self)
    }
}

impl<T: Read> Read for Vec<T> {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1).add(<T as Read>::ESTIMATE);

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        read_sequence(vm, index)
    }
}

impl<T: Push, const N: usize> Push for [T; N] {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1).add(<T as Push>::ESTIMATE);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        push_sequence(vm, self)
    }
}

impl<T: Read, const N: usize> Read for [T; N] {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1).add(<T as Read>::ESTIMATE);

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let elements = read_sequence::<T>(vm, index)?;
        let found = elements.len();
        <[T; N]>::try_from(elements).map_err(|_| {
            Error::conversion(format_args!(
                "expected a sequence of {N} elements, found {found}"
            ))
        })
    }
}

impl<A: Push, B: Push> Push for (A, B) {
    const ESTIMATE: StackEstimate =
        StackEstimate::Slots(1).add(<A as Push>::ESTIMATE.max(<B as Push>::ESTIMATE));

    fn push(self, vm: &mut Vm) -> Expected<()> {
        let (a, b) = self;
        vm.new_table();
        let result = a
            .push(vm)
            .and_then(|()| vm.raw_set_index(-2, 1))
            .map_err(|err| err.prepend_context("in index [1]"))
            .and_then(|()| {
                b.push(vm)
                    .and_then(|()| vm.raw_set_index(-2, 2))
                    .map_err(|err| err.prepend_context("in index [2]"))
            });
        if result.is_err() {
            vm.pop(1);
        }
        result
    }
}

/// Pairs are sequences of at most two elements. A shorter sequence reads its
/// missing elements as `nil`, since pushing `(a, None)` stores no second
/// entry.
impl<A: Read, B: Read> Read for (A, B) {
    const ESTIMATE: StackEstimate =
        StackEstimate::Slots(1).add(<A as Read>::ESTIMATE.max(<B as Read>::ESTIMATE));

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let table = vm.absolute(index);
        if vm.get_type(table) != Type::Table {
            return Err(mismatch(vm, "pair", table));
        }
        let len = vm.raw_len(table);
        if len > 2 {
            return Err(Error::conversion(format_args!(
                "expected a pair, found a sequence of {len} elements"
            )));
        }
        let a = read_element(vm, table, 1)?;
        let b = read_element(vm, table, 2)?;
        Ok((a, b))
    }
}

fn push_map<K: Push, V: Push>(
    vm: &mut Vm,
    entries: impl IntoIterator<Item = (K, V)>,
) -> Expected<()> {
    vm.new_table();
    for (key, value) in entries {
        if let Err(err) = reserve(vm, K::ESTIMATE.add(V::ESTIMATE)) {
            vm.pop(1);
            return Err(err);
        }
        if let Err(err) = key.push(vm) {
            vm.pop(1);
            return Err(err.prepend_context("in key"));
        }
        if let Err(err) = value.push(vm) {
            let key = vm.pop_value();
            vm.pop(1);
            return Err(err.prepend_context(format_args!(
                "in value for key {}",
                vm.display(&key)
            )));
        }
        if let Err(err) = vm.set_table(-3) {
            vm.pop(1);
            return Err(err);
        }
    }
    Ok(())
}

fn read_entry<T: Read>(vm: &mut Vm, value: Value) -> Expected<T> {
    vm.push_value(value);
    let result = T::read(vm, -1);
    vm.pop(1);
    result
}

fn read_map<K: Read, V: Read>(
    vm: &mut Vm,
    index: StackIndex,
    mut insert: impl FnMut(K, V) -> Expected<()>,
) -> Expected<()> {
    let pairs = vm.table_pairs(index)?;
    for (key, value) in pairs {
        let host_key = read_entry::<K>(vm, key.clone())
            .map_err(|err| err.prepend_context(format_args!("in key {}", vm.display(&key))))?;
        let host_value = read_entry::<V>(vm, value).map_err(|err| {
            err.prepend_context(format_args!("in value for key {}", vm.display(&key)))
        })?;
        insert(host_key, host_value)?;
    }
    Ok(())
}

const fn map_estimate(key: StackEstimate, value: StackEstimate) -> StackEstimate {
    StackEstimate::Slots(1).add(key.max(value))
}

impl<K: Push, V: Push> Push for BTreeMap<K, V> {
    const ESTIMATE: StackEstimate =
        StackEstimate::Slots(1).add(<K as Push>::ESTIMATE.add(<V as Push>::ESTIMATE));

    fn push(self, vm: &mut Vm) -> Expected<()> {
        push_map(vm, self)
    }
}

impl<K: Read + Ord, V: Read> Read for BTreeMap<K, V> {
    const ESTIMATE: StackEstimate = map_estimate(<K as Read>::ESTIMATE, <V as Read>::ESTIMATE);

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let mut map = BTreeMap::new();
        read_map(vm, index, |key, value| {
            map.insert(key, value);
            Ok(())
        })?;
        Ok(map)
    }
}

impl<K: Push, V: Push, S> Push for HashMap<K, V, S> {
    const ESTIMATE: StackEstimate =
        StackEstimate::Slots(1).add(<K as Push>::ESTIMATE.add(<V as Push>::ESTIMATE));

    fn push(self, vm: &mut Vm) -> Expected<()> {
        push_map(vm, self)
    }
}

impl<K, V, S> Read for HashMap<K, V, S>
where
    K: Read + Eq + Hash,
    V: Read,
    S: BuildHasher + Default,
{
    const ESTIMATE: StackEstimate = map_estimate(<K as Read>::ESTIMATE, <V as Read>::ESTIMATE);

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let mut map = HashMap::with_hasher(S::default());
        read_map(vm, index, |key, value| {
            map.try_reserve(1)?;
            map.insert(key, value);
            Ok(())
        })?;
        Ok(map)
    }
}

impl<K: Push + Ord, V: Push> Push for kempt::Map<K, V> {
    const ESTIMATE: StackEstimate =
        StackEstimate::Slots(1).add(<K as Push>::ESTIMATE.add(<V as Push>::ESTIMATE));

    fn push(self, vm: &mut Vm) -> Expected<()> {
        push_map(vm, self.into_iter().map(kempt::map::Field::into_parts))
    }
}

impl<K: Read + Ord, V: Read> Read for kempt::Map<K, V> {
    const ESTIMATE: StackEstimate = map_estimate(<K as Read>::ESTIMATE, <V as Read>::ESTIMATE);

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let mut map = kempt::Map::new();
        read_map(vm, index, |key, value| {
            map.insert(key, value);
            Ok(())
        })?;
        Ok(map)
    }
}

/// Sets are tables mapping each element to `true`.
fn read_set<T: Read>(
    vm: &mut Vm,
    index: StackIndex,
    mut insert: impl FnMut(T) -> Expected<()>,
) -> Expected<()> {
    read_map(vm, index, |element, present: bool| {
        if present {
            insert(element)
        } else {
            Err(Error::conversion("set members must map to true"))
        }
    })
}

impl<T: Push> Push for BTreeSet<T> {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(2).add(<T as Push>::ESTIMATE);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        push_map(vm, self.into_iter().map(|element| (element, true)))
    }
}

impl<T: Read + Ord> Read for BTreeSet<T> {
    const ESTIMATE: StackEstimate = map_estimate(<T as Read>::ESTIMATE, StackEstimate::ZERO);

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let mut set = BTreeSet::new();
        read_set(vm, index, |element| {
            set.insert(element);
            Ok(())
        })?;
        Ok(set)
    }
}

impl<T: Push, S> Push for HashSet<T, S> {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(2).add(<T as Push>::ESTIMATE);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        push_map(vm, self.into_iter().map(|element| (element, true)))
    }
}

impl<T, S> Read for HashSet<T, S>
where
    T: Read + Eq + Hash,
    S: BuildHasher + Default,
{
    const ESTIMATE: StackEstimate = map_estimate(<T as Read>::ESTIMATE, StackEstimate::ZERO);

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let mut set = HashSet::with_hasher(S::default());
        read_set(vm, index, |element| {
            set.try_reserve(1)?;
            set.insert(element);
            Ok(())
        })?;
        Ok(set)
    }
}

/// Every remaining argument of a host function.
///
/// Must be the last parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Variadic<T>(pub Vec<T>);

impl<T> std::ops::Deref for Variadic<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Read> Read for Variadic<T> {
    const ESTIMATE: StackEstimate = <T as Read>::ESTIMATE;

    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        let first = vm.absolute(index);
        let Ok(first) = usize::try_from(first) else {
            return Ok(Self(Vec::new()));
        };
        Self::read_arg(vm, first)
    }

    fn read_arg(vm: &mut Vm, position: usize) -> Expected<Self> {
        let top = vm.top();
        let mut values = Vec::new();
        values.try_reserve_exact((top + 1).saturating_sub(position))?;
        for position in position..=top {
            let index = StackIndex::try_from(position).map_err(|_| Error::StackExhausted)?;
            let value = T::read(vm, index)
                .map_err(|err| err.prepend_context(format_args!("in argument #{position}")))?;
            Vec::push(&mut values, value);
        }
        Ok(Self(values))
    }
}
