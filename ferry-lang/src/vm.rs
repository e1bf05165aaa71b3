//! The guest machine: a single-threaded value stack, a heap of tables,
//! functions, opaque objects and coroutines, a global namespace, and a
//! host-side registry.
//!
//! # Stack discipline
//!
//! Every host function runs in its own frame. Positive [`StackIndex`] values
//! address the current frame starting at 1, and negative values count back
//! from the top. A frame starts with `min_frame_stack` slots available beyond
//! its arguments; [`Vm::reserve_stack`] grows that allowance. Pushing past the
//! allowance is a programming error caught by a debug assertion.
//!
//! # Errors
//!
//! The guest signals errors by unwinding. In Rust, unwinding is expressed by
//! returning the [`Raised`] token produced by [`Vm::raise_error`]; every
//! frame between the raise and the nearest [`Vm::protected_call`] returns it
//! unchanged. Frames are truncated back to their callee slot as they unwind,
//! so nothing pushed by an unwound frame survives.

use std::any::TypeId;
use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{Error, Expected};
use crate::lifecycle::{Master, VmHandle};
use crate::opaque::OpaqueEntry;
use crate::runtime::coroutine::{Coroutine, CoroutineStatus};
use crate::runtime::function::{Callback, Function, Raised, Transfer};
use crate::runtime::table::{Key, Table};
use crate::runtime::value::{ObjectId, Type, Value};

mod heap;

pub(crate) use heap::{Heap, Object, OpaqueBlock};

/// A position on the guest stack.
///
/// Positive values count from the bottom of the current frame starting at 1.
/// Negative values count from the top, with `-1` being the topmost value.
/// Zero is never valid.
pub type StackIndex = i32;

/// The number of results a call should leave on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Results {
    /// Keep every returned value.
    All,
    /// Keep exactly this many values, discarding extras and padding with
    /// `nil`.
    Fixed(usize),
}

impl From<usize> for Results {
    fn from(count: usize) -> Self {
        Self::Fixed(count)
    }
}

/// The result of a [`Vm::protected_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Status {
    /// The call completed. Its results are on the stack.
    Ok,
    /// The call raised an error. The error value is on top of the stack.
    Error,
}

/// The result of a [`Vm::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Resumed {
    /// The coroutine yielded this many values, now on top of the stack.
    Yield(usize),
    /// The coroutine finished, returning this many values, now on top of the
    /// stack.
    Return(usize),
    /// The coroutine raised an error or could not be resumed. The error value
    /// is on top of the stack.
    Error,
}

/// A key into a virtual machine's host-side registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKey {
    /// A well known name.
    Named(&'static str),
    /// A Rust type.
    Type(TypeId),
}

impl RegistryKey {
    /// Returns the key for the Rust type `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self::Type(TypeId::of::<T>())
    }
}

/// A unique identifier for a virtual machine within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(u64);

impl VmId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Frame {
    base: usize,
    limit: usize,
    function: Option<ObjectId>,
    /// Set when this frame is the entry frame of a resumed coroutine.
    coroutine: Option<ObjectId>,
    continuation: Option<Value>,
}

enum Completion {
    Returned(usize),
    Yielded(usize, Option<Value>),
}

/// Builds a [`Vm`].
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct VmBuilder {
    max_stack: usize,
    min_frame_stack: usize,
    max_depth: usize,
    gc_threshold: Option<usize>,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self {
            max_stack: 1_000_000,
            min_frame_stack: 20,
            max_depth: 200,
            gc_threshold: Some(4096),
        }
    }
}

impl VmBuilder {
    /// Returns a builder with the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of values the stack can hold across all
    /// frames.
    pub const fn max_stack(mut self, slots: usize) -> Self {
        self.max_stack = slots;
        self
    }

    /// Sets the number of slots every new frame may use without calling
    /// [`Vm::reserve_stack`].
    pub const fn min_frame_stack(mut self, slots: usize) -> Self {
        self.min_frame_stack = slots;
        self
    }

    /// Sets the maximum number of nested calls.
    pub const fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the number of allocations after which a top-level protected call
    /// runs the garbage collector. `None` disables automatic collection.
    pub const fn gc_threshold(mut self, allocations: Option<usize>) -> Self {
        self.gc_threshold = allocations;
        self
    }

    /// Returns a new virtual machine.
    #[must_use]
    pub fn build(self) -> Vm {
        let mut heap = Heap::default();
        let globals = heap.allocate(Object::Table(Table::new()));
        let id = VmId::next();
        Vm {
            heap,
            stack: Vec::new(),
            root: Frame {
                base: 0,
                limit: self.min_frame_stack,
                function: None,
                coroutine: None,
                continuation: None,
            },
            frames: Vec::new(),
            globals,
            registry: AHashMap::new(),
            opaque_types: AHashMap::new(),
            pending_error: None,
            running: Vec::new(),
            collecting: false,
            config: self,
            id,
            identity: Master::new(id),
        }
    }
}

/// A guest machine.
pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    root: Frame,
    frames: Vec<Frame>,
    globals: ObjectId,
    registry: AHashMap<RegistryKey, Value>,
    pub(crate) opaque_types: AHashMap<&'static str, OpaqueEntry>,
    pending_error: Option<Value>,
    running: Vec<ObjectId>,
    collecting: bool,
    config: VmBuilder,
    id: VmId,
    identity: Master<VmId>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Returns a virtual machine with the default limits.
    #[must_use]
    pub fn new() -> Self {
        VmBuilder::default().build()
    }

    /// Returns a builder for a virtual machine with custom limits.
    pub fn builder() -> VmBuilder {
        VmBuilder::default()
    }

    /// Returns this machine's process-unique id.
    #[must_use]
    pub const fn id(&self) -> VmId {
        self.id
    }

    /// Returns a handle that observes this machine without keeping it alive.
    #[must_use]
    pub fn handle(&self) -> VmHandle {
        VmHandle::new(&self.identity)
    }

    /// Returns true while a host function called by this machine is
    /// executing.
    #[must_use]
    pub fn in_call(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Runs `operation` and asserts in debug builds that it left the stack at
    /// the depth it found it.
    pub fn balanced<R>(&mut self, operation: impl FnOnce(&mut Self) -> R) -> R {
        let top = self.top();
        let result = operation(self);
        debug_assert_eq!(
            self.top(),
            top,
            "stack neutrality violated: depth was {top}, is {}",
            self.top()
        );
        result
    }

    fn frame(&self) -> &Frame {
        self.frames.last().unwrap_or(&self.root)
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().unwrap_or(&mut self.root)
    }

    fn slot(&self, index: StackIndex) -> Option<usize> {
        let base = self.frame().base;
        match index.cmp(&0) {
            Ordering::Greater => {
                let slot = base + usize::try_from(index - 1).ok()?;
                (slot < self.stack.len()).then_some(slot)
            }
            Ordering::Less => {
                let back = usize::try_from(index.unsigned_abs()).ok()?;
                (back <= self.stack.len() - base).then(|| self.stack.len() - back)
            }
            Ordering::Equal => None,
        }
    }

    fn slot_or_panic(&self, index: StackIndex) -> usize {
        match self.slot(index) {
            Some(slot) => slot,
            None => panic!("stack index {index} is out of bounds (top is {})", self.top()),
        }
    }

    /// Returns the number of values in the current frame.
    #[must_use]
    pub fn top(&self) -> usize {
        self.stack.len() - self.frame().base
    }

    /// Converts `index` into an equivalent positive index that stays valid as
    /// values are pushed. Invalid indices are returned unchanged.
    #[must_use]
    pub fn absolute(&self, index: StackIndex) -> StackIndex {
        if index >= 0 {
            return index;
        }
        self.slot(index)
            .and_then(|slot| StackIndex::try_from(slot - self.frame().base + 1).ok())
            .unwrap_or(index)
    }

    /// Returns the value at `index`, if one exists.
    #[must_use]
    pub fn get(&self, index: StackIndex) -> Option<&Value> {
        self.slot(index).map(|slot| &self.stack[slot])
    }

    /// Returns a copy of the value at `index`, or `nil` if none exists.
    #[must_use]
    pub fn value(&self, index: StackIndex) -> Value {
        self.get(index).cloned().unwrap_or_default()
    }

    /// Returns the type of the value at `index`, or [`Type::None`] if the
    /// index is not occupied.
    #[must_use]
    pub fn get_type(&self, index: StackIndex) -> Type {
        self.get(index).map_or(Type::None, Value::kind)
    }

    /// Returns the name of the type at `index`. Opaque objects report the
    /// identity of their registered type.
    #[must_use]
    pub fn type_name(&self, index: StackIndex) -> String {
        match self.get(index) {
            Some(value) => self.value_type_name(value),
            None => String::from(Type::None.name()),
        }
    }

    pub(crate) fn value_type_name(&self, value: &Value) -> String {
        if let Value::Opaque(id) = value {
            if let Some(name) = self.opaque_name(*id) {
                return name;
            }
        }
        String::from(value.kind().name())
    }

    fn opaque_name(&self, id: ObjectId) -> Option<String> {
        let meta = self.heap.opaque(id)?.meta?;
        let name = self.heap.table(meta)?.get_str("__name")?;
        name.as_str().map(String::from)
    }

    /// Returns the boolean at `index`.
    #[must_use]
    pub fn to_bool(&self, index: StackIndex) -> Option<bool> {
        match self.get(index) {
            Some(Value::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    /// Returns the integer at `index`.
    #[must_use]
    pub fn to_int(&self, index: StackIndex) -> Option<i64> {
        match self.get(index) {
            Some(Value::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Returns the float at `index`. Integers are not converted.
    #[must_use]
    pub fn to_float(&self, index: StackIndex) -> Option<f64> {
        match self.get(index) {
            Some(Value::Float(value)) => Some(*value),
            _ => None,
        }
    }

    /// Returns the string at `index`.
    #[must_use]
    pub fn to_str(&self, index: StackIndex) -> Option<&str> {
        self.get(index).and_then(Value::as_str)
    }

    /// Ensures at least `slots` more values can be pushed onto the current
    /// frame. Returns false if the stack cannot grow that far.
    #[must_use]
    pub fn reserve_stack(&mut self, slots: usize) -> bool {
        let needed = self.stack.len() + slots;
        if needed > self.config.max_stack || self.stack.try_reserve(slots).is_err() {
            return false;
        }
        let frame = self.frame_mut();
        frame.limit = frame.limit.max(needed);
        true
    }

    fn push_raw(&mut self, value: Value) {
        debug_assert!(
            self.stack.len() < self.frame().limit,
            "guest stack overflow: push beyond the {} reserved slots",
            self.frame().limit - self.frame().base
        );
        self.stack.push(value);
    }

    /// Pushes a value without checking the frame's allowance. Used for error
    /// values, which must always fit.
    fn push_unchecked(&mut self, value: Value) {
        self.stack.push(value);
        let len = self.stack.len();
        let frame = self.frame_mut();
        frame.limit = frame.limit.max(len);
    }

    /// Pushes `nil`.
    pub fn push_nil(&mut self) {
        self.push_raw(Value::Nil);
    }

    /// Pushes a boolean.
    pub fn push_bool(&mut self, value: bool) {
        self.push_raw(Value::Bool(value));
    }

    /// Pushes an integer.
    pub fn push_int(&mut self, value: i64) {
        self.push_raw(Value::Int(value));
    }

    /// Pushes a float.
    pub fn push_float(&mut self, value: f64) {
        self.push_raw(Value::Float(value));
    }

    /// Pushes a copy of `value` as a string.
    pub fn push_string(&mut self, value: &str) {
        self.push_raw(Value::String(Arc::from(value)));
    }

    /// Pushes `value`.
    ///
    /// Values referring to heap objects must come from this machine.
    pub fn push_value(&mut self, value: Value) {
        debug_assert!(
            value.object().map_or(true, |id| self.heap.contains(id)),
            "pushed a reference to a collected object"
        );
        self.push_raw(value);
    }

    /// Pushes a copy of the value at `index`.
    pub fn push_copy(&mut self, index: StackIndex) {
        let value = self.value(index);
        self.push_raw(value);
    }

    /// Pops `count` values.
    pub fn pop(&mut self, count: usize) {
        debug_assert!(count <= self.top(), "popped more values than the frame holds");
        let len = self.stack.len().saturating_sub(count).max(self.frame().base);
        self.stack.truncate(len);
    }

    /// Removes the top value and returns it.
    pub fn pop_value(&mut self) -> Value {
        if self.top() == 0 {
            return Value::Nil;
        }
        self.stack.pop().unwrap_or_default()
    }

    /// Sets the number of values in the current frame, discarding values or
    /// padding with `nil`.
    pub fn set_top(&mut self, top: usize) {
        let target = self.frame().base + top;
        if target <= self.stack.len() {
            self.stack.truncate(target);
        } else {
            while self.stack.len() < target {
                self.push_raw(Value::Nil);
            }
        }
    }

    /// Removes the value at `index`, shifting the values above it down.
    pub fn remove(&mut self, index: StackIndex) -> Value {
        let slot = self.slot_or_panic(index);
        self.stack.remove(slot)
    }

    /// Moves the top value to `index`, shifting the values above it up.
    pub fn insert(&mut self, index: StackIndex) {
        let slot = self.slot_or_panic(index);
        if let Some(value) = self.stack.pop() {
            self.stack.insert(slot, value);
        }
    }

    /// Pops the top value and stores it at `index`.
    pub fn replace(&mut self, index: StackIndex) {
        let slot = self.slot_or_panic(index);
        let value = self.pop_value();
        if slot < self.stack.len() {
            self.stack[slot] = value;
        }
    }

    /// Copies the value at `from` to `to`.
    pub fn copy(&mut self, from: StackIndex, to: StackIndex) {
        let value = self.value(from);
        let slot = self.slot_or_panic(to);
        self.stack[slot] = value;
    }

    pub(crate) fn allocate(&mut self, object: Object) -> ObjectId {
        self.heap.allocate(object)
    }

    /// Pushes a new, empty table.
    pub fn new_table(&mut self) {
        let id = self.allocate(Object::Table(Table::new()));
        self.push_raw(Value::Table(id));
    }

    fn table_id(&self, index: StackIndex) -> Expected<ObjectId> {
        match self.get(index) {
            Some(Value::Table(id)) if self.heap.contains(*id) => Ok(*id),
            Some(Value::Table(_)) => Err(Error::ObjectCollected),
            _ => Err(Error::mismatch(Type::Table, self.type_name(index))),
        }
    }

    fn raw_set(&mut self, table: ObjectId, key: Key, value: Value) -> Expected<()> {
        self.heap
            .table_mut(table)
            .ok_or(Error::ObjectCollected)?
            .set(key, value);
        Ok(())
    }

    /// Pops a value and stores it in the table at `table` under `name`.
    ///
    /// The value is popped even if the store fails.
    pub fn set_field(&mut self, table: StackIndex, name: &str) -> Expected<()> {
        let table = self.table_id(table);
        let value = self.pop_value();
        self.raw_set(table?, Key::from(name), value)
    }

    /// Pushes the value stored under `name` in the value at `index`,
    /// following `__index` tables of metatables.
    pub fn get_field(&mut self, index: StackIndex, name: &str) -> Expected<Type> {
        let target = self.value(index);
        let value = self.index_value(&target, &Key::from(name))?;
        let kind = value.kind();
        self.push_raw(value);
        Ok(kind)
    }

    /// Pops a key and a value, in that order from the top, and stores them in
    /// the table at `table`. The value is on top; the key is below it.
    pub fn set_table(&mut self, table: StackIndex) -> Expected<()> {
        let table = self.table_id(table);
        let value = self.pop_value();
        let key = self.pop_value();
        self.raw_set(table?, Key::from_value(&key)?, value)
    }

    /// Pops a key and pushes the value stored under it in the value at
    /// `index`.
    pub fn get_table(&mut self, index: StackIndex) -> Expected<Type> {
        let target = self.value(index);
        let key = self.pop_value();
        let value = self.index_value(&target, &Key::from_value(&key)?)?;
        let kind = value.kind();
        self.push_raw(value);
        Ok(kind)
    }

    /// Pops a value and stores it in the table at `table` at integer key `n`,
    /// ignoring metatables.
    pub fn raw_set_index(&mut self, table: StackIndex, n: i64) -> Expected<()> {
        let table = self.table_id(table);
        let value = self.pop_value();
        self.raw_set(table?, Key::Int(n), value)
    }

    /// Pushes the value stored at integer key `n` of the table at `table`,
    /// ignoring metatables.
    pub fn raw_get_index(&mut self, table: StackIndex, n: i64) -> Expected<Type> {
        let table = self.table_id(table)?;
        let value = self
            .heap
            .table(table)
            .and_then(|table| table.get(&Key::Int(n)))
            .cloned()
            .unwrap_or_default();
        let kind = value.kind();
        self.push_raw(value);
        Ok(kind)
    }

    /// Returns the length of the value at `index`: the sequence length of a
    /// table, or the byte length of a string. Other values have length 0.
    #[must_use]
    pub fn raw_len(&self, index: StackIndex) -> usize {
        match self.get(index) {
            Some(Value::String(s)) => s.len(),
            Some(Value::Table(id)) => self.heap.table(*id).map_or(0, Table::sequence_len),
            _ => 0,
        }
    }

    /// Returns a copy of every entry of the table at `index`, in key order.
    pub fn table_pairs(&self, index: StackIndex) -> Expected<Vec<(Value, Value)>> {
        let table = self.table_id(index)?;
        let table = self.heap.table(table).ok_or(Error::ObjectCollected)?;
        let mut pairs = Vec::new();
        pairs.try_reserve(table.count())?;
        pairs.extend(table.iter().map(|(key, value)| (key.to_value(), value.clone())));
        Ok(pairs)
    }

    /// Pops a table or `nil` and installs it as the metatable of the table at
    /// `index`.
    pub fn set_metatable(&mut self, index: StackIndex) -> Expected<()> {
        let table = self.table_id(index);
        let metatable = match self.pop_value() {
            Value::Nil => None,
            Value::Table(id) => Some(id),
            other => return Err(Error::mismatch("table or nil", other.kind())),
        };
        self.heap
            .table_mut(table?)
            .ok_or(Error::ObjectCollected)?
            .metatable = metatable;
        Ok(())
    }

    /// Pushes the metatable of the value at `index` and returns true, or
    /// pushes nothing and returns false if it has none.
    pub fn get_metatable(&mut self, index: StackIndex) -> bool {
        match self.get(index).and_then(|value| self.metatable_of(value)) {
            Some(metatable) => {
                self.push_raw(Value::Table(metatable));
                true
            }
            None => false,
        }
    }

    fn metatable_of(&self, value: &Value) -> Option<ObjectId> {
        match value {
            Value::Table(id) => self.heap.table(*id)?.metatable,
            Value::Opaque(id) => self.heap.opaque(*id)?.meta,
            _ => None,
        }
    }

    fn index_value(&self, target: &Value, key: &Key) -> Expected<Value> {
        const MAX_CHAIN: usize = 100;
        let mut current = target.clone();
        for _ in 0..MAX_CHAIN {
            match &current {
                Value::Table(id) => {
                    let table = self.heap.table(*id).ok_or(Error::ObjectCollected)?;
                    if let Some(value) = table.get(key) {
                        return Ok(value.clone());
                    }
                }
                Value::Opaque(id) => {
                    if !self.heap.contains(*id) {
                        return Err(Error::ObjectCollected);
                    }
                }
                other => {
                    return Err(Error::runtime(format_args!(
                        "attempt to index a {} value",
                        other.kind()
                    )))
                }
            }
            let next = self
                .metatable_of(&current)
                .and_then(|meta| self.heap.table(meta))
                .and_then(|meta| meta.get_str("__index"))
                .cloned();
            match next {
                Some(next @ Value::Table(_)) => current = next,
                _ => return Ok(Value::Nil),
            }
        }
        Err(Error::runtime("__index chain too long"))
    }

    /// Pushes a function invoking `callback`.
    pub fn push_function(&mut self, callback: Callback) {
        let id = self.allocate(Object::Function(Function::new(callback)));
        self.push_raw(Value::Function(id));
    }

    /// Pops `upvalues` values and pushes a function invoking `callback` that
    /// closes over them. The deepest popped value becomes upvalue 1.
    pub fn push_closure(&mut self, callback: Callback, upvalues: usize) {
        debug_assert!(upvalues <= self.top(), "not enough values for upvalues");
        let start = self.stack.len() - upvalues.min(self.top());
        let upvalues = self.stack.split_off(start);
        let id = self.allocate(Object::Function(Function {
            callback,
            upvalues,
        }));
        self.push_raw(Value::Function(id));
    }

    /// Returns a copy of upvalue `n` (1-based) of the running function, or
    /// `nil` if it has none.
    #[must_use]
    pub fn upvalue(&self, n: usize) -> Value {
        self.frame()
            .function
            .and_then(|id| self.heap.function(id))
            .and_then(|function| function.upvalues.get(n.checked_sub(1)?))
            .cloned()
            .unwrap_or_default()
    }

    /// Pushes the running function. Returns false, pushing nothing, when no
    /// host function is running.
    pub fn push_current_function(&mut self) -> bool {
        match self.frame().function {
            Some(id) => {
                self.push_raw(Value::Function(id));
                true
            }
            None => false,
        }
    }

    /// Pops a value and stores it as upvalue `n` (1-based) of the running
    /// function. Returns false if the function has no such upvalue.
    pub fn set_upvalue(&mut self, n: usize) -> bool {
        let value = self.pop_value();
        let Some(function) = self.frame().function else {
            return false;
        };
        match self
            .heap
            .function_mut(function)
            .and_then(|function| function.upvalues.get_mut(n.checked_sub(1)?))
        {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Returns the callback of the function at `index`.
    #[must_use]
    pub fn function_callback(&self, index: StackIndex) -> Option<Callback> {
        match self.get(index) {
            Some(Value::Function(id)) => Some(self.heap.function(*id)?.callback.clone()),
            _ => None,
        }
    }

    /// Pops the top value and stores it as the pending error, returning the
    /// token that unwinds to the nearest protected call.
    pub fn raise_error(&mut self) -> Raised {
        let value = self.pop_value();
        trace!("raising {}", self.display(&value));
        self.pending_error = Some(value);
        Raised(())
    }

    /// Raises `error` as a guest string without using stack space.
    pub fn raise(&mut self, error: &Error) -> Raised {
        self.pending_error = Some(Value::from(error.message().as_ref()));
        Raised(())
    }

    /// Pushes `error`'s message as a guest string.
    ///
    /// Error values always fit: this push ignores the frame's allowance.
    pub fn push_error(&mut self, error: &Error) {
        self.push_unchecked(Value::from(error.message().as_ref()));
    }

    /// Consumes a raised error, returning the guest value that was raised.
    pub fn take_raised(&mut self, raised: Raised) -> Value {
        let Raised(()) = raised;
        self.pending_error.take().unwrap_or_default()
    }

    /// Consumes a raised error and converts it into an [`Error`].
    pub fn raised_error(&mut self, raised: Raised) -> Error {
        let value = self.take_raised(raised);
        Error::runtime(self.display(&value))
    }

    /// Calls the function below the top `nargs` values with those arguments.
    ///
    /// The function and its arguments are replaced by the results. Errors
    /// raised by the callee propagate as [`Raised`], with the function and its
    /// arguments removed.
    pub fn call(&mut self, nargs: usize, results: impl Into<Results>) -> Result<usize, Raised> {
        let callee = self.callee_slot(nargs);
        let count = match self.invoke(nargs, None)? {
            Completion::Returned(count) | Completion::Yielded(count, _) => count,
        };
        Ok(self.adjust_results(callee, count, results.into()))
    }

    /// Calls the function below the top `nargs` values, catching any raised
    /// error.
    ///
    /// On [`Status::Error`], the function and its arguments are replaced by
    /// the error value.
    pub fn protected_call(&mut self, nargs: usize, results: impl Into<Results>) -> Status {
        let status = self.protected_call_inner(nargs, results.into());
        if !self.in_call() {
            self.maybe_collect();
        }
        status
    }

    fn protected_call_inner(&mut self, nargs: usize, results: Results) -> Status {
        let callee = self.callee_slot(nargs);
        match self.invoke(nargs, None) {
            Ok(Completion::Returned(count) | Completion::Yielded(count, _)) => {
                self.adjust_results(callee, count, results);
                Status::Ok
            }
            Err(raised) => {
                let error = self.take_raised(raised);
                self.stack.truncate(callee);
                self.push_unchecked(error);
                Status::Error
            }
        }
    }

    fn callee_slot(&self, nargs: usize) -> usize {
        assert!(
            nargs < self.top(),
            "a call needs a function and {nargs} arguments on the stack"
        );
        self.stack.len() - nargs - 1
    }

    fn adjust_results(&mut self, first: usize, count: usize, results: Results) -> usize {
        match results {
            Results::All => count,
            Results::Fixed(wanted) => {
                let target = first + wanted;
                if target <= self.stack.len() {
                    self.stack.truncate(target);
                } else {
                    while self.stack.len() < target {
                        self.push_unchecked(Value::Nil);
                    }
                }
                wanted
            }
        }
    }

    fn invoke(&mut self, nargs: usize, coroutine: Option<ObjectId>) -> Result<Completion, Raised> {
        let callee = self.callee_slot(nargs);
        let target = self.stack[callee].clone();
        let (function, callback) = match target {
            Value::Function(id) => match self.heap.function(id) {
                Some(function) => (id, function.callback.clone()),
                None => return Err(self.unwind(callee, &Error::ObjectCollected)),
            },
            other => {
                let error = Error::runtime(format_args!(
                    "attempt to call a {} value",
                    self.value_type_name(&other)
                ));
                return Err(self.unwind(callee, &error));
            }
        };
        if self.frames.len() >= self.config.max_depth {
            return Err(self.unwind(callee, &Error::runtime("call depth exceeded")));
        }
        let limit = self.stack.len() + self.config.min_frame_stack;
        if limit > self.config.max_stack {
            return Err(self.unwind(callee, &Error::StackExhausted));
        }
        if self.stack.try_reserve(self.config.min_frame_stack).is_err() {
            return Err(self.unwind(callee, &Error::OutOfMemory));
        }

        self.frames.push(Frame {
            base: callee + 1,
            limit,
            function: Some(function),
            coroutine,
            continuation: None,
        });
        let result = callback.invoke(self);
        let frame = self.frames.pop();
        let continuation = frame.and_then(|frame| frame.continuation);

        match result {
            Ok(Transfer::Return(count)) => Ok(Completion::Returned(self.move_results(callee, count))),
            Ok(Transfer::Yield(count)) if coroutine.is_some() => Ok(Completion::Yielded(
                self.move_results(callee, count),
                continuation,
            )),
            Ok(Transfer::Yield(_)) => {
                let error = if self.running.is_empty() {
                    Error::runtime("attempt to yield from outside a coroutine")
                } else {
                    Error::runtime("attempt to yield across a host call boundary")
                };
                Err(self.unwind(callee, &error))
            }
            Err(raised) => {
                self.stack.truncate(callee);
                Err(raised)
            }
        }
    }

    fn unwind(&mut self, callee: usize, error: &Error) -> Raised {
        self.stack.truncate(callee);
        self.raise(error)
    }

    /// Moves the top `count` values of a finished frame down to `callee`.
    fn move_results(&mut self, callee: usize, count: usize) -> usize {
        let available = self.stack.len() - (callee + 1);
        debug_assert!(
            count <= available,
            "returned {count} values but the frame only holds {available}"
        );
        let count = count.min(available);
        self.stack.drain(callee..self.stack.len() - count);
        count
    }

    /// Pops a function and pushes a new suspended coroutine that runs it.
    pub fn new_thread(&mut self) -> Expected<()> {
        let body = self.pop_value();
        if !matches!(body, Value::Function(_)) {
            return Err(Error::mismatch(Type::Function, body.kind()));
        }
        let id = self.allocate(Object::Thread(Coroutine::new(body)));
        self.push_raw(Value::Thread(id));
        Ok(())
    }

    /// Returns the status of the coroutine at `index`.
    #[must_use]
    pub fn coroutine_status(&self, index: StackIndex) -> Option<CoroutineStatus> {
        match self.get(index) {
            Some(Value::Thread(id)) => self.heap.coroutine(*id).map(Coroutine::status),
            _ => None,
        }
    }

    /// Resumes the coroutine at `index`, passing it the top `nargs` values.
    ///
    /// The arguments are replaced by the yielded or returned values, or by
    /// the error value.
    pub fn resume(&mut self, index: StackIndex, nargs: usize) -> Resumed {
        assert!(nargs <= self.top(), "resume needs {nargs} arguments on the stack");
        let first_arg = self.stack.len() - nargs;
        let id = match self.get(index).cloned() {
            Some(Value::Thread(id)) if self.heap.coroutine(id).is_some() => id,
            Some(Value::Thread(_)) => return self.fail_resume(first_arg, &Error::ExpiredCoroutine),
            _ => {
                let error = Error::mismatch(Type::Thread, self.type_name(index));
                return self.fail_resume(first_arg, &error);
            }
        };
        let (status, pending) = match self.heap.coroutine_mut(id) {
            Some(coroutine) if coroutine.status == CoroutineStatus::Suspended => {
                (coroutine.status, coroutine.pending.take())
            }
            Some(coroutine) => (coroutine.status, None),
            None => return self.fail_resume(first_arg, &Error::ExpiredCoroutine),
        };
        match status {
            CoroutineStatus::Suspended => {}
            CoroutineStatus::Dead => return self.fail_resume(first_arg, &Error::ExpiredCoroutine),
            other => {
                let error =
                    Error::runtime(format_args!("cannot resume a {} coroutine", other.name()));
                return self.fail_resume(first_arg, &error);
            }
        }
        let Some(function) = pending else {
            self.set_coroutine_status(id, CoroutineStatus::Dead);
            return Resumed::Return(nargs);
        };

        self.stack.insert(first_arg, function);
        if let Some(&outer) = self.running.last() {
            self.set_coroutine_status(outer, CoroutineStatus::Normal);
        }
        self.running.push(id);
        self.set_coroutine_status(id, CoroutineStatus::Running);

        let result = self.invoke(nargs, Some(id));

        self.running.pop();
        if let Some(&outer) = self.running.last() {
            self.set_coroutine_status(outer, CoroutineStatus::Running);
        }
        match result {
            Ok(Completion::Returned(count)) => {
                self.set_coroutine_status(id, CoroutineStatus::Dead);
                Resumed::Return(count)
            }
            Ok(Completion::Yielded(count, continuation)) => {
                if let Some(coroutine) = self.heap.coroutine_mut(id) {
                    coroutine.status = CoroutineStatus::Suspended;
                    coroutine.pending = continuation;
                }
                Resumed::Yield(count)
            }
            Err(raised) => {
                self.set_coroutine_status(id, CoroutineStatus::Dead);
                let error = self.take_raised(raised);
                self.push_unchecked(error);
                Resumed::Error
            }
        }
    }

    fn fail_resume(&mut self, first_arg: usize, error: &Error) -> Resumed {
        self.stack.truncate(first_arg);
        self.push_error(error);
        Resumed::Error
    }

    fn set_coroutine_status(&mut self, id: ObjectId, status: CoroutineStatus) {
        if let Some(coroutine) = self.heap.coroutine_mut(id) {
            coroutine.status = status;
        }
    }

    /// Returns true if the running host function is the entry function of a
    /// coroutine and may yield.
    #[must_use]
    pub fn can_yield(&self) -> bool {
        self.frame().coroutine.is_some()
    }

    /// Pops a function to run the next time the current coroutine is resumed,
    /// after the running function yields.
    pub fn set_continuation(&mut self) -> Expected<()> {
        let continuation = self.pop_value();
        if !matches!(continuation, Value::Function(_)) {
            return Err(Error::mismatch(Type::Function, continuation.kind()));
        }
        if !self.can_yield() {
            return Err(Error::runtime(
                "continuations can only be set by the entry function of a coroutine",
            ));
        }
        self.frame_mut().continuation = Some(continuation);
        Ok(())
    }

    /// Pushes the global namespace table.
    pub fn push_globals(&mut self) {
        self.push_raw(Value::Table(self.globals));
    }

    /// Pushes the global named `name`.
    pub fn get_global(&mut self, name: &str) -> Type {
        let value = self
            .heap
            .table(self.globals)
            .and_then(|globals| globals.get_str(name))
            .cloned()
            .unwrap_or_default();
        let kind = value.kind();
        self.push_raw(value);
        kind
    }

    /// Pops a value and stores it as the global named `name`.
    pub fn set_global(&mut self, name: &str) {
        let value = self.pop_value();
        if let Some(globals) = self.heap.table_mut(self.globals) {
            globals.set(Key::from(name), value);
        }
    }

    /// Pops a table and installs it as the global namespace.
    pub fn replace_globals(&mut self) -> Expected<()> {
        match self.pop_value() {
            Value::Table(id) if self.heap.contains(id) => {
                self.globals = id;
                Ok(())
            }
            Value::Table(_) => Err(Error::ObjectCollected),
            other => Err(Error::mismatch(Type::Table, other.kind())),
        }
    }

    /// Returns the registry value stored under `key`.
    #[must_use]
    pub fn registry_value(&self, key: RegistryKey) -> Option<&Value> {
        self.registry.get(&key)
    }

    /// Pushes the registry value stored under `key`, or `nil`.
    pub fn push_registry(&mut self, key: RegistryKey) -> Type {
        let value = self.registry_value(key).cloned().unwrap_or_default();
        let kind = value.kind();
        self.push_raw(value);
        kind
    }

    /// Pops a value and stores it in the registry under `key`. Storing `nil`
    /// removes the entry.
    pub fn set_registry(&mut self, key: RegistryKey) {
        let value = self.pop_value();
        if value.is_nil() {
            self.registry.remove(&key);
        } else {
            self.registry.insert(key, value);
        }
    }

    /// Returns a printable rendition of `value`.
    #[must_use]
    pub fn display(&self, value: &Value) -> String {
        match value {
            Value::Nil => String::from("nil"),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{f:?}"),
            Value::String(s) => String::from(&**s),
            Value::Opaque(id) => format!("{}: {id:?}", self.value_type_name(value)),
            other => format!("{}: {:?}", other.kind(), other.object()),
        }
    }

    /// Returns the number of live heap objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.heap.len()
    }

    fn roots(&self) -> Vec<ObjectId> {
        let mut roots = Vec::new();
        roots.push(self.globals);
        roots.extend(self.stack.iter().filter_map(Value::object));
        roots.extend(self.registry.values().filter_map(Value::object));
        roots.extend(self.pending_error.as_ref().and_then(Value::object));
        roots.extend(self.running.iter().copied());
        roots.extend(self.opaque_types.values().map(|entry| entry.metatable));
        for frame in self.frames.iter().chain([&self.root]) {
            roots.extend(frame.function);
            roots.extend(frame.coroutine);
            roots.extend(frame.continuation.as_ref().and_then(Value::object));
        }
        roots
    }

    /// Frees every unreachable object and runs pending teardown entries.
    /// Returns the number of objects freed.
    ///
    /// Roots are the stack, the globals, the registry, running coroutines
    /// and the metatables of registered opaque types. Values held only by
    /// host code outside of these are not roots.
    pub fn collect_garbage(&mut self) -> usize {
        if self.collecting {
            return 0;
        }
        self.collecting = true;
        let sweep = self.heap.collect(self.roots());
        debug!(
            freed = sweep.freed,
            retained = sweep.retained,
            finalizing = sweep.finalize.len(),
            "collected garbage"
        );
        self.run_finalizers(sweep.finalize);
        self.collecting = false;
        sweep.freed
    }

    fn maybe_collect(&mut self) {
        if let Some(threshold) = self.config.gc_threshold {
            if self.heap.allocations >= threshold {
                self.collect_garbage();
            }
        }
    }

    fn run_finalizers(&mut self, pending: Vec<(ObjectId, Value)>) {
        for (object, finalizer) in pending {
            self.push_unchecked(finalizer);
            self.push_unchecked(Value::Opaque(object));
            if self.protected_call_inner(1, Results::Fixed(0)) == Status::Error {
                #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
                let error = self.pop_value();
                warn!("finalizer failed: {}", self.display(&error));
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.collecting = true;
        let pending = self.heap.drain_finalizers();
        self.run_finalizers(pending);
    }
}

impl Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id())
            .field("stack", &self.stack)
            .field("depth", &self.frames.len())
            .field("objects", &self.heap.len())
            .finish_non_exhaustive()
    }
}
