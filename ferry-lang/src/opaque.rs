//! Rust values living inside guest memory.
//!
//! A Rust type becomes an opaque guest type by implementing [`Opaque`] and
//! returning a `static` [`OpaqueType`] that describes it:
//!
//! ```rust
//! use ferry_lang::error::Expected;
//! use ferry_lang::opaque::{Handle, Opaque, OpaqueType};
//! use ferry_lang::vm::Vm;
//!
//! struct Counter(i64);
//!
//! static COUNTER: OpaqueType<Counter> = OpaqueType::new("Counter", |t| {
//!     t.with_method("increment", |vm: &mut Vm, this: Handle<Counter>| -> Expected<i64> {
//!         let counter = this.get_mut(vm)?;
//!         counter.0 += 1;
//!         Ok(counter.0)
//!     })
//! });
//!
//! impl Opaque for Counter {
//!     fn opaque_type() -> &'static OpaqueType<Self> {
//!         &COUNTER
//!     }
//! }
//! ```
//!
//! Every registered type gets a metatable holding its identity under
//! `__name`, its methods under `__index` and, unless disabled, a teardown
//! entry under `__gc`. The metatable doubles as the metadata handle each
//! object carries: [`test`] only succeeds when the object's metatable is the
//! one registered for the requested Rust type.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::adapter::HostFunction;
use crate::convert::{reserve, Push, Read, StackEstimate};
use crate::error::{Error, Expected};
use crate::runtime::function::{Callback, Raised, RawFunction, Transfer};
use crate::runtime::value::{ObjectId, Value};
use crate::vm::{Object, OpaqueBlock, StackIndex, Vm};

/// A Rust type that can live inside guest memory.
pub trait Opaque: Any + Send + Sized {
    /// Returns the static description of this type.
    fn opaque_type() -> &'static OpaqueType<Self>;
}

/// A lazily built [`OpaqueDescriptor`] for `T`, meant to be stored in a
/// `static`.
pub struct OpaqueType<T> {
    descriptor: OnceLock<OpaqueDescriptor>,
    identity: &'static str,
    init: fn(OpaqueBuilder<T>) -> OpaqueBuilder<T>,
}

impl<T> OpaqueType<T> {
    /// Returns a type named `identity` whose descriptor is built by `init`
    /// the first time it is needed.
    ///
    /// `identity` must be unique among the opaque types registered on a
    /// machine.
    pub const fn new(
        identity: &'static str,
        init: fn(OpaqueBuilder<T>) -> OpaqueBuilder<T>,
    ) -> Self {
        Self {
            descriptor: OnceLock::new(),
            identity,
            init,
        }
    }

    /// Returns the unique identity of this type.
    #[must_use]
    pub const fn identity(&self) -> &'static str {
        self.identity
    }
}

impl<T> Deref for OpaqueType<T>
where
    T: Opaque,
{
    type Target = OpaqueDescriptor;

    fn deref(&self) -> &Self::Target {
        self.descriptor
            .get_or_init(|| (self.init)(OpaqueBuilder::new(self.identity)).descriptor)
    }
}

#[derive(Clone)]
enum Teardown {
    Default,
    Custom(Callback),
    Disabled,
}

#[derive(Clone, Copy)]
struct PayloadCodec {
    encode: fn(&(dyn Any + Send)) -> Expected<String>,
    decode: fn(&str) -> Expected<Box<dyn Any + Send>>,
}

/// Everything known about a registered opaque type.
pub struct OpaqueDescriptor {
    identity: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    methods: Vec<(&'static str, Callback)>,
    permanents: Vec<(&'static str, Callback)>,
    teardown: Teardown,
    payload: Option<PayloadCodec>,
}

impl OpaqueDescriptor {
    /// Returns the unique identity of this type.
    #[must_use]
    pub const fn identity(&self) -> &'static str {
        self.identity
    }

    /// Returns the methods, in declaration order.
    #[must_use]
    pub fn methods(&self) -> &[(&'static str, Callback)] {
        &self.methods
    }

    /// Returns the additional callbacks that need stable names for
    /// persistence, in declaration order.
    #[must_use]
    pub fn permanents(&self) -> &[(&'static str, Callback)] {
        &self.permanents
    }

    /// Returns the teardown entry installed as `__gc`, if any.
    #[must_use]
    pub fn teardown(&self) -> Option<Callback> {
        match &self.teardown {
            Teardown::Default => Some(Callback::raw(default_teardown)),
            Teardown::Custom(callback) => Some(callback.clone()),
            Teardown::Disabled => None,
        }
    }

    /// Returns true if instances can be written to snapshots.
    #[must_use]
    pub const fn is_persistable(&self) -> bool {
        self.payload.is_some()
    }
}

impl Debug for OpaqueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueDescriptor")
            .field("identity", &self.identity)
            .field("type_name", &self.type_name)
            .field(
                "methods",
                &self.methods.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("persistable", &self.payload.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds an [`OpaqueDescriptor`].
#[must_use]
pub struct OpaqueBuilder<T> {
    descriptor: OpaqueDescriptor,
    _type: PhantomData<fn() -> T>,
}

impl<T> OpaqueBuilder<T>
where
    T: Opaque,
{
    fn new(identity: &'static str) -> Self {
        Self {
            descriptor: OpaqueDescriptor {
                identity,
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                methods: Vec::new(),
                permanents: Vec::new(),
                teardown: Teardown::Default,
                payload: None,
            },
            _type: PhantomData,
        }
    }

    /// Adds a method. The object is passed as the first argument, usually
    /// read as a [`Handle<T>`].
    pub fn with_method<Args>(
        mut self,
        name: &'static str,
        function: impl HostFunction<Args>,
    ) -> Self {
        self.descriptor.methods.push((name, Callback::new(function)));
        self
    }

    /// Adds a method using the guest's native calling convention.
    pub fn with_raw_method(mut self, name: &'static str, function: RawFunction) -> Self {
        self.descriptor.methods.push((name, Callback::raw(function)));
        self
    }

    /// Adds a function that is not a method but may still be referenced by
    /// guest values, such as a continuation, so it needs a stable name.
    pub fn with_permanent<Args>(
        mut self,
        name: &'static str,
        function: impl HostFunction<Args>,
    ) -> Self {
        self.descriptor
            .permanents
            .push((name, Callback::new(function)));
        self
    }

    /// Replaces the default teardown entry.
    ///
    /// `function` receives the object being finalized. Afterwards the value
    /// is dropped and the object is invalidated as by the default teardown.
    pub fn with_teardown<Args>(mut self, function: impl HostFunction<Args>) -> Self {
        let custom = Callback::new(function);
        self.descriptor.teardown = Teardown::Custom(Callback::adapted(move |vm: &mut Vm| {
            let result = custom.invoke(vm);
            invalidate(vm, 1);
            result
        }));
        self
    }

    /// Installs no teardown entry. The value is dropped without being
    /// invalidated first when its block is freed.
    pub fn without_finalizer(mut self) -> Self {
        self.descriptor.teardown = Teardown::Disabled;
        self
    }

    /// Allows instances to be written to snapshots. The value is encoded as
    /// `rsn`.
    pub fn with_persistence(mut self) -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        self.descriptor.payload = Some(PayloadCodec {
            encode: encode_payload::<T>,
            decode: decode_payload::<T>,
        });
        self
    }
}

fn encode_payload<T>(data: &(dyn Any + Send)) -> Expected<String>
where
    T: Serialize + 'static,
{
    let value = data
        .downcast_ref::<T>()
        .ok_or_else(|| Error::persistence("opaque payload has an unexpected type"))?;
    Ok(rsn::to_string_pretty(value).to_string())
}

fn decode_payload<T>(text: &str) -> Expected<Box<dyn Any + Send>>
where
    T: DeserializeOwned + Send + 'static,
{
    let value: T = rsn::parser::Config::default()
        .deserialize(text)
        .map_err(|err| Error::persistence(format_args!("invalid opaque payload: {err}")))?;
    Ok(Box::new(value))
}

/// A registered opaque type on one machine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpaqueEntry {
    pub type_id: TypeId,
    pub metatable: ObjectId,
    pub descriptor: &'static OpaqueDescriptor,
}

fn default_teardown(vm: &mut Vm) -> Result<Transfer, Raised> {
    invalidate(vm, 1);
    Ok(Transfer::Return(0))
}

/// Drops the value of the opaque object at `index`, then clears its metadata
/// handle.
fn invalidate(vm: &mut Vm, index: StackIndex) {
    if let Some(Value::Opaque(id)) = vm.get(index).cloned() {
        if let Some(block) = vm.heap.opaque_mut(id) {
            drop(block.data.take());
            block.meta = None;
        }
    }
}

/// Registers `T` on `vm`, creating its metatable.
///
/// Registering the same type again does nothing. Registering a different
/// type under an identity already in use is an error.
pub fn register<T: Opaque>(vm: &mut Vm) -> Expected<()> {
    let descriptor: &'static OpaqueDescriptor = T::opaque_type();
    if let Some(entry) = vm.opaque_types.get(&descriptor.identity) {
        return if entry.type_id == descriptor.type_id {
            Ok(())
        } else {
            Err(Error::runtime(format_args!(
                "opaque type identity `{}` is already registered by {}",
                descriptor.identity, entry.descriptor.type_name
            )))
        };
    }

    let top = vm.top();
    let metatable = match build_metatable(vm, descriptor) {
        Ok(metatable) => metatable,
        Err(err) => {
            vm.set_top(top);
            return Err(err);
        }
    };
    vm.opaque_types.insert(
        descriptor.identity,
        OpaqueEntry {
            type_id: descriptor.type_id,
            metatable,
            descriptor,
        },
    );
    debug!(
        identity = descriptor.identity,
        methods = descriptor.methods.len(),
        "registered opaque type"
    );
    Ok(())
}

fn build_metatable(vm: &mut Vm, descriptor: &OpaqueDescriptor) -> Expected<ObjectId> {
    reserve(vm, StackEstimate::Slots(3))?;
    vm.new_table();
    let Some(Value::Table(metatable)) = vm.get(-1).cloned() else {
        return Err(Error::runtime("metatable was not created"));
    };
    vm.push_string(descriptor.identity);
    vm.set_field(-2, "__name")?;
    vm.new_table();
    for (name, method) in &descriptor.methods {
        vm.push_function(method.clone());
        vm.set_field(-2, name)?;
    }
    vm.set_field(-2, "__index")?;
    if let Some(teardown) = descriptor.teardown() {
        vm.push_function(teardown);
        vm.set_field(-2, "__gc")?;
    }
    vm.pop(1);
    Ok(metatable)
}

pub(crate) fn entry<T: Opaque>(vm: &Vm) -> Expected<OpaqueEntry> {
    let identity = T::opaque_type().identity();
    match vm.opaque_types.get(&identity) {
        Some(entry) if entry.type_id == TypeId::of::<T>() => Ok(*entry),
        _ => Err(Error::runtime(format_args!(
            "opaque type `{identity}` is not registered"
        ))),
    }
}

/// Returns the registered entry whose metatable is `metatable`.
pub(crate) fn entry_by_metatable(vm: &Vm, metatable: ObjectId) -> Option<OpaqueEntry> {
    vm.opaque_types
        .values()
        .find(|entry| entry.metatable == metatable)
        .copied()
}

/// Constructs a new `T` with `init` and pushes it as an opaque object.
///
/// The guest block is allocated before `init` runs and released again if
/// `init` fails.
pub fn construct<T: Opaque>(
    vm: &mut Vm,
    init: impl FnOnce(&mut Vm) -> Expected<T>,
) -> Expected<()> {
    let entry = entry::<T>(vm)?;
    reserve(vm, StackEstimate::Slots(1))?;
    let id = vm.allocate(Object::Opaque(OpaqueBlock {
        data: None,
        meta: None,
    }));
    let value = match init(vm) {
        Ok(value) => value,
        Err(err) => {
            vm.heap.release(id);
            return Err(err);
        }
    };
    let block = vm.heap.opaque_mut(id).ok_or(Error::ObjectCollected)?;
    block.data = Some(Box::new(value));
    block.meta = Some(entry.metatable);
    vm.push_value(Value::Opaque(id));
    Ok(())
}

/// Pushes `value` as a new opaque object.
pub fn push<T: Opaque>(vm: &mut Vm, value: T) -> Expected<()> {
    construct(vm, |_| Ok(value))
}

/// Pushes an opaque object whose payload was decoded from a snapshot.
pub(crate) fn restore_payload(vm: &Vm, identity: &str, payload: &str) -> Expected<OpaqueBlock> {
    let entry = vm
        .opaque_types
        .get(identity)
        .copied()
        .ok_or_else(|| Error::persistence(format_args!("unknown opaque type `{identity}`")))?;
    let codec = entry.descriptor.payload.ok_or_else(|| {
        Error::persistence(format_args!("opaque type `{identity}` is not persistable"))
    })?;
    let data = (codec.decode)(payload)?;
    Ok(OpaqueBlock {
        data: Some(data),
        meta: Some(entry.metatable),
    })
}

/// Returns the identity and encoded payload of the opaque object `id`.
pub(crate) fn snapshot_payload(vm: &Vm, id: ObjectId) -> Expected<(&'static str, String)> {
    let block = vm.heap.opaque(id).ok_or(Error::ObjectCollected)?;
    let (Some(data), Some(meta)) = (&block.data, block.meta) else {
        return Err(Error::persistence("cannot persist a finalized opaque object"));
    };
    let entry = entry_by_metatable(vm, meta)
        .ok_or_else(|| Error::persistence("opaque object has an unregistered type"))?;
    let codec = entry.descriptor.payload.ok_or_else(|| {
        Error::persistence(format_args!(
            "opaque type `{}` is not persistable",
            entry.descriptor.identity
        ))
    })?;
    Ok((entry.descriptor.identity, (codec.encode)(&**data)?))
}

fn matching_block<T: Opaque>(vm: &Vm, id: ObjectId) -> Option<&OpaqueBlock> {
    let entry = vm.opaque_types.get(&T::opaque_type().identity())?;
    if entry.type_id != TypeId::of::<T>() {
        return None;
    }
    let block = vm.heap.opaque(id)?;
    (block.meta == Some(entry.metatable)).then_some(block)
}

/// Returns the `T` at `index`, or `None` if the value there is not a live
/// opaque object of type `T`.
#[must_use]
pub fn test<T: Opaque>(vm: &Vm, index: StackIndex) -> Option<&T> {
    let Some(Value::Opaque(id)) = vm.get(index) else {
        return None;
    };
    matching_block::<T>(vm, *id)?.data.as_ref()?.downcast_ref()
}

/// Returns the `T` at `index` exclusively, or `None` if the value there is
/// not a live opaque object of type `T`.
pub fn test_mut<T: Opaque>(vm: &mut Vm, index: StackIndex) -> Option<&mut T> {
    let Some(Value::Opaque(id)) = vm.get(index).cloned() else {
        return None;
    };
    matching_block::<T>(vm, id)?;
    vm.heap.opaque_mut(id)?.data.as_mut()?.downcast_mut()
}

fn access_error<T: Opaque>(vm: &Vm, value: &Value) -> Error {
    let identity = T::opaque_type().identity();
    match value {
        Value::Opaque(id) => match vm.heap.opaque(*id) {
            None => Error::ObjectCollected,
            Some(block) if block.data.is_none() => Error::runtime(format_args!(
                "expected {identity}, found a finalized object"
            )),
            Some(_) => Error::mismatch(identity, vm.value_type_name(value)),
        },
        other => Error::mismatch(identity, vm.value_type_name(other)),
    }
}

/// Returns the `T` at `index`, or an error naming the expected and actual
/// types.
pub fn check<T: Opaque>(vm: &Vm, index: StackIndex) -> Expected<&T> {
    match test::<T>(vm, index) {
        Some(value) => Ok(value),
        None => Err(access_error::<T>(vm, &vm.value(index))),
    }
}

/// A checked reference to an opaque object of type `T`.
///
/// Reading a handle verifies the type once. The handle does not keep the
/// object alive, so every access checks again that it still exists and has
/// not been finalized.
pub struct Handle<T> {
    id: ObjectId,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.id).finish()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Handle<T>
where
    T: Opaque,
{
    /// Returns the guest value referring to this object.
    #[must_use]
    pub const fn value(&self) -> Value {
        Value::Opaque(self.id)
    }

    /// Returns the object's value.
    pub fn get<'vm>(&self, vm: &'vm Vm) -> Expected<&'vm T> {
        matching_block::<T>(vm, self.id)
            .and_then(|block| block.data.as_ref()?.downcast_ref())
            .ok_or_else(|| access_error::<T>(vm, &self.value()))
    }

    /// Returns the object's value exclusively.
    pub fn get_mut<'vm>(&self, vm: &'vm mut Vm) -> Expected<&'vm mut T> {
        if matching_block::<T>(vm, self.id).is_none() {
            return Err(access_error::<T>(vm, &self.value()));
        }
        vm.heap
            .opaque_mut(self.id)
            .and_then(|block| block.data.as_mut()?.downcast_mut())
            .ok_or(Error::ObjectCollected)
    }
}

impl<T: Opaque> Read for Handle<T> {
    fn read(vm: &mut Vm, index: StackIndex) -> Expected<Self> {
        check::<T>(vm, index)?;
        match vm.get(index) {
            Some(Value::Opaque(id)) => Ok(Self {
                id: *id,
                _type: PhantomData,
            }),
            _ => Err(access_error::<T>(vm, &vm.value(index))),
        }
    }
}

impl<T: Opaque> Push for Handle<T> {
    const ESTIMATE: StackEstimate = StackEstimate::Slots(1);

    fn push(self, vm: &mut Vm) -> Expected<()> {
        self.value().push(vm)
    }
}
