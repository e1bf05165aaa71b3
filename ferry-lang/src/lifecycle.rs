//! Lifetime-checked references between host objects and guest machines.
//!
//! [`Master`] and [`Weak`] share a control block. The master is the single
//! owner-side reference: dropping it clears the payload, and every observer
//! sees that the next time it calls [`Weak::lock`]. The control block itself
//! is reference counted, so it is freed by whichever side lets go last.
//!
//! [`FunctionRef`] and [`CoroutineRef`] build on this to let host code hold
//! guest values without keeping them, or their machine, alive.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::convert::{reserve, PushMany, Read, StackEstimate};
use crate::error::{Error, Expected};
use crate::runtime::coroutine::CoroutineStatus;
use crate::runtime::value::{ObjectId, Type, Value};
use crate::vm::{Resumed, StackIndex, Status, Vm, VmId};

type ControlBlock<T> = Arc<Mutex<Option<T>>>;

/// The owner-side reference to a shared control block.
///
/// The payload is a small note about the referent, such as an id, rather
/// than the referent itself. Exactly one master exists per control block.
#[derive(Debug)]
pub struct Master<T> {
    shared: ControlBlock<T>,
}

impl<T> Master<T> {
    /// Returns a master noting `payload`.
    pub fn new(payload: T) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Some(payload))),
        }
    }

    /// Returns a new observer of this master.
    #[must_use]
    pub fn observe(&self) -> Weak<T> {
        Weak {
            shared: Some(self.shared.clone()),
        }
    }

    /// Returns the number of observers that have not yet detached.
    #[must_use]
    pub fn observers(&self) -> usize {
        Arc::strong_count(&self.shared) - 1
    }
}

impl<T> Drop for Master<T> {
    fn drop(&mut self) {
        *self.shared.lock() = None;
    }
}

/// An observer of a [`Master`].
#[derive(Debug)]
pub struct Weak<T> {
    shared: Option<ControlBlock<T>>,
}

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> From<&Master<T>> for Weak<T> {
    fn from(master: &Master<T>) -> Self {
        master.observe()
    }
}

impl<T> Weak<T> {
    /// Returns an observer that is already detached.
    #[must_use]
    pub const fn detached() -> Self {
        Self { shared: None }
    }

    /// Returns a copy of the payload if the master is still alive.
    ///
    /// The payload is read under a single lock. The first call that finds
    /// the master gone releases this observer's hold on the control block.
    /// Every later call returns `None` without touching shared state.
    pub fn lock(&mut self) -> Option<T>
    where
        T: Clone,
    {
        let payload = self.shared.as_ref()?.lock().clone();
        if payload.is_none() {
            self.shared = None;
        }
        payload
    }

    /// Returns true if this observer has released its control block.
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.shared.is_none()
    }
}

/// A handle to a [`Vm`] that does not keep it alive.
#[derive(Debug, Clone)]
pub struct VmHandle(Weak<VmId>);

impl VmHandle {
    pub(crate) fn new(master: &Master<VmId>) -> Self {
        Self(master.observe())
    }

    /// Returns true if the machine still exists.
    pub fn is_alive(&mut self) -> bool {
        self.0.lock().is_some()
    }

    /// Returns true if the machine still exists and is `vm`.
    pub fn refers_to(&mut self, vm: &Vm) -> bool {
        self.0.lock().map_or(false, |id| id == vm.id())
    }

    /// Returns [`Error::VmUnreachable`] unless this handle refers to `vm`.
    pub fn check(&mut self, vm: &Vm) -> Expected<()> {
        if self.refers_to(vm) {
            Ok(())
        } else {
            Err(Error::VmUnreachable)
        }
    }
}

/// A host-held reference to a guest function.
///
/// The reference does not keep the function alive. Store the function in the
/// registry or globals to do that.
#[derive(Debug, Clone)]
pub struct FunctionRef {
    vm: VmHandle,
    id: ObjectId,
}

impl FunctionRef {
    /// Returns a reference to the function at `index`.
    pub fn new(vm: &Vm, index: StackIndex) -> Expected<Self> {
        match vm.get(index) {
            Some(Value::Function(id)) => Ok(Self {
                vm: vm.handle(),
                id: *id,
            }),
            _ => Err(Error::mismatch(Type::Function, vm.type_name(index))),
        }
    }

    fn check(&mut self, vm: &Vm) -> Expected<()> {
        self.vm.check(vm)?;
        if vm.heap.function(self.id).is_some() {
            Ok(())
        } else {
            Err(Error::ObjectCollected)
        }
    }

    /// Pushes the referenced function.
    pub fn push(&mut self, vm: &mut Vm) -> Expected<()> {
        self.check(vm)?;
        reserve(vm, StackEstimate::Slots(1))?;
        vm.push_value(Value::Function(self.id));
        Ok(())
    }

    /// Calls the referenced function with `args`, returning its first result.
    ///
    /// Errors raised by the function are returned as [`Error`]s.
    pub fn call<A, R>(&mut self, vm: &mut Vm, args: A) -> Expected<R>
    where
        A: PushMany,
        R: Read,
    {
        self.check(vm)?;
        let id = self.id;
        vm.balanced(|vm| {
            let top = vm.top();
            reserve(
                vm,
                StackEstimate::Slots(1)
                    .add(A::ESTIMATE)
                    .max(R::ESTIMATE.plus(1)),
            )?;
            vm.push_value(Value::Function(id));
            let nargs = match args.push_many(vm) {
                Ok(nargs) => nargs,
                Err(err) => {
                    vm.set_top(top);
                    return Err(err);
                }
            };
            match vm.protected_call(nargs, 1) {
                Status::Ok => {
                    let result = R::read(vm, -1);
                    vm.pop(1);
                    result
                }
                Status::Error => {
                    let error = vm.pop_value();
                    Err(Error::runtime(vm.display(&error)))
                }
            }
        })
    }
}

/// One step of a coroutine driven through a [`CoroutineRef`].
#[derive(Debug, Clone, PartialEq)]
pub enum Step<R> {
    /// The coroutine yielded this value and can be resumed again.
    Yielded(R),
    /// The coroutine finished, returning this value.
    Finished(R),
}

/// A host-held reference to a guest coroutine.
#[derive(Debug, Clone)]
pub struct CoroutineRef {
    vm: VmHandle,
    id: ObjectId,
}

impl CoroutineRef {
    /// Returns a reference to the coroutine at `index`.
    pub fn new(vm: &Vm, index: StackIndex) -> Expected<Self> {
        match vm.get(index) {
            Some(Value::Thread(id)) => Ok(Self {
                vm: vm.handle(),
                id: *id,
            }),
            _ => Err(Error::mismatch(Type::Thread, vm.type_name(index))),
        }
    }

    /// Returns the status of the coroutine, or `None` if it was collected or
    /// belongs to another machine.
    pub fn status(&mut self, vm: &Vm) -> Option<CoroutineStatus> {
        if !self.vm.refers_to(vm) {
            return None;
        }
        vm.heap.coroutine(self.id).map(|coroutine| coroutine.status())
    }

    /// Resumes the coroutine with `args`, returning the first value it yields
    /// or returns.
    ///
    /// Returns [`Error::VmUnreachable`] if the machine is gone or is not
    /// `vm`, and [`Error::ExpiredCoroutine`] if the coroutine finished or was
    /// collected.
    pub fn resume<A, R>(&mut self, vm: &mut Vm, args: A) -> Expected<Step<R>>
    where
        A: PushMany,
        R: Read,
    {
        self.vm.check(vm)?;
        match vm.heap.coroutine(self.id) {
            Some(coroutine) if coroutine.status() != CoroutineStatus::Dead => {}
            _ => return Err(Error::ExpiredCoroutine),
        }
        let id = self.id;
        vm.balanced(|vm| {
            let top = vm.top();
            reserve(
                vm,
                StackEstimate::Slots(1)
                    .add(A::ESTIMATE)
                    .max(R::ESTIMATE.plus(1)),
            )?;
            vm.push_value(Value::Thread(id));
            let nargs = match args.push_many(vm) {
                Ok(nargs) => nargs,
                Err(err) => {
                    vm.set_top(top);
                    return Err(err);
                }
            };
            let result = match vm.resume(-1 - StackIndex::try_from(nargs).unwrap_or(0), nargs) {
                Resumed::Yield(count) => read_first(vm, count).map(Step::Yielded),
                Resumed::Return(count) => read_first(vm, count).map(Step::Finished),
                Resumed::Error => {
                    let error = vm.value(-1);
                    Err(Error::runtime(vm.display(&error)))
                }
            };
            vm.set_top(top);
            result
        })
    }
}

fn read_first<R: Read>(vm: &mut Vm, count: usize) -> Expected<R> {
    if count == 0 {
        vm.push_nil();
        let result = R::read(vm, -1);
        vm.pop(1);
        return result;
    }
    let first = vm.absolute(-StackIndex::try_from(count).map_err(|_| Error::StackExhausted)?);
    R::read(vm, first)
}
