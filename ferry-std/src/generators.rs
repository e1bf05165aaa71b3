use std::sync::Arc;

use ferry_lang::adapter::Outcome;
use ferry_lang::convert::{reserve, StackEstimate};
use ferry_lang::error::{Error, Expected};
use ferry_lang::runtime::coroutine::CoroutineStatus;
use ferry_lang::vm::Resumed;
use ferry_lang::{Callback, Feature, Permanents, Raised, Transfer, Type, Value, Vm};
use parking_lot::Mutex;

use crate::library::Library;

/// Generators built on guest coroutines, installed as the global `gen`.
///
/// `gen.range(start, stop[, step])` returns a coroutine yielding each integer
/// from `start` up to, but excluding, `stop`. `gen.next(co)` resumes a
/// generator and returns what it yielded, or nothing once it is exhausted.
/// `gen.created()` returns how many generators have been created. That count
/// is captured in snapshots.
pub struct Generators {
    library: Library,
    step: Callback,
    created: Arc<Mutex<i64>>,
}

impl Generators {
    /// Returns the generator library.
    #[must_use]
    pub fn new() -> Self {
        let step = Callback::raw(range_step);
        let created = Arc::new(Mutex::new(0));
        let range = Callback::new({
            let step = step.clone();
            let created = created.clone();
            move |vm: &mut Vm, start: i64, stop: i64, by: Option<i64>| -> Expected<Outcome> {
                let by = by.unwrap_or(1);
                if by == 0 {
                    return Err(Error::runtime("range step cannot be zero"));
                }
                reserve(vm, StackEstimate::Slots(3))?;
                vm.push_int(start);
                vm.push_int(stop);
                vm.push_int(by);
                vm.push_closure(step.clone(), 3);
                vm.new_thread()?;
                *created.lock() += 1;
                Ok(Outcome::Return(1))
            }
        });
        let next = Callback::raw(resume_generator);
        let count = Callback::new({
            let created = created.clone();
            move |_vm: &mut Vm| -> Expected<i64> { Ok(*created.lock()) }
        });
        Self {
            library: Library::new("gen", "ferry.std.gen")
                .with("range", range)
                .with("next", next)
                .with("created", count),
            step,
            created,
        }
    }
}

impl Default for Generators {
    fn default() -> Self {
        Self::new()
    }
}

/// The body and continuation of every range generator. Its upvalues are the
/// next value, the exclusive bound and the step.
fn range_step(vm: &mut Vm) -> Result<Transfer, Raised> {
    let (Value::Int(current), Value::Int(stop), Value::Int(by)) =
        (vm.upvalue(1), vm.upvalue(2), vm.upvalue(3))
    else {
        return Err(vm.raise(&Error::runtime("generator state is corrupt")));
    };
    let finished = if by > 0 {
        current >= stop
    } else {
        current <= stop
    };
    if finished {
        return Ok(Transfer::Return(0));
    }
    if !vm.reserve_stack(1) {
        return Err(vm.raise(&Error::StackExhausted));
    }
    vm.push_int(current.checked_add(by).unwrap_or(stop));
    vm.set_upvalue(1);
    vm.push_current_function();
    if let Err(err) = vm.set_continuation() {
        return Err(vm.raise(&err));
    }
    vm.push_int(current);
    Ok(Transfer::Yield(1))
}

/// Resumes the generator passed as the first argument.
fn resume_generator(vm: &mut Vm) -> Result<Transfer, Raised> {
    if vm.get_type(1) != Type::Thread {
        let err = Error::argument(1, Error::mismatch(Type::Thread, vm.type_name(1)));
        return Err(vm.raise(&err));
    }
    if vm.coroutine_status(1) == Some(CoroutineStatus::Dead) {
        return Ok(Transfer::Return(0));
    }
    let extra = vm.top() - 1;
    vm.pop(extra);
    match vm.resume(1, 0) {
        Resumed::Yield(count) | Resumed::Return(count) => Ok(Transfer::Return(count)),
        Resumed::Error => Err(vm.raise_error()),
    }
}

impl Feature for Generators {
    fn name(&self) -> &'static str {
        "generators"
    }

    fn on_init(&self, vm: &mut Vm) -> Expected<()> {
        self.library.install(vm)
    }

    fn on_register_permanents(&self, vm: &mut Vm, permanents: &mut Permanents) -> Expected<()> {
        permanents.add_callback("gen.step", &self.step)?;
        self.library.register_permanents(vm, permanents)
    }

    fn captures_state(&self) -> bool {
        true
    }

    fn on_capture(&self, _vm: &mut Vm) -> Expected<Value> {
        Ok(Value::Int(*self.created.lock()))
    }

    fn on_restore(&self, _vm: &mut Vm, captured: Value) -> Expected<()> {
        match captured {
            Value::Int(count) => {
                *self.created.lock() = count;
                Ok(())
            }
            other => Err(Error::mismatch(Type::Integer, other.kind())),
        }
    }
}
