//! Turns typed Rust functions into guest-callable callbacks.
//!
//! An adapted function runs in four steps:
//!
//! 1. The combined [`StackEstimate`] of its parameters is reserved. If the
//!    stack cannot grow, the function is not called.
//! 2. Every parameter is read from its 1-based argument position. Reading
//!    continues after a failure so that every successfully read value is
//!    dropped in a predictable order, but only the first failure is kept.
//! 3. If any read failed, that error is reported and the function is not
//!    called. Otherwise the function is invoked with the values moved in.
//! 4. The function's [`Outcome`] is translated in two phases.
//!    [`Verdict::consume`] takes the outcome apart while it is still an owned
//!    value, leaving only a plain [`Verdict`]. [`Verdict::act`] then performs
//!    the transfer, which for errors unwinds the frame. No value with
//!    non-trivial cleanup is alive when the unwinding starts.

use crate::convert::{reserve, Push, PushMany, Read, StackEstimate};
use crate::error::{Error, Expected};
use crate::runtime::function::{Callback, Raised, Transfer};
use crate::vm::Vm;

/// How a host function finished.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Outcome {
    /// Return the top `n` values of the frame.
    Return(usize),
    /// Yield the top `n` values of the frame from the running coroutine.
    Yield(usize),
    /// Raise an error in the guest.
    Error(Error),
}

impl Outcome {
    /// Return no values.
    pub const NONE: Self = Self::Return(0);

    /// Pushes `value` and returns it.
    pub fn value<T: Push>(vm: &mut Vm, value: T) -> Self {
        match reserve(vm, T::ESTIMATE).and_then(|()| value.push(vm)) {
            Ok(()) => Self::Return(1),
            Err(err) => Self::Error(err),
        }
    }

    /// Pushes every value in `values` and returns them.
    pub fn values<T: PushMany>(vm: &mut Vm, values: T) -> Self {
        match reserve(vm, T::ESTIMATE).and_then(|()| values.push_many(vm)) {
            Ok(count) => Self::Return(count),
            Err(err) => Self::Error(err),
        }
    }

    /// Pushes every value in `values` and yields them.
    pub fn yield_values<T: PushMany>(vm: &mut Vm, values: T) -> Self {
        match reserve(vm, T::ESTIMATE).and_then(|()| values.push_many(vm)) {
            Ok(count) => Self::Yield(count),
            Err(err) => Self::Error(err),
        }
    }
}

/// A value a host function can finish with.
pub trait IntoOutcome {
    /// Converts `self` into an [`Outcome`], pushing any returned values.
    fn into_outcome(self, vm: &mut Vm) -> Outcome;
}

impl IntoOutcome for Outcome {
    fn into_outcome(self, _vm: &mut Vm) -> Outcome {
        self
    }
}

impl IntoOutcome for () {
    fn into_outcome(self, _vm: &mut Vm) -> Outcome {
        Outcome::NONE
    }
}

impl IntoOutcome for Expected<Outcome> {
    fn into_outcome(self, _vm: &mut Vm) -> Outcome {
        self.unwrap_or_else(Outcome::Error)
    }
}

impl IntoOutcome for Expected<()> {
    fn into_outcome(self, _vm: &mut Vm) -> Outcome {
        match self {
            Ok(()) => Outcome::NONE,
            Err(err) => Outcome::Error(err),
        }
    }
}

impl<T: Push> IntoOutcome for Expected<T> {
    fn into_outcome(self, vm: &mut Vm) -> Outcome {
        match self {
            Ok(value) => Outcome::value(vm, value),
            Err(err) => Outcome::Error(err),
        }
    }
}

/// The kind of control transfer a [`Verdict`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    /// Return values to the caller.
    Return,
    /// Yield values from the running coroutine.
    Yield,
    /// Raise the error value on top of the stack.
    Error,
}

/// A consumed [`Outcome`]: only the kind of transfer and a value count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Verdict {
    kind: VerdictKind,
    count: usize,
}

impl Verdict {
    /// Consumes `outcome`. Errors are pushed as guest error values and then
    /// dropped, so everything `outcome` owned is released before this returns.
    pub fn consume(vm: &mut Vm, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Return(count) => Self {
                kind: VerdictKind::Return,
                count,
            },
            Outcome::Yield(count) => Self {
                kind: VerdictKind::Yield,
                count,
            },
            Outcome::Error(error) => {
                vm.push_error(&error);
                Self {
                    kind: VerdictKind::Error,
                    count: 1,
                }
            }
        }
    }

    /// Returns the kind of transfer.
    #[must_use]
    pub const fn kind(&self) -> VerdictKind {
        self.kind
    }

    /// Returns the number of values transferred.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Performs the transfer.
    pub fn act(self, vm: &mut Vm) -> Result<Transfer, Raised> {
        match self.kind {
            VerdictKind::Return => Ok(Transfer::Return(self.count)),
            VerdictKind::Yield => Ok(Transfer::Yield(self.count)),
            VerdictKind::Error => Err(vm.raise_error()),
        }
    }
}

/// Keeps the first argument conversion failure.
#[derive(Default)]
pub struct Latch {
    first: Option<Error>,
}

impl Latch {
    /// Reads argument `position`, returning `None` and remembering the error
    /// if it is the first failure.
    pub fn read<T: Read>(&mut self, vm: &mut Vm, position: usize) -> Option<T> {
        match T::read_arg(vm, position) {
            Ok(value) => Some(value),
            Err(err) => {
                if self.first.is_none() {
                    self.first = Some(Error::argument(position, err));
                }
                None
            }
        }
    }

    /// Returns the remembered failure as an outcome.
    pub fn failure(&mut self) -> Outcome {
        Outcome::Error(
            self.first
                .take()
                .unwrap_or_else(|| Error::runtime("argument conversion failed")),
        )
    }
}

fn adapt(
    vm: &mut Vm,
    estimate: StackEstimate,
    body: impl FnOnce(&mut Vm, &mut Latch) -> Outcome,
) -> Result<Transfer, Raised> {
    let outcome = match reserve(vm, estimate) {
        Ok(()) => body(vm, &mut Latch::default()),
        Err(err) => Outcome::Error(err.prepend_context("cannot reserve space for arguments")),
    };
    Verdict::consume(vm, outcome).act(vm)
}

/// A Rust function that can be called by the guest.
///
/// Implemented for functions and closures taking `&mut Vm` followed by up to
/// eight [`Read`] parameters and returning an [`IntoOutcome`].
pub trait HostFunction<Args>: Send + Sync + 'static {
    /// Returns a callback invoking this function.
    fn into_callback(self) -> Callback;
}

impl<F, R> HostFunction<()> for F
where
    F: Fn(&mut Vm) -> R + Send + Sync + 'static,
    R: IntoOutcome,
{
    fn into_callback(self) -> Callback {
        Callback::adapted(move |vm: &mut Vm| {
            adapt(vm, StackEstimate::ZERO, |vm, _| self(vm).into_outcome(vm))
        })
    }
}

macro_rules! impl_host_function {
    ($($arg:ident: $type:ident),+) => {
        impl<F, R, $($type),+> HostFunction<($($type,)+)> for F
        where
            F: Fn(&mut Vm, $($type),+) -> R + Send + Sync + 'static,
            R: IntoOutcome,
            $($type: Read,)+
        {
            fn into_callback(self) -> Callback {
                Callback::adapted(move |vm: &mut Vm| {
                    let estimate = StackEstimate::ZERO $(.add(<$type as Read>::ESTIMATE))+;
                    adapt(vm, estimate, |vm, latch| {
                        let mut position = 0;
                        $(
                            position += 1;
                            let $arg = latch.read::<$type>(vm, position);
                        )+
                        if let ($(Some($arg),)+) = ($($arg,)+) {
                            self(vm, $($arg),+).into_outcome(vm)
                        } else {
                            latch.failure()
                        }
                    })
                })
            }
        }
    };
}

impl_host_function!(a: A);
impl_host_function!(a: A, b: B);
impl_host_function!(a: A, b: B, c: C);
impl_host_function!(a: A, b: B, c: C, d: D);
impl_host_function!(a: A, b: B, c: C, d: D, e: E);
impl_host_function!(a: A, b: B, c: C, d: D, e: E, f: G);
impl_host_function!(a: A, b: B, c: C, d: D, e: E, f: G, g: H);
impl_host_function!(a: A, b: B, c: C, d: D, e: E, f: G, g: H, h: I);

impl Callback {
    /// Returns a callback that converts the guest arguments, calls
    /// `function`, and translates its outcome.
    #[must_use]
    pub fn new<Args, F>(function: F) -> Self
    where
        F: HostFunction<Args>,
    {
        function.into_callback()
    }
}

impl Vm {
    /// Pushes a guest function that calls `function`.
    pub fn push_fn<Args>(&mut self, function: impl HostFunction<Args>) {
        self.push_function(Callback::new(function));
    }

    /// Stores a guest function calling `function` as the global `name`.
    pub fn set_global_fn<Args>(&mut self, name: &str, function: impl HostFunction<Args>) {
        self.push_fn(function);
        self.set_global(name);
    }
}
