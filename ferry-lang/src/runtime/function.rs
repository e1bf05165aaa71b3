//! Host callbacks and the guest function objects that wrap them.

use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::runtime::value::Value;
use crate::vm::Vm;

/// A token proving that an error value has been raised on a [`Vm`].
///
/// The only way to obtain one is [`Vm::raise_error`], and the only correct
/// thing to do with one is to return it. Every frame between the raise and the
/// nearest protected call is unwound by returning `Err(Raised)`.
#[must_use = "a raised error must be propagated to the caller"]
#[derive(Debug, PartialEq, Eq)]
pub struct Raised(pub(crate) ());

/// How a host function hands control back to the guest machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Return the top `n` values of the current frame.
    Return(usize),
    /// Suspend the running coroutine, yielding the top `n` values.
    Yield(usize),
}

/// A host function using the guest machine's native calling convention.
///
/// Arguments are read from the current frame's stack positions `1..=top`. The
/// function must leave its results on top of the stack and describe them with
/// the returned [`Transfer`].
pub type RawFunction = fn(&mut Vm) -> Result<Transfer, Raised>;

type AdaptedFunction = dyn Fn(&mut Vm) -> Result<Transfer, Raised> + Send + Sync;

#[derive(Clone)]
enum CallbackKind {
    Raw(RawFunction),
    Adapted(Arc<AdaptedFunction>),
}

/// A host function callable by the guest machine.
///
/// Clones of a callback share one identity. Two callbacks created separately
/// are never the same, even when they wrap the same Rust function. This
/// identity is what persistence records by name.
#[derive(Clone)]
pub struct Callback(Arc<CallbackKind>);

impl Callback {
    /// Returns a callback that invokes `function` directly, with no argument
    /// conversion.
    #[must_use]
    pub fn raw(function: RawFunction) -> Self {
        Self(Arc::new(CallbackKind::Raw(function)))
    }

    /// Returns a callback that invokes an adapted host function.
    ///
    /// Most code should use [`Callback::new`] instead, which converts
    /// arguments and outcomes automatically.
    #[must_use]
    pub fn adapted<F>(function: F) -> Self
    where
        F: Fn(&mut Vm) -> Result<Transfer, Raised> + Send + Sync + 'static,
    {
        Self(Arc::new(CallbackKind::Adapted(Arc::new(function))))
    }

    /// Invokes this callback against the current frame of `vm`.
    pub fn invoke(&self, vm: &mut Vm) -> Result<Transfer, Raised> {
        match &*self.0 {
            CallbackKind::Raw(function) => function(vm),
            CallbackKind::Adapted(function) => function(vm),
        }
    }

    /// Returns true if `self` and `other` are the same callback.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns a value uniquely identifying this callback while it is alive.
    #[must_use]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.0 {
            CallbackKind::Raw(_) => "raw",
            CallbackKind::Adapted(_) => "adapted",
        };
        f.debug_struct("Callback")
            .field("kind", &kind)
            .field("identity", &self.identity())
            .finish()
    }
}

/// A guest function object: a callback plus the upvalues it closes over.
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) callback: Callback,
    pub(crate) upvalues: Vec<Value>,
}

impl Function {
    /// Returns a function without upvalues.
    #[must_use]
    pub fn new(callback: Callback) -> Self {
        Self {
            callback,
            upvalues: Vec::new(),
        }
    }

    /// Returns the callback this function invokes.
    #[must_use]
    pub const fn callback(&self) -> &Callback {
        &self.callback
    }

    /// Returns the values this function closes over.
    #[must_use]
    pub fn upvalues(&self) -> &[Value] {
        &self.upvalues
    }
}
