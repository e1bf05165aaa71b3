//! Cooperative coroutines.
//!
//! Host functions cannot keep their Rust frame alive across a suspension. A
//! coroutine therefore stores the *next* function to run: initially the body
//! it was created with, and after a yield, the continuation registered by the
//! yielding function through [`Vm::set_continuation`](crate::vm::Vm::set_continuation).
//! Resuming a coroutine that yielded without a continuation finishes it,
//! returning the values passed to that resume.

use crate::runtime::value::Value;

/// The lifecycle state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created or yielded, waiting to be resumed.
    Suspended,
    /// Currently executing.
    Running,
    /// Resumed another coroutine and is waiting for it to yield or finish.
    Normal,
    /// Finished or failed. Dead coroutines cannot be resumed.
    Dead,
}

impl CoroutineStatus {
    /// Returns the name guest code uses for this status.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// A guest coroutine.
#[derive(Debug, Clone)]
pub struct Coroutine {
    pub(crate) status: CoroutineStatus,
    /// The function to run on the next resume. `None` after a yield without a
    /// continuation.
    pub(crate) pending: Option<Value>,
}

impl Coroutine {
    pub(crate) fn new(body: Value) -> Self {
        Self {
            status: CoroutineStatus::Suspended,
            pending: Some(body),
        }
    }

    /// Returns this coroutine's status.
    #[must_use]
    pub const fn status(&self) -> CoroutineStatus {
        self.status
    }

    /// Returns the function the next resume will run.
    #[must_use]
    pub const fn pending(&self) -> Option<&Value> {
        self.pending.as_ref()
    }
}
