//! Moves values, functions and opaque objects between Rust and an embedded
//! guest machine, and snapshots the machine's state.
//!
//! - [`convert`]: checked conversions between Rust values and guest stack
//!   entries.
//! - [`opaque`]: Rust values living inside guest memory.
//! - [`adapter`]: typed Rust functions callable by the guest.
//! - [`lifecycle`]: references that detect when their referent is gone.
//! - [`persist`]: snapshots of a machine that preserve the identity of host
//!   functions and types.

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod adapter;
pub mod convert;
pub mod error;
pub mod lifecycle;
pub mod opaque;
pub mod persist;
pub mod runtime;
pub mod vm;

#[cfg(test)]
mod tests;

pub use adapter::{HostFunction, IntoOutcome, Outcome, Verdict};
pub use convert::{Push, PushMany, Read, StackEstimate};
pub use error::{Error, Expected};
pub use opaque::{Handle, Opaque, OpaqueType};
pub use persist::{Feature, Permanents, Persistence};
pub use runtime::function::{Callback, Raised, Transfer};
pub use runtime::value::{Type, Value};
pub use vm::{StackIndex, Vm};

/// Summarizes an error's kind.
pub trait ErrorKind {
    /// Returns the summary of the error being raised.
    fn kind(&self) -> &'static str;
}
