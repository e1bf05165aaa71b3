//! Standard host libraries for Ferry guest machines.
//!
//! Each library is a [`Feature`](ferry_lang::Feature): it installs itself
//! when a machine is initialized and takes part in snapshots. [`standard`]
//! returns all of them in their canonical order.

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;

#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

use std::io::Write;
use std::sync::Arc;

use ferry_lang::error::{Error, Expected};
use ferry_lang::persist::PersistenceBuilder;
use ferry_lang::Persistence;
use parking_lot::Mutex;

mod base;
mod buffer;
mod generators;
mod library;

pub use base::Base;
pub use buffer::{Buffer, Buffers};
pub use generators::Generators;

#[cfg(test)]
mod tests;

/// Returns the standard features in the order snapshots expect them.
pub fn standard(output: Output) -> PersistenceBuilder {
    Persistence::builder()
        .with_feature(Base::new(output))
        .with_feature(Buffers::new())
        .with_feature(Generators::new())
}

/// Where guest output is written.
///
/// Clones share the same destination.
#[derive(Debug, Clone)]
pub struct Output(Arc<Mutex<Sink>>);

#[derive(Debug)]
enum Sink {
    Stdout,
    Memory(Vec<String>),
}

impl Output {
    /// Returns an output writing to the process's standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self(Arc::new(Mutex::new(Sink::Stdout)))
    }

    /// Returns an output collecting lines in memory.
    #[must_use]
    pub fn memory() -> Self {
        Self(Arc::new(Mutex::new(Sink::Memory(Vec::new()))))
    }

    /// Writes `line` followed by a newline.
    pub fn write_line(&self, line: &str) -> Expected<()> {
        match &mut *self.0.lock() {
            Sink::Stdout => writeln!(std::io::stdout().lock(), "{line}")
                .map_err(|err| Error::runtime(format_args!("cannot write output: {err}"))),
            Sink::Memory(lines) => {
                lines.try_reserve(1)?;
                lines.push(String::from(line));
                Ok(())
            }
        }
    }

    /// Returns and clears the lines collected so far. Outputs writing to
    /// standard output return nothing.
    #[must_use]
    pub fn take_lines(&self) -> Vec<String> {
        match &mut *self.0.lock() {
            Sink::Stdout => Vec::new(),
            Sink::Memory(lines) => std::mem::take(lines),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::stdout()
    }
}
