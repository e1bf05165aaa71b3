//! The error value shared by every conversion, call, and persistence
//! operation.
//!
//! Building an [`Error`] never fails from the caller's point of view. Dynamic
//! messages are formatted into a buffer whose growth is checked with
//! [`String::try_reserve`]; when the buffer cannot grow, the error degrades to
//! [`Error::OutOfMemory`] instead of raising a second failure.

use std::borrow::Cow;
use std::fmt::{self, Display, Write};

use crate::ErrorKind;

/// A value or a diagnostic.
pub type Expected<T> = Result<T, Error>;

/// A diagnostic raised while moving values between the host and a guest
/// machine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An allocation failed.
    OutOfMemory,
    /// A handle referred to a virtual machine that no longer exists, or to a
    /// different virtual machine than the one provided.
    VmUnreachable,
    /// A coroutine was resumed after it finished or was collected.
    ExpiredCoroutine,
    /// Persistence was used on a virtual machine that was never initialized.
    Uninitialized,
    /// The guest stack could not grow to hold the values an operation needs.
    StackExhausted,
    /// A reference outlived the guest object it pointed to.
    ObjectCollected,
    /// A dynamically built diagnostic.
    Message {
        /// The category of the failure.
        category: Category,
        /// The human readable message. Context lines are prepended as the
        /// error propagates.
        message: String,
    },
}

/// The broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// A value could not be converted between the host and the guest.
    Conversion,
    /// A resource such as memory or stack space was exhausted.
    Resource,
    /// A referent was no longer alive.
    Lifetime,
    /// A snapshot could not be produced or restored.
    Persistence,
    /// An error raised by guest code or a host function.
    Runtime,
}

impl Category {
    /// Returns the lowercase name of this category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Conversion => "conversion",
            Category::Resource => "resource",
            Category::Lifetime => "lifetime",
            Category::Persistence => "persistence",
            Category::Runtime => "runtime",
        }
    }
}

impl Error {
    /// Returns an error with a formatted message.
    ///
    /// If the message cannot be allocated, [`Error::OutOfMemory`] is returned.
    #[must_use]
    pub fn new(category: Category, message: impl Display) -> Self {
        match format_fallible(format_args!("{message}")) {
            Some(message) => Self::Message { category, message },
            None => Self::OutOfMemory,
        }
    }

    /// Returns a conversion error with a formatted message.
    #[must_use]
    pub fn conversion(message: impl Display) -> Self {
        Self::new(Category::Conversion, message)
    }

    /// Returns a runtime error with a formatted message.
    #[must_use]
    pub fn runtime(message: impl Display) -> Self {
        Self::new(Category::Runtime, message)
    }

    /// Returns a persistence error with a formatted message.
    #[must_use]
    pub fn persistence(message: impl Display) -> Self {
        Self::new(Category::Persistence, message)
    }

    /// Returns an error describing a guest value of type `found` where a value
    /// of type `expected` was required.
    #[must_use]
    pub fn mismatch(expected: impl Display, found: impl Display) -> Self {
        Self::conversion(format_args!("expected {expected}, found {found}"))
    }

    /// Returns this error's category.
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Error::OutOfMemory | Error::StackExhausted => Category::Resource,
            Error::VmUnreachable | Error::ExpiredCoroutine | Error::ObjectCollected => {
                Category::Lifetime
            }
            Error::Uninitialized => Category::Persistence,
            Error::Message { category, .. } => *category,
        }
    }

    /// Returns the message this error displays.
    #[must_use]
    pub fn message(&self) -> Cow<'_, str> {
        match self {
            Error::Message { message, .. } => Cow::Borrowed(message),
            canonical => Cow::Borrowed(canonical.canonical_message()),
        }
    }

    fn canonical_message(&self) -> &'static str {
        match self {
            Error::OutOfMemory => "not enough memory",
            Error::VmUnreachable => "cannot reach the virtual machine",
            Error::ExpiredCoroutine => "the coroutine has expired",
            Error::Uninitialized => "persistence was not initialized for this virtual machine",
            Error::StackExhausted => "guest stack exhausted",
            Error::ObjectCollected => "the object has been collected",
            Error::Message { .. } => "",
        }
    }

    /// Adds `context` as a new first line of this error's message.
    ///
    /// Canonical errors become messages of the same category, except
    /// [`Error::OutOfMemory`], which is returned unchanged. If the new message
    /// cannot be allocated, `self` is returned unchanged so that a meaningful
    /// message is never replaced by a degraded one.
    #[must_use]
    pub fn prepend_context(self, context: impl Display) -> Self {
        if self == Error::OutOfMemory {
            return self;
        }
        let category = self.category();
        match format_fallible(format_args!("{context}\n{}", self.message())) {
            Some(message) => Self::Message { category, message },
            None => self,
        }
    }

    /// Returns an error reporting that argument `position` of a host function
    /// could not be read.
    #[must_use]
    pub fn argument(position: usize, cause: Error) -> Self {
        if cause == Error::OutOfMemory {
            return cause;
        }
        let category = cause.category();
        match format_fallible(format_args!(
            "bad argument #{position}: {}",
            cause.message()
        )) {
            Some(message) => Self::Message { category, message },
            None => cause,
        }
    }
}

impl ErrorKind for Error {
    fn kind(&self) -> &'static str {
        self.category().as_str()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for Error {}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Formats `args` into a new string, returning `None` if the string could not
/// grow to hold the result.
pub(crate) fn format_fallible(args: fmt::Arguments<'_>) -> Option<String> {
    let mut out = FallibleString(String::new());
    out.write_fmt(args).ok()?;
    Some(out.0)
}

struct FallibleString(String);

impl Write for FallibleString {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.try_reserve(s.len()).map_err(|_| fmt::Error)?;
        self.0.push_str(s);
        Ok(())
    }
}
