//! Error primitives shared across the Sluice crates.
//!
//! Errors with a fixed set of causes are defined with `snafu` next to the code that raises them. Errors that only need
//! to be reported, such as a bolt failing to start or a record failing to publish, travel as a [`GenericError`] with
//! context layered on top.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

/// A type-erased error carrying a chain of causes.
pub type GenericError = anyhow::Error;

/// Creates a [`GenericError`].
///
/// Takes the same arguments as `format!`, or a single value implementing `Display` and `Debug`. An existing error
/// passed in keeps its own source chain.
#[macro_export]
macro_rules! generic_error {
    ($($args:tt)+) => {
        $crate::__private::anyhow!($($args)+)
    };
}

#[doc(hidden)]
pub mod __private {
    pub use anyhow::anyhow;
}

/// Attaches context to the error of a `Result`, turning it into a [`GenericError`].
///
/// This is `anyhow::Context` under another name, so that it can be imported alongside `snafu::ResultExt` without the
/// two `context` methods clashing.
pub trait ErrorContext<T> {
    /// Wraps the error with `context`.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with the context returned by `f`, which is only called if there is an error.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    Self: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}
