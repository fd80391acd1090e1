//! High-level application primitives.
//!
//! This crate provides what a host process needs before it starts feeding records to a bolt, which today is
//! logging initialization.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, initialize_logging_from_configuration};
}
