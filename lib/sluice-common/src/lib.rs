//! Common helpers shared by the Sluice crates.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod deser;
