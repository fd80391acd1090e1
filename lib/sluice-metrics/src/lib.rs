//! Metrics helpers.
//!
//! Telemetry is emitted through the `metrics` facade. Nothing here installs a recorder: the host process decides where
//! metrics go, and when no recorder is installed every handle is a no-op.
#![deny(warnings)]
#![deny(missing_docs)]

mod builder;
pub use self::builder::MetricsBuilder;
