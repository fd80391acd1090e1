//! A pipeline bolt that publishes records to a message broker.
//!
//! The bolt maps each record to a broker message, submits it through a [`Producer`](producer::Producer), and reports
//! the outcome to the pipeline's [`OutputCollector`](collector::OutputCollector) as an ack or a fail. An in-memory
//! broker is always available; a Kafka client is available behind the `kafka` feature.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod bolt;
pub use self::bolt::{DeliveryMode, ForwardingBolt, ForwardingBoltConfiguration};

pub mod collector;
pub mod delivery;
pub mod mapper;
pub mod producer;
pub mod record;
pub mod serializer;
