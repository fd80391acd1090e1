//! Broker clients.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use sluice_error::GenericError;
use snafu::Snafu;

use crate::delivery::DeliveryHandle;

mod settings;
pub use self::settings::{BrokerAddress, BrokerProperties, ProducerSettings, RequiredAcks, SettingsError};

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

/// A message to publish.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishRequest {
    /// Destination topic.
    pub topic: String,

    /// Message key, if any.
    pub key: Option<Bytes>,

    /// Message value.
    pub value: Bytes,
}

/// Producer error.
///
/// These are errors raised while submitting a request, or while flushing or closing the producer. Errors that occur
/// after a request was accepted are reported through its [`DeliveryHandle`] instead.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProducerError {
    /// The broker could not be reached.
    #[snafu(display("broker unavailable: {}", reason))]
    Unavailable {
        /// Why the broker is considered unavailable.
        reason: String,
    },

    /// The producer was closed.
    #[snafu(display("producer is closed"))]
    Closed,

    /// The operation did not complete in time.
    #[snafu(display("timed out after {:?}", timeout))]
    Timeout {
        /// How long the operation waited.
        timeout: Duration,
    },

    /// The underlying broker client reported an error.
    #[snafu(display("broker client error: {}", reason))]
    Client {
        /// Error reported by the client.
        reason: String,
    },
}

/// A broker client.
///
/// Implementations are shared between the thread submitting requests and whatever thread completes their deliveries.
pub trait Producer: Send + Sync {
    /// Submits a request for publishing.
    ///
    /// On success, the returned handle completes once the broker has accepted or refused the message.
    ///
    /// # Errors
    ///
    /// If the request cannot be submitted at all, such as when the broker is unreachable or the producer is closed, an
    /// error is returned.
    fn send(&self, request: PublishRequest) -> Result<DeliveryHandle, ProducerError>;

    /// Waits for every submitted request to complete.
    ///
    /// # Errors
    ///
    /// If the outstanding requests do not complete within `timeout`, an error is returned.
    fn flush(&self, timeout: Duration) -> Result<(), ProducerError>;

    /// Stops accepting requests, completes outstanding ones, and releases the client's resources.
    ///
    /// Closing an already-closed producer does nothing.
    ///
    /// # Errors
    ///
    /// If outstanding requests do not complete within `timeout`, an error is returned. The producer is closed either
    /// way.
    fn close(&self, timeout: Duration) -> Result<(), ProducerError>;
}

/// Creates broker clients.
pub trait ProducerFactory {
    /// Creates a producer from validated settings.
    ///
    /// # Errors
    ///
    /// If the client cannot be created, an error is returned.
    fn connect(&self, settings: &ProducerSettings) -> Result<Arc<dyn Producer>, GenericError>;
}
