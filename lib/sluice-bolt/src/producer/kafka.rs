//! Kafka producer, backed by `librdkafka`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rdkafka::{
    config::{ClientConfig, RDKafkaLogLevel},
    error::KafkaError,
    producer::{BaseRecord, DeliveryResult, Producer as _, ProducerContext, ThreadedProducer},
    util::Timeout,
    ClientContext, Message as _,
};
use sluice_error::{ErrorContext as _, GenericError};
use tracing::{debug, error, info, warn};

use super::{Producer, ProducerError, ProducerFactory, ProducerSettings, PublishRequest};
use crate::delivery::{self, DeliveryError, DeliveryHandle, DeliveryOutcome, DeliveryPromise};

/// Properties understood by JVM broker clients but rejected by `librdkafka`.
const UNSUPPORTED_PROPERTIES: &[&str] = &[
    "key.serializer",
    "value.serializer",
    "serializer.class",
    "key.serializer.class",
    "producer.type",
    "max.block.ms",
    "metadata.fetch.timeout.ms",
];

struct DeliveryContext;

impl ClientContext for DeliveryContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Warning => warn!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => info!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Debug => debug!(facility = fac, "{}", log_message),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!(%error, reason, "Kafka client error.");
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<DeliveryPromise>;

    fn delivery(&self, result: &DeliveryResult<'_>, promise: Self::DeliveryOpaque) {
        let outcome = match result {
            Ok(message) => DeliveryOutcome::Success {
                partition: message.partition(),
                offset: message.offset(),
            },
            Err((error, _)) => DeliveryOutcome::Failure(DeliveryError::Client {
                reason: error.to_string(),
            }),
        };

        promise.complete(outcome);
    }
}

/// Creates producers connected to a Kafka cluster.
#[derive(Clone, Copy, Debug, Default)]
pub struct KafkaProducerFactory;

impl ProducerFactory for KafkaProducerFactory {
    fn connect(&self, settings: &ProducerSettings) -> Result<Arc<dyn Producer>, GenericError> {
        let config = client_config(settings);
        let producer: ThreadedProducer<DeliveryContext> = config
            .create_with_context(DeliveryContext)
            .error_context("Failed to create Kafka producer.")?;

        debug!(bootstrap_servers = ?settings.bootstrap_servers(), "Kafka producer created.");

        Ok(Arc::new(KafkaProducer {
            inner: producer,
            closed: AtomicBool::new(false),
        }))
    }
}

fn client_config(settings: &ProducerSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings.properties() {
        match key.as_str() {
            k if UNSUPPORTED_PROPERTIES.contains(&k) => {}
            "request.required.acks" | "acks" | "bootstrap.servers" | "metadata.broker.list" | "linger.ms" => {}
            _ => {
                config.set(key, value);
            }
        }
    }

    let servers = settings
        .bootstrap_servers()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    config
        .set("bootstrap.servers", servers)
        .set("acks", settings.acks().as_str())
        .set("linger.ms", settings.linger().as_millis().to_string());
    config
}

/// A producer connected to a Kafka cluster.
pub struct KafkaProducer {
    inner: ThreadedProducer<DeliveryContext>,
    closed: AtomicBool,
}

impl Producer for KafkaProducer {
    fn send(&self, request: PublishRequest) -> Result<DeliveryHandle, ProducerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProducerError::Closed);
        }

        let (promise, handle) = delivery::channel();
        let mut record: BaseRecord<'_, [u8], [u8], Box<DeliveryPromise>> =
            BaseRecord::with_opaque_to(&request.topic, Box::new(promise)).payload(&request.value[..]);
        if let Some(key) = &request.key {
            record = record.key(&key[..]);
        }

        // A rejected record hands its promise back to us, and dropping it resolves the handle as abandoned.
        self.inner.send(record).map_err(|(error, _)| match error {
            KafkaError::MessageProduction(code) => ProducerError::Client {
                reason: code.to_string(),
            },
            other => ProducerError::Unavailable {
                reason: other.to_string(),
            },
        })?;

        Ok(handle)
    }

    fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.inner.flush(Timeout::After(timeout)).map_err(|error| match error {
            KafkaError::Flush(_) => ProducerError::Timeout { timeout },
            other => ProducerError::Client {
                reason: other.to_string(),
            },
        })
    }

    fn close(&self, timeout: Duration) -> Result<(), ProducerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.flush(timeout)
    }
}
