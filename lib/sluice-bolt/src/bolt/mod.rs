//! Forwarding bolt.
//!
//! [`ForwardingBolt`] is the terminal stage of a pipeline: it maps each record to a broker message, publishes it, and
//! tells the pipeline whether the record can be considered processed (ack) or must be replayed (fail). How long it
//! waits before doing so depends on its [`DeliveryMode`].

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use sluice_error::{generic_error, ErrorContext as _, GenericError};
use tracing::{debug, error, info, trace, warn};

use crate::{
    collector::OutputCollector,
    delivery::DeliveryOutcome,
    mapper::{FieldMapper, MappingError, TopicSelector},
    producer::{Producer, ProducerFactory, PublishRequest},
    record::Record,
    serializer::SerializerKind,
};

mod config;
pub use self::config::ForwardingBoltConfiguration;

mod telemetry;
use self::telemetry::Telemetry;

#[cfg(test)]
mod tests;

/// When records are acknowledged relative to their delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryMode {
    /// Wait for the delivery outcome before returning from `execute`.
    Sync,

    /// Return from `execute` right away, and ack or fail the record once the outcome arrives.
    Async,

    /// Ack the record as soon as it is submitted. Later delivery failures are only logged.
    FireAndForget,
}

/// Publishes records to a message broker.
pub struct ForwardingBolt {
    component_id: String,
    mode: DeliveryMode,
    mapper: FieldMapper,
    topic_selector: TopicSelector,
    key_serializer: SerializerKind,
    value_serializer: SerializerKind,
    producer: Option<Arc<dyn Producer>>,
    collector: Arc<dyn OutputCollector>,
    close_timeout: Duration,
    telemetry: Telemetry,
}

impl ForwardingBolt {
    /// Prepares a bolt for processing: validates the configuration and connects to the broker.
    ///
    /// # Errors
    ///
    /// If the broker properties are missing or malformed, no topic can ever be determined, or the broker client cannot
    /// be created, an error is returned.
    pub fn prepare<F>(
        config: &ForwardingBoltConfiguration, factory: &F, collector: Arc<dyn OutputCollector>,
    ) -> Result<Self, GenericError>
    where
        F: ProducerFactory + ?Sized,
    {
        let settings = config
            .producer_settings()
            .error_context("Invalid broker properties.")?;

        let mapper = config.mapper().clone();
        let topic_selector = config.topic_selector();
        if !mapper.supplies_topic() && !topic_selector.can_select() {
            return Err(generic_error!(
                "No topic configured. Set a default topic, a topic field, or a mapper that reads topics from records."
            ));
        }

        let mode = config.delivery_mode();
        let producer = factory
            .connect(&settings)
            .error_context("Failed to create broker client.")?;

        info!(
            component_id = config.component_id(),
            ?mode,
            bootstrap_servers = ?settings.bootstrap_servers(),
            "Forwarding bolt prepared."
        );

        Ok(Self {
            component_id: config.component_id().to_string(),
            mode,
            mapper,
            topic_selector,
            key_serializer: settings.key_serializer(),
            value_serializer: settings.value_serializer(),
            producer: Some(producer),
            collector,
            close_timeout: config.close_timeout(),
            telemetry: Telemetry::new(config.component_id()),
        })
    }

    /// Returns the delivery mode.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Processes a single record.
    ///
    /// Every record ends up acked or failed exactly once, either before this method returns or, in asynchronous mode,
    /// later from the broker client's I/O thread. Tick records are acked without being published.
    pub fn execute(&self, record: &Record) {
        if record.is_tick() {
            trace!(record_id = %record.id(), "Acknowledging tick record.");
            self.collector.ack(record);
            self.telemetry.tick_acked();
            return;
        }

        let request = match self.build_request(record) {
            Ok(request) => request,
            Err(e) => {
                self.telemetry.mapping_error();
                let error = GenericError::from(e).context("Failed to map record to broker message.");
                fail_record(&*self.collector, &self.telemetry, record, error);
                return;
            }
        };

        let Some(producer) = &self.producer else {
            self.telemetry.submit_error();
            let error = generic_error!("Broker client has already been closed.");
            fail_record(&*self.collector, &self.telemetry, record, error);
            return;
        };

        let handle = match producer.send(request) {
            Ok(handle) => handle,
            Err(e) => {
                // Nothing has been acked yet, in any mode, so the record can still be replayed.
                self.telemetry.submit_error();
                let error = GenericError::from(e).context("Failed to submit record to broker.");
                fail_record(&*self.collector, &self.telemetry, record, error);
                return;
            }
        };

        match self.mode {
            DeliveryMode::Sync => settle_record(&*self.collector, &self.telemetry, record, handle.wait()),
            DeliveryMode::Async => {
                let collector = Arc::clone(&self.collector);
                let telemetry = self.telemetry.clone();
                let record = record.clone();
                handle.on_complete(move |outcome| {
                    let settled = panic::catch_unwind(AssertUnwindSafe(|| {
                        settle_record(&*collector, &telemetry, &record, outcome)
                    }));
                    if settled.is_err() {
                        error!(record_id = %record.id(), "Output collector panicked while settling record.");
                    }
                });
            }
            DeliveryMode::FireAndForget => {
                let record_id = record.id();
                handle.on_complete(move |outcome| {
                    if let DeliveryOutcome::Failure(e) = outcome {
                        debug!(%record_id, error = %e, "Delivery failed for acknowledged record.");
                    }
                });
                self.collector.ack(record);
                self.telemetry.record_acked();
            }
        }
    }

    fn build_request(&self, record: &Record) -> Result<PublishRequest, MappingError> {
        let mapped = self.mapper.map(record)?;

        let topic = match &mapped.topic {
            Some(topic) => topic.clone(),
            None => self.topic_selector.select(record)?.ok_or(MappingError::NoTopic)?,
        };
        let (key, value) = mapped.serialize(self.key_serializer, self.value_serializer)?;

        Ok(PublishRequest { topic, key, value })
    }

    /// Closes the broker client.
    ///
    /// Outstanding deliveries get up to the configured close timeout to complete. Calling this more than once does
    /// nothing, and records executed afterwards are failed.
    pub fn cleanup(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };

        match producer.close(self.close_timeout) {
            Ok(()) => debug!(component_id = %self.component_id, "Broker client closed."),
            Err(e) => warn!(
                component_id = %self.component_id,
                error = %e,
                "Broker client did not close cleanly."
            ),
        }
    }
}

fn settle_record(collector: &dyn OutputCollector, telemetry: &Telemetry, record: &Record, outcome: DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Success { partition, offset } => {
            trace!(record_id = %record.id(), partition, offset, "Record delivered.");
            collector.ack(record);
            telemetry.record_acked();
        }
        DeliveryOutcome::Failure(e) => {
            telemetry.delivery_error();
            let error = GenericError::from(e).context("Failed to deliver record to broker.");
            fail_record(collector, telemetry, record, error);
        }
    }
}

fn fail_record(collector: &dyn OutputCollector, telemetry: &Telemetry, record: &Record, error: GenericError) {
    debug!(record_id = %record.id(), "Failing record: {:#}", error);
    collector.report_error(&error);
    collector.fail(record);
    telemetry.record_failed();
}
