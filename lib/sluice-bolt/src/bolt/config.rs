use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use sluice_common::deser::{PermissiveBool, PermissiveString};
use sluice_config::GenericConfiguration;
use sluice_error::GenericError;
use tracing::warn;

use super::{DeliveryMode, ForwardingBolt};
use crate::{
    collector::OutputCollector,
    mapper::{FieldMapper, TopicSelector},
    producer::{BrokerProperties, ProducerFactory, ProducerSettings, SettingsError},
};

const fn default_async() -> bool {
    true
}

const fn default_close_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_component_id() -> String {
    "forwarding_bolt".to_string()
}

/// Forwarding bolt configuration.
///
/// Broker properties are passed through to the broker client, with a handful of them validated up front (see
/// [`ProducerSettings::from_properties`]). Properties set with
/// [`with_producer_properties`](Self::with_producer_properties) take the place of the configured ones entirely.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct ForwardingBoltConfiguration {
    /// Identifier of the bolt, used to tag its telemetry.
    ///
    /// Defaults to `forwarding_bolt`.
    #[serde(default = "default_component_id")]
    component_id: String,

    /// Topic used for records that do not name their own.
    #[serde(default)]
    topic: Option<String>,

    /// Record field naming the topic, consulted when the mapper does not supply one.
    #[serde(default)]
    topic_field: Option<String>,

    /// Broker client properties.
    ///
    /// Values may be given as strings, numbers or booleans.
    #[serde_as(as = "BTreeMap<_, PermissiveString>")]
    #[serde(default, alias = "kafka.broker.properties")]
    broker_properties: BrokerProperties,

    /// Whether to hand outcomes to the collector from the broker client's callback rather than waiting for them.
    ///
    /// Defaults to `true`.
    #[serde_as(as = "PermissiveBool")]
    #[serde(rename = "async", default = "default_async")]
    async_send: bool,

    /// Whether to acknowledge records as soon as they are submitted, ignoring their delivery outcome.
    ///
    /// Only applies when sending asynchronously. Defaults to `false`.
    #[serde_as(as = "PermissiveBool")]
    #[serde(default)]
    fire_and_forget: bool,

    /// How records map to broker messages.
    #[serde(default)]
    mapper: FieldMapper,

    /// How long closing the broker client may take, in seconds. Fractions such as `0.5` are accepted.
    ///
    /// Defaults to 30 seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(rename = "close_timeout_secs", default = "default_close_timeout")]
    close_timeout: Duration,

    #[serde(skip)]
    producer_properties: Option<BrokerProperties>,
}

impl ForwardingBoltConfiguration {
    /// Creates a new `ForwardingBoltConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Sets the component identifier.
    pub fn with_component_id(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = component_id.into();
        self
    }

    /// Sets the default topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Reads the topic from the given record field when the mapper does not supply one.
    pub fn with_topic_field(mut self, field: impl Into<String>) -> Self {
        self.topic_field = Some(field.into());
        self
    }

    /// Sets a single configured broker property.
    pub fn with_broker_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.broker_properties.insert(name.into(), value.into());
        self
    }

    /// Sets the broker properties to use instead of the configured ones.
    pub fn with_producer_properties(mut self, properties: BrokerProperties) -> Self {
        self.producer_properties = Some(properties);
        self
    }

    /// Sets whether records are sent asynchronously.
    pub fn with_async(mut self, async_send: bool) -> Self {
        self.async_send = async_send;
        self
    }

    /// Sets whether records are acknowledged as soon as they are submitted.
    pub fn with_fire_and_forget(mut self, fire_and_forget: bool) -> Self {
        self.fire_and_forget = fire_and_forget;
        self
    }

    /// Sets the field mapper.
    pub fn with_mapper(mut self, mapper: FieldMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Sets how long closing the broker client may take.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Returns the component identifier.
    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Returns the delivery mode implied by the `async` and `fire_and_forget` settings.
    pub fn delivery_mode(&self) -> DeliveryMode {
        match (self.async_send, self.fire_and_forget) {
            (true, true) => DeliveryMode::FireAndForget,
            (true, false) => DeliveryMode::Async,
            (false, fire_and_forget) => {
                if fire_and_forget {
                    warn!(
                        component_id = %self.component_id,
                        "Fire-and-forget only applies to asynchronous sends. Waiting for each delivery instead."
                    );
                }
                DeliveryMode::Sync
            }
        }
    }

    /// Returns the field mapper.
    pub fn mapper(&self) -> &FieldMapper {
        &self.mapper
    }

    /// Returns the topic selector built from the default topic and topic field settings.
    pub fn topic_selector(&self) -> TopicSelector {
        match &self.topic_field {
            Some(field) => TopicSelector::Field {
                field: field.clone(),
                default: self.topic.clone(),
            },
            None => TopicSelector::Default(self.topic.clone()),
        }
    }

    /// Returns the broker properties in effect.
    pub fn broker_properties(&self) -> &BrokerProperties {
        self.producer_properties.as_ref().unwrap_or(&self.broker_properties)
    }

    /// Validates the broker properties in effect.
    ///
    /// # Errors
    ///
    /// If the properties are missing or malformed, an error is returned.
    pub fn producer_settings(&self) -> Result<ProducerSettings, SettingsError> {
        ProducerSettings::from_properties(self.broker_properties())
    }

    /// Returns how long closing the broker client may take.
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Builds a forwarding bolt from this configuration.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the broker client cannot be created, an error is returned.
    pub fn build<F>(&self, factory: &F, collector: Arc<dyn OutputCollector>) -> Result<ForwardingBolt, GenericError>
    where
        F: ProducerFactory + ?Sized,
    {
        ForwardingBolt::prepare(self, factory, collector)
    }
}

impl Default for ForwardingBoltConfiguration {
    fn default() -> Self {
        Self {
            component_id: default_component_id(),
            topic: None,
            topic_field: None,
            broker_properties: BrokerProperties::new(),
            async_send: default_async(),
            fire_and_forget: false,
            mapper: FieldMapper::default(),
            close_timeout: default_close_timeout(),
            producer_properties: None,
        }
    }
}
