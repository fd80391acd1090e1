use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use snafu::Snafu;

use crate::serializer::{SerializerKind, UnknownSerializer};

/// Broker connection properties, as passed through from configuration.
pub type BrokerProperties = BTreeMap<String, String>;

const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
const LEGACY_BROKER_LIST: &str = "metadata.broker.list";
const ACKS: &str = "acks";
const LEGACY_ACKS: &str = "request.required.acks";
const LINGER_MS: &str = "linger.ms";
const KEY_SERIALIZER: &str = "key.serializer";
const VALUE_SERIALIZER: &str = "value.serializer";

/// Settings error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SettingsError {
    /// A required property is missing or empty.
    #[snafu(display("missing required broker property '{}'", property))]
    MissingProperty {
        /// Name of the property.
        property: &'static str,
    },

    /// A property has a value that cannot be used.
    #[snafu(display("invalid value '{}' for broker property '{}': {}", value, property, reason))]
    InvalidProperty {
        /// Name of the property.
        property: &'static str,

        /// Value found.
        value: String,

        /// What is wrong with the value.
        reason: &'static str,
    },

    /// A serializer property names an unknown serializer.
    #[snafu(display("invalid value for broker property '{}'", property))]
    InvalidSerializer {
        /// Name of the property.
        property: &'static str,

        /// Error source.
        source: UnknownSerializer,
    },
}

/// A broker address, in `host:port` form.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BrokerAddress {
    host: String,
    port: u16,
}

impl BrokerAddress {
    /// Creates a new `BrokerAddress`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for BrokerAddress {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Accept an optional scheme prefix, such as `PLAINTEXT://`.
        let s = s.split_once("://").map_or(s, |(_, rest)| rest);

        let (host, port) = s.rsplit_once(':').ok_or("expected host:port")?;
        if host.is_empty() {
            return Err("host must not be empty");
        }
        let port = port.parse::<u16>().map_err(|_| "port must be a number between 0 and 65535")?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Number of broker acknowledgments required before a message counts as delivered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RequiredAcks {
    /// No acknowledgment: messages count as delivered once handed to the network.
    None,

    /// Acknowledgment from the partition leader.
    #[default]
    Leader,

    /// Acknowledgment from every in-sync replica.
    All,
}

impl RequiredAcks {
    /// Returns the canonical property value.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredAcks::None => "0",
            RequiredAcks::Leader => "1",
            RequiredAcks::All => "all",
        }
    }
}

impl FromStr for RequiredAcks {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(RequiredAcks::None),
            "1" => Ok(RequiredAcks::Leader),
            "-1" | "all" => Ok(RequiredAcks::All),
            _ => Err("expected one of 0, 1, -1 or all"),
        }
    }
}

/// Validated broker client settings.
///
/// Built from the raw broker properties. The properties themselves are kept as well, so that clients can pass through
/// whatever settings they understand beyond the ones validated here.
#[derive(Clone, Debug)]
pub struct ProducerSettings {
    bootstrap_servers: Vec<BrokerAddress>,
    acks: RequiredAcks,
    linger: Duration,
    key_serializer: SerializerKind,
    value_serializer: SerializerKind,
    properties: BrokerProperties,
}

impl ProducerSettings {
    /// Validates the given broker properties.
    ///
    /// Recognized properties:
    ///
    /// - `bootstrap.servers` (or the older `metadata.broker.list`): comma-separated `host:port` list, required
    /// - `acks` (or the older `request.required.acks`): `0`, `1`, `-1` or `all`, defaults to `1`
    /// - `linger.ms`: non-negative integer, defaults to `0`
    /// - `key.serializer` / `value.serializer`: serializer name, defaults to the string serializer
    ///
    /// # Errors
    ///
    /// If a required property is missing, or a recognized property has an invalid value, an error is returned.
    pub fn from_properties(properties: &BrokerProperties) -> Result<Self, SettingsError> {
        let (servers_property, servers) = lookup_non_blank(properties, BOOTSTRAP_SERVERS, LEGACY_BROKER_LIST)
            .ok_or(SettingsError::MissingProperty {
                property: BOOTSTRAP_SERVERS,
            })?;

        let bootstrap_servers = servers
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry.parse::<BrokerAddress>().map_err(|reason| SettingsError::InvalidProperty {
                    property: servers_property,
                    value: entry.to_string(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if bootstrap_servers.is_empty() {
            return Err(SettingsError::MissingProperty {
                property: servers_property,
            });
        }

        let acks = match lookup(properties, ACKS, LEGACY_ACKS) {
            Some((property, value)) => value.parse::<RequiredAcks>().map_err(|reason| SettingsError::InvalidProperty {
                property,
                value: value.to_string(),
                reason,
            })?,
            None => RequiredAcks::default(),
        };

        let linger = match properties.get(LINGER_MS) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| SettingsError::InvalidProperty {
                    property: LINGER_MS,
                    value: value.clone(),
                    reason: "expected a non-negative integer",
                })?,
            None => Duration::ZERO,
        };

        Ok(Self {
            bootstrap_servers,
            acks,
            linger,
            key_serializer: serializer(properties, KEY_SERIALIZER)?,
            value_serializer: serializer(properties, VALUE_SERIALIZER)?,
            properties: properties.clone(),
        })
    }

    /// Returns the bootstrap servers.
    pub fn bootstrap_servers(&self) -> &[BrokerAddress] {
        &self.bootstrap_servers
    }

    /// Returns the required acknowledgments.
    pub fn acks(&self) -> RequiredAcks {
        self.acks
    }

    /// Returns how long to wait for more messages before sending a batch.
    pub fn linger(&self) -> Duration {
        self.linger
    }

    /// Returns the serializer for message keys.
    pub fn key_serializer(&self) -> SerializerKind {
        self.key_serializer
    }

    /// Returns the serializer for message values.
    pub fn value_serializer(&self) -> SerializerKind {
        self.value_serializer
    }

    /// Returns the raw broker properties.
    pub fn properties(&self) -> &BrokerProperties {
        &self.properties
    }
}

/// Returns the first of `name` and `legacy_name` that is set, as written.
fn lookup<'a>(
    properties: &'a BrokerProperties, name: &'static str, legacy_name: &'static str,
) -> Option<(&'static str, &'a str)> {
    [name, legacy_name]
        .into_iter()
        .find_map(|property| properties.get(property).map(|value| (property, value.as_str())))
}

/// Returns the first of `name` and `legacy_name` that is set to something other than blanks.
fn lookup_non_blank<'a>(
    properties: &'a BrokerProperties, name: &'static str, legacy_name: &'static str,
) -> Option<(&'static str, &'a str)> {
    [name, legacy_name].into_iter().find_map(|property| {
        properties
            .get(property)
            .filter(|value| !value.trim().is_empty())
            .map(|value| (property, value.as_str()))
    })
}

fn serializer(properties: &BrokerProperties, property: &'static str) -> Result<SerializerKind, SettingsError> {
    match properties.get(property) {
        Some(value) => value
            .parse()
            .map_err(|source| SettingsError::InvalidSerializer { property, source }),
        None => Ok(SerializerKind::default()),
    }
}
