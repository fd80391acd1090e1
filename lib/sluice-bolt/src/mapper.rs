//! Record-to-message mapping.

use bytes::Bytes;
use serde::Deserialize;
use snafu::Snafu;

use crate::{
    record::{FieldValue, Record},
    serializer::{SerializationError, SerializerKind},
};

const DEFAULT_TOPIC_FIELD: &str = "topic";
const DEFAULT_KEY_FIELD: &str = "key";
const DEFAULT_MESSAGE_FIELD: &str = "message";

fn default_topic_field() -> String {
    DEFAULT_TOPIC_FIELD.to_string()
}

fn default_key_field() -> String {
    DEFAULT_KEY_FIELD.to_string()
}

fn default_message_field() -> String {
    DEFAULT_MESSAGE_FIELD.to_string()
}

/// Mapping error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum MappingError {
    /// The record has no field with the configured message field name.
    #[snafu(display("record has no '{}' field", field))]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// The record's message field is null.
    #[snafu(display("record field '{}' is null", field))]
    NullMessage {
        /// Name of the null field.
        field: String,
    },

    /// The record's topic field is not a usable topic name.
    #[snafu(display("record field '{}' does not hold a topic name (found {} value)", field, value_type))]
    InvalidTopic {
        /// Name of the topic field.
        field: String,

        /// Type of the value found in the field.
        value_type: &'static str,
    },

    /// Neither the record nor the configuration provided a topic.
    #[snafu(display("no topic available for record"))]
    NoTopic,

    /// A field value could not be serialized.
    #[snafu(display("failed to serialize record field"))]
    Serialization {
        /// Error source.
        source: SerializationError,
    },
}

/// Field mapping for the broker message key, value and, optionally, topic.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldMapper {
    /// Reads the key and the value from named fields.
    Fields {
        /// Field holding the message key. Defaults to `key`.
        #[serde(default = "default_key_field")]
        key_field: String,

        /// Field holding the message value. Defaults to `message`.
        #[serde(default = "default_message_field")]
        message_field: String,
    },

    /// Reads the topic, the key and the value from named fields.
    TopicFields {
        /// Field holding the topic name. Defaults to `topic`.
        #[serde(default = "default_topic_field")]
        topic_field: String,

        /// Field holding the message key. Defaults to `key`.
        #[serde(default = "default_key_field")]
        key_field: String,

        /// Field holding the message value. Defaults to `message`.
        #[serde(default = "default_message_field")]
        message_field: String,
    },
}

impl Default for FieldMapper {
    fn default() -> Self {
        FieldMapper::Fields {
            key_field: default_key_field(),
            message_field: default_message_field(),
        }
    }
}

/// A record's fields, located by a [`FieldMapper`] but not yet serialized.
#[derive(Debug)]
pub struct MappedFields<'a> {
    /// Topic read from the record, if the mapper reads topics and the field held one.
    pub topic: Option<String>,

    /// Name of the key field.
    pub key_field: &'a str,

    /// Key value, or `None` if the record has no key.
    pub key: Option<&'a FieldValue>,

    /// Name of the message field.
    pub message_field: &'a str,

    /// Message value.
    pub message: &'a FieldValue,
}

impl MappedFields<'_> {
    /// Serializes the key and the message.
    ///
    /// # Errors
    ///
    /// If either serializer rejects its value, an error is returned.
    pub fn serialize(
        &self, key_serializer: SerializerKind, value_serializer: SerializerKind,
    ) -> Result<(Option<Bytes>, Bytes), MappingError> {
        let key = match self.key {
            Some(key) => key_serializer
                .serialize(self.key_field, key)
                .map_err(|source| MappingError::Serialization { source })?,
            None => None,
        };

        let value = value_serializer
            .serialize(self.message_field, self.message)
            .map_err(|source| MappingError::Serialization { source })?
            .ok_or_else(|| MappingError::NullMessage {
                field: self.message_field.to_string(),
            })?;

        Ok((key, value))
    }
}

impl FieldMapper {
    /// Creates a mapper reading the key and the value from the given fields.
    pub fn fields(key_field: impl Into<String>, message_field: impl Into<String>) -> Self {
        FieldMapper::Fields {
            key_field: key_field.into(),
            message_field: message_field.into(),
        }
    }

    /// Creates a mapper reading the topic, the key and the value from the default `topic`, `key` and `message` fields.
    pub fn topic_fields() -> Self {
        FieldMapper::TopicFields {
            topic_field: default_topic_field(),
            key_field: default_key_field(),
            message_field: default_message_field(),
        }
    }

    /// Returns `true` if this mapper reads topics from records.
    pub fn supplies_topic(&self) -> bool {
        matches!(self, FieldMapper::TopicFields { .. })
    }

    /// Locates the mapped fields in the given record.
    ///
    /// A missing or null key field yields no key. A missing or null topic field yields no topic, leaving the choice to
    /// the configured topic selector.
    ///
    /// # Errors
    ///
    /// If the message field is missing or null, or the topic field holds something other than a string, an error is
    /// returned.
    pub fn map<'a>(&'a self, record: &'a Record) -> Result<MappedFields<'a>, MappingError> {
        let (topic_field, key_field, message_field) = match self {
            FieldMapper::Fields {
                key_field,
                message_field,
            } => (None, key_field, message_field),
            FieldMapper::TopicFields {
                topic_field,
                key_field,
                message_field,
            } => (Some(topic_field), key_field, message_field),
        };

        let message = record.get(message_field).ok_or_else(|| MappingError::MissingField {
            field: message_field.clone(),
        })?;
        if message.is_null() {
            return Err(MappingError::NullMessage {
                field: message_field.clone(),
            });
        }

        let topic = match topic_field {
            Some(field) => topic_from_field(record, field)?,
            None => None,
        };

        Ok(MappedFields {
            topic,
            key_field,
            key: record.get(key_field).filter(|value| !value.is_null()),
            message_field,
            message,
        })
    }
}

fn topic_from_field(record: &Record, field: &str) -> Result<Option<String>, MappingError> {
    match record.get(field) {
        None | Some(FieldValue::Null) => Ok(None),
        Some(FieldValue::String(topic)) if topic.is_empty() => Ok(None),
        Some(FieldValue::String(topic)) => Ok(Some(topic.clone())),
        Some(FieldValue::Bytes(raw)) => match std::str::from_utf8(raw) {
            Ok("") => Ok(None),
            Ok(topic) => Ok(Some(topic.to_string())),
            Err(_) => Err(MappingError::InvalidTopic {
                field: field.to_string(),
                value_type: "non-UTF-8 bytes",
            }),
        },
        Some(other) => Err(MappingError::InvalidTopic {
            field: field.to_string(),
            value_type: other.type_name(),
        }),
    }
}

/// Chooses the topic for records whose mapper did not supply one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TopicSelector {
    /// Every record goes to the same topic, if one is configured.
    Default(Option<String>),

    /// The topic is read from a named field, falling back to a default topic when the field is absent or empty.
    Field {
        /// Field holding the topic name.
        field: String,

        /// Topic used when the field is absent.
        default: Option<String>,
    },
}

impl TopicSelector {
    /// Returns `true` if this selector can produce a topic without looking at the record.
    pub fn has_default(&self) -> bool {
        match self {
            TopicSelector::Default(topic) => topic.is_some(),
            TopicSelector::Field { default, .. } => default.is_some(),
        }
    }

    /// Returns `true` if this selector can produce a topic for at least some records.
    pub fn can_select(&self) -> bool {
        self.has_default() || matches!(self, TopicSelector::Field { .. })
    }

    /// Selects the topic for the given record.
    ///
    /// # Errors
    ///
    /// If the selector field holds something other than a string, an error is returned.
    pub fn select(&self, record: &Record) -> Result<Option<String>, MappingError> {
        match self {
            TopicSelector::Default(topic) => Ok(topic.clone()),
            TopicSelector::Field { field, default } => {
                Ok(topic_from_field(record, field)?.or_else(|| default.clone()))
            }
        }
    }
}
