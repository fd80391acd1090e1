//! Field serializers.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use snafu::Snafu;

use crate::record::FieldValue;

/// Serializer error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SerializationError {
    /// The serializer cannot encode the given type of value.
    #[snafu(display("{} serializer cannot encode {} value in field '{}'", serializer, value_type, field))]
    UnsupportedValue {
        /// Serializer that rejected the value.
        serializer: SerializerKind,

        /// Type of the rejected value.
        value_type: &'static str,

        /// Field the value came from.
        field: String,
    },
}

/// Unknown serializer identifier.
#[derive(Debug, Snafu)]
#[snafu(display("unknown serializer '{}'", identifier))]
pub struct UnknownSerializer {
    identifier: String,
}

/// Serializer applied to record keys or values before they are published.
///
/// Both the short names (`string`, `bytes`) and the broker client class names used by JVM deployments
/// (`org.apache.kafka.common.serialization.StringSerializer`, ...) are accepted, so existing broker property sets can be
/// reused unchanged.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SerializerKind {
    /// Encodes strings and scalar values as UTF-8 text.
    #[default]
    String,

    /// Passes opaque bytes through unchanged.
    ByteArray,
}

impl SerializerKind {
    /// Encodes a field value.
    ///
    /// Null values encode to `None`: whether that is acceptable depends on the role of the field.
    ///
    /// # Errors
    ///
    /// If the value's type is not supported by this serializer, an error is returned.
    pub fn serialize(&self, field: &str, value: &FieldValue) -> Result<Option<Bytes>, SerializationError> {
        let encoded = match (self, value) {
            (_, FieldValue::Null) => return Ok(None),
            (SerializerKind::String, FieldValue::String(s)) => Bytes::copy_from_slice(s.as_bytes()),
            (SerializerKind::String, FieldValue::Integer(i)) => Bytes::from(i.to_string()),
            (SerializerKind::String, FieldValue::Float(f)) => Bytes::from(f.to_string()),
            (SerializerKind::String, FieldValue::Boolean(b)) => Bytes::from(b.to_string()),
            (SerializerKind::ByteArray, FieldValue::Bytes(b)) => b.clone(),
            (serializer, value) => {
                return Err(SerializationError::UnsupportedValue {
                    serializer: *serializer,
                    value_type: value.type_name(),
                    field: field.to_string(),
                })
            }
        };

        Ok(Some(encoded))
    }
}

impl FromStr for SerializerKind {
    type Err = UnknownSerializer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "string"
            | "org.apache.kafka.common.serialization.StringSerializer"
            | "kafka.serializer.StringEncoder" => Ok(SerializerKind::String),
            "bytes"
            | "byte_array"
            | "org.apache.kafka.common.serialization.ByteArraySerializer"
            | "kafka.serializer.DefaultEncoder" => Ok(SerializerKind::ByteArray),
            other => Err(UnknownSerializer {
                identifier: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializerKind::String => f.write_str("string"),
            SerializerKind::ByteArray => f.write_str("byte array"),
        }
    }
}
