//! Deserialization helpers.
//!
//! Configuration reaches us from YAML, JSON, and environment variables, which disagree on how scalars are typed: `linger.ms:
//! 0` is an integer in YAML but `"0"` in the environment. The helpers here accept any scalar form and normalize it. They
//! are meant to be used with the `serde_with` crate.

use std::fmt;

use serde::{
    de::{Error, Unexpected},
    Deserializer,
};
use serde_with::DeserializeAs;

/// A scalar as seen by the deserializer, before normalization.
enum Scalar {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn unexpected(&self) -> Unexpected<'_> {
        match self {
            Scalar::Bool(b) => Unexpected::Bool(*b),
            Scalar::Signed(i) => Unexpected::Signed(*i),
            Scalar::Unsigned(u) => Unexpected::Unsigned(*u),
            Scalar::Float(f) => Unexpected::Float(*f),
            Scalar::Str(s) => Unexpected::Str(s),
        }
    }
}

struct ScalarVisitor;

impl serde::de::Visitor<'_> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a boolean, string, integer, or floating-point number")
    }

    fn visit_bool<E: Error>(self, value: bool) -> Result<Self::Value, E> {
        Ok(Scalar::Bool(value))
    }

    fn visit_i64<E: Error>(self, value: i64) -> Result<Self::Value, E> {
        Ok(Scalar::Signed(value))
    }

    fn visit_u64<E: Error>(self, value: u64) -> Result<Self::Value, E> {
        Ok(Scalar::Unsigned(value))
    }

    fn visit_f64<E: Error>(self, value: f64) -> Result<Self::Value, E> {
        Ok(Scalar::Float(value))
    }

    fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
        Ok(Scalar::Str(value.to_string()))
    }

    fn visit_string<E: Error>(self, value: String) -> Result<Self::Value, E> {
        Ok(Scalar::Str(value))
    }
}

/// Permissively deserializes a boolean.
///
/// Accepted forms:
///
/// - `true` or `false` as a native boolean
/// - `"true"` or `"false"` as a string (case insensitive, surrounding whitespace ignored)
/// - `1` or `0` as an integer (signed, unsigned, or floating point)
pub struct PermissiveBool;

impl<'de> DeserializeAs<'de, bool> for PermissiveBool {
    fn deserialize_as<D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let scalar = deserializer.deserialize_any(ScalarVisitor)?;
        let parsed = match &scalar {
            Scalar::Bool(b) => Some(*b),
            Scalar::Signed(0) | Scalar::Unsigned(0) => Some(false),
            Scalar::Signed(1) | Scalar::Unsigned(1) => Some(true),
            Scalar::Float(f) if *f == 0.0 => Some(false),
            Scalar::Float(f) if *f == 1.0 => Some(true),
            Scalar::Str(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        };

        parsed.ok_or_else(|| D::Error::invalid_value(scalar.unexpected(), &"a boolean, \"true\"/\"false\", or 0/1"))
    }
}

/// Permissively deserializes a string.
///
/// Any scalar is accepted and rendered in its canonical textual form, so `0`, `"0"`, and `0.0` become `"0"`, `"0"`,
/// and `"0"` respectively. Booleans become `"true"` or `"false"`.
pub struct PermissiveString;

impl<'de> DeserializeAs<'de, String> for PermissiveString {
    fn deserialize_as<D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match deserializer.deserialize_any(ScalarVisitor)? {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Signed(i) => i.to_string(),
            Scalar::Unsigned(u) => u.to_string(),
            Scalar::Float(f) if f.fract() == 0.0 && f.is_finite() => format!("{}", f as i64),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => s,
        })
    }
}
