//! Layered configuration loading.
//!
//! Configuration is assembled from any number of sources (files, inline documents, in-memory values, environment
//! variables) into a single document, which is then either deserialized in one go or kept around as a
//! [`GenericConfiguration`] for keyed lookups.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use sluice_error::GenericError;
use snafu::Snafu;
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// An environment variable prefix was empty.
    #[snafu(display("environment variable prefix cannot be empty"))]
    EmptyPrefix,

    /// A configuration source could not be read or parsed.
    #[snafu(display("failed to load configuration source"))]
    Load {
        /// Underlying error.
        source: GenericError,
    },

    /// A required field was not present.
    #[snafu(display("configuration is missing '{}'. {}", field, help_text))]
    MissingField {
        /// Name of the missing field.
        field: String,

        /// Where the field can be set, including the matching environment variable names, if any were loaded.
        help_text: String,
    },

    /// A field was present but held a value of the wrong type.
    #[snafu(display("configuration field '{}' should be {}, found {}", field, expected_ty, actual_ty))]
    InvalidFieldType {
        /// Dotted path to the field.
        field: String,

        /// Type that was expected.
        expected_ty: String,

        /// Type that was found.
        actual_ty: String,
    },

    /// Any other error raised while extracting a value.
    #[snafu(display("failed to read configuration"))]
    Extract {
        /// Underlying error.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        translate_error(&[], e)
    }
}

/// Builds a configuration document out of several sources.
///
/// Each source is merged in as soon as it is added, and sources added later win over earlier ones when both set the
/// same key. Nested maps are merged key by key, and arrays are concatenated.
pub struct ConfigurationLoader {
    figment: Figment,
    env_prefixes: Vec<String>,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            figment: Figment::new(),
            env_prefixes: Vec::new(),
        }
    }
}

impl ConfigurationLoader {
    fn merge<P: Provider>(mut self, provider: P) -> Self {
        self.figment = self.figment.admerge(provider);
        self
    }

    /// Adds a YAML file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or does not hold valid YAML, an error is returned.
    pub fn from_yaml<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigurationError> {
        let provider = ResolvedProvider::from_yaml(path).map_err(|e| ConfigurationError::Load { source: e.into() })?;
        Ok(self.merge(provider))
    }

    /// Adds a YAML file if it can be loaded, and skips it otherwise.
    pub fn try_from_yaml<P: AsRef<Path>>(self, path: P) -> Self {
        let path = path.as_ref();
        match ResolvedProvider::from_yaml(path) {
            Ok(provider) => self.merge(provider),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable YAML configuration file.");
                self
            }
        }
    }

    /// Adds a JSON file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or does not hold valid JSON, an error is returned.
    pub fn from_json<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigurationError> {
        let provider = ResolvedProvider::from_json(path).map_err(|e| ConfigurationError::Load { source: e.into() })?;
        Ok(self.merge(provider))
    }

    /// Adds a YAML document held in memory.
    ///
    /// # Errors
    ///
    /// If the document is not valid YAML, an error is returned.
    pub fn from_yaml_str(self, contents: &str) -> Result<Self, ConfigurationError> {
        let provider =
            ResolvedProvider::from_yaml_str(contents).map_err(|e| ConfigurationError::Load { source: e.into() })?;
        Ok(self.merge(provider))
    }

    /// Adds any serializable value, such as a `serde_json::Value` or a map handed over by a host process.
    pub fn with_values<T: Serialize>(self, values: T) -> Self {
        self.merge(Serialized::defaults(values))
    }

    /// Adds every environment variable starting with `prefix`.
    ///
    /// The prefix is matched case-insensitively, and an underscore is appended if it does not already end with one:
    /// `sluice` matches `SLUICE_TOPIC`, which sets `topic`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let mut prefix = prefix.to_uppercase();
        if !prefix.ends_with('_') {
            prefix.push('_');
        }

        self.figment = self.figment.admerge(Env::prefixed(&prefix));
        self.env_prefixes.push(prefix);
        Ok(self)
    }

    /// Deserializes the merged document as `T`.
    ///
    /// # Errors
    ///
    /// If the document does not match `T`, an error is returned.
    pub fn into_typed<'a, T: Deserialize<'a>>(self) -> Result<T, ConfigurationError> {
        self.figment
            .extract()
            .map_err(|e| translate_error(&self.env_prefixes, e))
    }

    /// Wraps the merged document for keyed lookups.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Document {
                figment: self.figment,
                env_prefixes: self.env_prefixes,
            }),
        }
    }
}

#[derive(Debug)]
struct Document {
    figment: Figment,
    env_prefixes: Vec<String>,
}

/// A merged configuration document.
///
/// Keys use periods to reach into nested maps (`a.b.c`). Since environment variables cannot nest, a key that is not
/// found that way is also tried with its periods replaced by underscores (`a_b_c`).
///
/// Cloning is cheap, and clones share the same document.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Document>,
}

impl GenericConfiguration {
    fn lookup<'a, T: Deserialize<'a>>(&self, key: &str) -> Result<T, figment::Error> {
        let figment = &self.inner.figment;
        figment.extract_inner(key).or_else(|e| match e.kind {
            Kind::MissingField(_) if key.contains('.') => figment.extract_inner(&key.replace('.', "_")),
            _ => Err(e),
        })
    }

    fn translate(&self, e: figment::Error) -> ConfigurationError {
        translate_error(&self.inner.env_prefixes, e)
    }

    /// Gets the value at `key`.
    ///
    /// # Errors
    ///
    /// If the key is missing, or its value does not match `T`, an error is returned.
    pub fn get_typed<'a, T: Deserialize<'a>>(&self, key: &str) -> Result<T, ConfigurationError> {
        self.lookup(key).map_err(|e| self.translate(e))
    }

    /// Gets the value at `key`, falling back to `T::default()` if it is missing or invalid.
    pub fn get_typed_or_default<'a, T: Default + Deserialize<'a>>(&self, key: &str) -> T {
        self.lookup(key).unwrap_or_default()
    }

    /// Gets the value at `key`, or `None` if it is missing.
    ///
    /// # Errors
    ///
    /// If the value is present but does not match `T`, an error is returned.
    pub fn try_get_typed<'a, T: Deserialize<'a>>(&self, key: &str) -> Result<Option<T>, ConfigurationError> {
        match self.lookup(key) {
            Ok(value) => Ok(Some(value)),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => Ok(None),
            Err(e) => Err(self.translate(e)),
        }
    }

    /// Deserializes the whole document as `T`.
    ///
    /// # Errors
    ///
    /// If the document does not match `T`, an error is returned.
    pub fn as_typed<'a, T: Deserialize<'a>>(&self) -> Result<T, ConfigurationError> {
        self.inner.figment.extract().map_err(|e| self.translate(e))
    }
}

fn translate_error(env_prefixes: &[String], e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let candidates = std::iter::once(format!("`{}`", field))
                .chain(
                    env_prefixes
                        .iter()
                        .map(|prefix| format!("`{}{}`", prefix, field.replace('.', "_").to_uppercase())),
                )
                .collect::<Vec<_>>();

            ConfigurationError::MissingField {
                help_text: format!("Set {} to provide it.", candidates.join(" or ")),
                field: field.into_owned(),
            }
        }
        Kind::InvalidType(actual, expected) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty: expected,
            actual_ty: actual.to_string(),
        },
        _ => ConfigurationError::Extract { source: e.into() },
    }
}
