//! Pipeline records.

use std::{fmt, sync::Arc};

use bytes::Bytes;

/// Source component identifier used by the pipeline runtime for its own internal records.
pub const SYSTEM_COMPONENT_ID: &str = "__system";

/// Stream identifier used by the pipeline runtime for periodic timer records.
pub const SYSTEM_TICK_STREAM_ID: &str = "__tick";

/// Stream identifier used when a component emits without naming a stream.
pub const DEFAULT_STREAM_ID: &str = "default";

/// Identity of a record, as tracked by the pipeline's acknowledgment protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RecordId(u64);

impl RecordId {
    /// Creates a new `RecordId`.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A field value.
///
/// Values are either opaque bytes or one of a handful of native scalar types. Which of them can be published depends
/// on the serializer configured for the key and the value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// An absent value.
    Null,

    /// Opaque bytes.
    Bytes(Bytes),

    /// A UTF-8 string.
    String(String),

    /// A signed integer.
    Integer(i64),

    /// A floating-point number.
    Float(f64),

    /// A boolean.
    Boolean(bool),
}

impl FieldValue {
    /// Returns `true` if this value is [`FieldValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns a short, static name for the value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::String(_) => "string",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Boolean(_) => "boolean",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<Bytes> for FieldValue {
    fn from(value: Bytes) -> Self {
        FieldValue::Bytes(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl<T> From<Option<T>> for FieldValue
where
    T: Into<FieldValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

#[derive(Clone, Debug)]
struct Inner {
    id: RecordId,
    source_component: String,
    source_stream: String,
    fields: Vec<(String, FieldValue)>,
}

/// A record.
///
/// Records are immutable once built, and carry an ordered set of named fields along with the identity the pipeline
/// uses to track acknowledgment. Cloning a record is cheap: clones share the same underlying storage, which lets a
/// record be handed to a completion callback running on another thread.
#[derive(Clone, Debug)]
pub struct Record {
    inner: Arc<Inner>,
}

impl Record {
    /// Creates a new record with the given identity and fields, sourced from an anonymous component's default stream.
    ///
    /// Field order is preserved. If a field name is repeated, lookups return the first occurrence.
    pub fn new<I, N, V>(id: u64, fields: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<FieldValue>,
    {
        Self {
            inner: Arc::new(Inner {
                id: RecordId::new(id),
                source_component: String::new(),
                source_stream: DEFAULT_STREAM_ID.to_string(),
                fields: fields
                    .into_iter()
                    .map(|(name, value)| (name.into(), value.into()))
                    .collect(),
            }),
        }
    }

    /// Creates a timer record, as the pipeline runtime would emit it.
    pub fn tick(id: u64) -> Self {
        Self::new(id, std::iter::empty::<(String, FieldValue)>()).with_source(SYSTEM_COMPONENT_ID, SYSTEM_TICK_STREAM_ID)
    }

    /// Sets the source component and stream of this record.
    pub fn with_source(mut self, component: impl Into<String>, stream: impl Into<String>) -> Self {
        let inner = Arc::make_mut(&mut self.inner);
        inner.source_component = component.into();
        inner.source_stream = stream.into();
        self
    }

    /// Returns the record's identity.
    pub fn id(&self) -> RecordId {
        self.inner.id
    }

    /// Returns the identifier of the component that emitted this record.
    pub fn source_component(&self) -> &str {
        &self.inner.source_component
    }

    /// Returns the identifier of the stream this record was emitted on.
    pub fn source_stream(&self) -> &str {
        &self.inner.source_stream
    }

    /// Returns `true` if this is a framework-internal timer record.
    ///
    /// Tick records are identified by their source alone, never by their payload.
    pub fn is_tick(&self) -> bool {
        self.inner.source_component == SYSTEM_COMPONENT_ID && self.inner.source_stream == SYSTEM_TICK_STREAM_ID
    }

    /// Returns the value of the field with the given name, if present.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.inner
            .fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Returns `true` if the record has a field with the given name.
    pub fn contains_field(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns an iterator over the field names, in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.inner.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.inner.fields.len()
    }

    /// Returns `true` if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.inner.fields.is_empty()
    }
}
