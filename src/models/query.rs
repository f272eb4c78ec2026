//! Query-related data models.
//!
//! A [`Query`] is what the engine hands to the adapter: SQL text, bind values
//! and the declared type of each bind value.

use crate::models::result::ScalarType;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A host value, used both for bind arguments and for decoded result cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    /// Exact decimal in text form, e.g. `"-12.3400"`.
    Numeric(String),
    Text(String),
    /// Base64 encoded in JSON
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Json(JsonValue),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Numeric(_) => "numeric",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Uuid(_) => "uuid",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::DateTime(_) => "datetime",
            Self::Array(_) => "array",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Declared type of a bind argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArgType {
    Scalar(ScalarType),
    Array(ScalarType),
    /// No hint; the value's own shape decides.
    #[default]
    Unknown,
}

impl ArgType {
    /// The scalar type, or the element type for arrays.
    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            Self::Scalar(t) | Self::Array(t) => Some(*t),
            Self::Unknown => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }
}

/// A parameterized statement. Immutable once handed to the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub sql: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Index-aligned with `args`; missing entries count as `Unknown`.
    #[serde(default)]
    pub arg_types: Vec<ArgType>,
}

impl Query {
    /// Create a query with no arguments.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            arg_types: Vec::new(),
        }
    }

    /// Add an argument with no declared type.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self.arg_types.resize(self.args.len(), ArgType::Unknown);
        self
    }

    /// Add an argument with a declared type.
    pub fn with_typed_arg(mut self, value: impl Into<Value>, arg_type: ArgType) -> Self {
        self.arg_types.resize(self.args.len(), ArgType::Unknown);
        self.args.push(value.into());
        self.arg_types.push(arg_type);
        self
    }

    /// Declared type of argument `index`.
    pub fn arg_type(&self, index: usize) -> ArgType {
        self.arg_types.get(index).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_types() {
        assert!(Value::Null.is_null());
        assert!(!Value::Boolean(true).is_null());
        assert_eq!(Value::Int32(42).type_name(), "int32");
        assert_eq!(Value::from("hello").type_name(), "text");
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }

    #[test]
    fn test_query_builder_aligns_arg_types() {
        let query = Query::new("SELECT $1, $2")
            .with_arg(1)
            .with_typed_arg("aGk=", ArgType::Scalar(ScalarType::Bytes));

        assert_eq!(query.args.len(), 2);
        assert_eq!(query.arg_type(0), ArgType::Unknown);
        assert_eq!(query.arg_type(1), ArgType::Scalar(ScalarType::Bytes));
        assert_eq!(query.arg_type(7), ArgType::Unknown);
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let json = serde_json::to_value(Value::Bytes(b"hi".to_vec())).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "Bytes", "value": "aGk=" }));

        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(back, Value::Bytes(b"hi".to_vec()));
    }

    #[test]
    fn test_query_deserialize_defaults() {
        let query: Query = serde_json::from_str(r#"{ "sql": "BEGIN" }"#).unwrap();
        assert!(query.args.is_empty());
        assert!(query.arg_types.is_empty());
    }

    #[test]
    fn test_arg_type_scalar() {
        assert_eq!(
            ArgType::Array(ScalarType::Int32).scalar(),
            Some(ScalarType::Int32)
        );
        assert!(ArgType::Array(ScalarType::Int32).is_array());
        assert_eq!(ArgType::Unknown.scalar(), None);
    }
}
