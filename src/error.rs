//! Error types for the driver adapter.
//!
//! `DriverError` is the closed taxonomy callers see. Backend-native failures
//! are translated into it by [`crate::db::errors::classify`]; nothing else in
//! the crate constructs a `DriverError` from a connector error.

use serde::Serialize;
use thiserror::Error;

/// Which connection-level failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    /// Host refused or could not be resolved.
    NotReachable,
    /// Connection dropped, pool closed or server shutting down.
    Closed,
    AuthenticationFailed,
    AccessDenied,
    DatabaseDoesNotExist,
    TooManyConnections,
    Tls,
    Protocol,
    /// Malformed connection options.
    Configuration,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotReachable => "not reachable",
            Self::Closed => "closed",
            Self::AuthenticationFailed => "authentication failed",
            Self::AccessDenied => "access denied",
            Self::DatabaseDoesNotExist => "database does not exist",
            Self::TooManyConnections => "too many connections",
            Self::Tls => "tls",
            Self::Protocol => "protocol",
            Self::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

/// The constraint family behind a `ConstraintViolation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unique => write!(f, "unique"),
            Self::ForeignKey => write!(f, "foreign key"),
            Self::NotNull => write!(f, "not null"),
        }
    }
}

/// Backend error payload preserved for diagnostics when no category applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawDriverError {
    /// SQLSTATE, when the backend reported one.
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
}

impl std::fmt::Display for RawDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "error")]
pub enum DriverError {
    #[error("Unsupported native data type: {type_name}")]
    UnsupportedNativeDataType { type_name: String },

    #[error("Connection error ({kind}): {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
    },

    #[error("{kind} constraint violated: {message}")]
    ConstraintViolation {
        kind: ConstraintKind,
        constraint: Option<String>,
        /// Column names, when the backend reports them.
        fields: Vec<String>,
        message: String,
    },

    #[error("Query syntax error: {message}")]
    QuerySyntax { message: String },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Table does not exist: {}", table.as_deref().unwrap_or("<unknown>"))]
    TableDoesNotExist { table: Option<String> },

    #[error("Column not found: {}", column.as_deref().unwrap_or("<unknown>"))]
    ColumnNotFound { column: Option<String> },

    #[error("Database already exists: {}", database.as_deref().unwrap_or("<unknown>"))]
    DatabaseAlreadyExists { database: Option<String> },

    #[error("Transaction write conflict: {message}")]
    TransactionWriteConflict { message: String },

    #[error("Value out of range: {message}")]
    ValueOutOfRange { message: String },

    #[error("Value too long for column {}", column.as_deref().unwrap_or("<unknown>"))]
    LengthMismatch { column: Option<String> },

    #[error("Invalid argument at position {index}: {message}")]
    InvalidArgument { index: usize, message: String },

    #[error("Unknown driver error: {raw}")]
    Unknown { raw: RawDriverError },
}

impl DriverError {
    /// Create an unsupported-type error.
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedNativeDataType {
            type_name: type_name.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(index: usize, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            index,
            message: message.into(),
        }
    }

    /// Create an unknown error carrying the raw backend payload.
    pub fn unknown(code: Option<String>, message: impl Into<String>, detail: Option<String>) -> Self {
        Self::Unknown {
            raw: RawDriverError {
                code,
                message: message.into(),
                detail,
            },
        }
    }

    /// Get an actionable suggestion for this error, if one applies.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::UnsupportedNativeDataType { .. } => {
                Some("Cast the column to a supported type in the query, e.g. `col::text`")
            }
            Self::Connection { kind, .. } => Some(match kind {
                ConnectionErrorKind::NotReachable => {
                    "Check that the database server is running and reachable"
                }
                ConnectionErrorKind::AuthenticationFailed => "Verify the credentials",
                ConnectionErrorKind::AccessDenied => "Grant the user access to the database",
                ConnectionErrorKind::DatabaseDoesNotExist => "Create the database first",
                ConnectionErrorKind::TooManyConnections => {
                    "Lower max_connections or raise the server limit"
                }
                ConnectionErrorKind::Tls => "Verify TLS configuration and certificates",
                ConnectionErrorKind::Configuration => "Check the connection URL format",
                ConnectionErrorKind::Closed | ConnectionErrorKind::Protocol => "Reconnect",
            }),
            Self::QuerySyntax { .. } => Some("Check the SQL syntax"),
            Self::Timeout { .. } => Some("Retry, or increase the pool acquire timeout"),
            Self::TransactionWriteConflict { .. } => Some("Retry the transaction"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::TransactionWriteConflict { .. }
                | Self::Connection {
                    kind: ConnectionErrorKind::Closed
                        | ConnectionErrorKind::NotReachable
                        | ConnectionErrorKind::TooManyConnections,
                    ..
                }
        )
    }
}

/// Result type alias for adapter operations.
pub type DriverResult<T> = Result<T, DriverError>;
