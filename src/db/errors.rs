//! Error classification.
//!
//! [`classify`] is the single place where a connector [`NativeError`] becomes a
//! [`DriverError`]. It is total: anything it does not recognise ends up in
//! `DriverError::Unknown` with the raw payload preserved.

use crate::db::backend::NativeError;
use crate::error::{ConnectionErrorKind, ConstraintKind, DriverError, RawDriverError};
use std::io::ErrorKind;

/// Translate a connector error into the public taxonomy.
pub fn classify(error: &NativeError) -> DriverError {
    match error {
        NativeError::Database {
            code,
            message,
            constraint,
            table,
            column,
            detail,
        } => classify_database(
            code.as_deref(),
            message,
            constraint.as_deref(),
            table.as_deref(),
            column.as_deref(),
            detail.as_deref(),
        ),
        NativeError::Io { kind, message } => classify_io(*kind, message),
        NativeError::Tls(message) => DriverError::connection(ConnectionErrorKind::Tls, message),
        NativeError::Protocol(message) => {
            DriverError::connection(ConnectionErrorKind::Protocol, message)
        }
        NativeError::Configuration(message) => {
            DriverError::connection(ConnectionErrorKind::Configuration, message)
        }
        NativeError::PoolTimedOut => {
            DriverError::timeout("timed out waiting for a pooled connection")
        }
        NativeError::PoolClosed => {
            DriverError::connection(ConnectionErrorKind::Closed, "connection pool is closed")
        }
        NativeError::Decode(message) | NativeError::Other(message) => {
            DriverError::unknown(None, message, None)
        }
    }
}

fn classify_io(kind: ErrorKind, message: &str) -> DriverError {
    match kind {
        ErrorKind::ConnectionRefused
        | ErrorKind::NotFound
        | ErrorKind::AddrNotAvailable
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable => {
            DriverError::connection(ConnectionErrorKind::NotReachable, message)
        }
        ErrorKind::TimedOut => DriverError::timeout(message),
        _ => DriverError::connection(ConnectionErrorKind::Closed, message),
    }
}

fn classify_database(
    code: Option<&str>,
    message: &str,
    constraint: Option<&str>,
    table: Option<&str>,
    column: Option<&str>,
    detail: Option<&str>,
) -> DriverError {
    let Some(code) = code else {
        return DriverError::unknown(None, message, detail.map(String::from));
    };

    let violation = |kind: ConstraintKind, fields: Vec<String>| DriverError::ConstraintViolation {
        kind,
        constraint: constraint.map(String::from),
        fields,
        message: message.to_string(),
    };
    let named = |field: Option<&str>| {
        field
            .map(String::from)
            .or_else(|| first_quoted(message))
    };

    match code {
        "23505" => violation(ConstraintKind::Unique, detail.map(key_fields).unwrap_or_default()),
        "23503" => violation(
            ConstraintKind::ForeignKey,
            detail.map(key_fields).unwrap_or_default(),
        ),
        "23502" => violation(ConstraintKind::NotNull, named(column).into_iter().collect()),

        "42601" => DriverError::QuerySyntax {
            message: message.to_string(),
        },
        "42P01" => DriverError::TableDoesNotExist {
            table: named(table),
        },
        "42703" => DriverError::ColumnNotFound {
            column: column
                .map(String::from)
                .or_else(|| first_quoted(message))
                .or_else(|| unquoted_column(message)),
        },
        "42P04" => DriverError::DatabaseAlreadyExists {
            database: first_quoted(message),
        },

        "22001" => DriverError::LengthMismatch {
            column: column.map(String::from),
        },
        "22003" => DriverError::ValueOutOfRange {
            message: message.to_string(),
        },

        "40001" | "40P01" => DriverError::TransactionWriteConflict {
            message: message.to_string(),
        },
        "57014" => DriverError::timeout(message),

        "3D000" => DriverError::connection(ConnectionErrorKind::DatabaseDoesNotExist, message),
        "28000" => DriverError::connection(ConnectionErrorKind::AccessDenied, message),
        "28P01" => DriverError::connection(ConnectionErrorKind::AuthenticationFailed, message),
        "53300" => DriverError::connection(ConnectionErrorKind::TooManyConnections, message),
        "57P01" | "57P02" | "57P03" => {
            DriverError::connection(ConnectionErrorKind::Closed, message)
        }
        c if c.starts_with("08") => DriverError::connection(ConnectionErrorKind::Closed, message),

        _ => DriverError::Unknown {
            raw: RawDriverError {
                code: Some(code.to_string()),
                message: message.to_string(),
                detail: detail.map(String::from),
            },
        },
    }
}

/// First double-quoted identifier in a server message.
fn first_quoted(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(message[start..start + len].to_string())
}

/// `column t.foo does not exist` reports the column unquoted.
fn unquoted_column(message: &str) -> Option<String> {
    let rest = message.strip_prefix("column ")?;
    let name = rest.strip_suffix(" does not exist")?;
    Some(name.rsplit('.').next().unwrap_or(name).to_string())
}

/// Column list from a key detail: `Key (a, b)=(1, 2) already exists.`
fn key_fields(detail: &str) -> Vec<String> {
    let Some(rest) = detail.strip_prefix("Key (") else {
        return Vec::new();
    };
    let Some(end) = rest.find(")=(") else {
        return Vec::new();
    };
    rest[..end]
        .split(',')
        .map(|f| f.trim().trim_matches('"').to_string())
        .filter(|f| !f.is_empty())
        .collect()
}
