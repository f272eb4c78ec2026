//! Outbound contract to the backend connector.
//!
//! The adapter never talks to a wire protocol directly. It drives a [`Pool`]
//! that hands out [`PoolConnection`]s, sends [`StatementSpec`]s and gets
//! [`NativeResult`]s or [`NativeError`]s back. The PostgreSQL implementation
//! lives in [`crate::db::postgres`]; tests plug in an in-memory one.

use crate::config::PoolConfig;
use crate::db::params::WireValue;
use crate::db::parsers::{DecodeError, TypeParsers};
use crate::db::types::NativeType;
use crate::models::Value;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

// =============================================================================
// Native errors
// =============================================================================

/// Error as reported by the connector, before classification.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NativeError {
    /// Error response from the server.
    #[error("{message}")]
    Database {
        /// SQLSTATE
        code: Option<String>,
        message: String,
        constraint: Option<String>,
        table: Option<String>,
        column: Option<String>,
        detail: Option<String>,
    },

    #[error("I/O error: {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timed out waiting for a pooled connection")]
    PoolTimedOut,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl NativeError {
    /// Server error carrying only a SQLSTATE and a message.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code: Some(code.into()),
            message: message.into(),
            constraint: None,
            table: None,
            column: None,
            detail: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<DecodeError> for NativeError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}

// =============================================================================
// Statements and results
// =============================================================================

/// How a statement is sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementMode {
    /// Extended protocol: parse, describe, bind, execute. Binary results.
    Prepared,
    /// Simple protocol: one text message, no parameters. Used for control
    /// statements and scripts.
    Simple,
}

/// One statement handed to the connector.
#[derive(Debug, Clone, Copy)]
pub struct StatementSpec<'a> {
    pub sql: &'a str,
    pub values: &'a [WireValue],
    pub parsers: &'a TypeParsers,
    pub mode: StatementMode,
}

impl<'a> StatementSpec<'a> {
    pub fn prepared(sql: &'a str, values: &'a [WireValue], parsers: &'a TypeParsers) -> Self {
        Self {
            sql,
            values,
            parsers,
            mode: StatementMode::Prepared,
        }
    }

    pub fn simple(sql: &'a str, parsers: &'a TypeParsers) -> Self {
        Self {
            sql,
            values: &[],
            parsers,
            mode: StatementMode::Simple,
        }
    }
}

/// Field description from the server's row description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeField {
    pub name: String,
    pub native_type: NativeType,
}

impl NativeField {
    /// A field whose type is known by OID only.
    pub fn new(name: impl Into<String>, type_oid: u32) -> Self {
        Self {
            name: name.into(),
            native_type: NativeType::from_oid(type_oid),
        }
    }

    pub fn type_oid(&self) -> u32 {
        self.native_type.oid
    }
}

/// Result of one statement, rows already decoded through the parser table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NativeResult {
    pub fields: Vec<NativeField>,
    pub rows: Vec<Vec<Value>>,
    /// Affected rows, when the command tag carries a count.
    pub row_count: Option<u64>,
}

// =============================================================================
// Connector traits
// =============================================================================

/// Callback for errors raised by idle pooled connections.
pub type IdleErrorHandler = Arc<dyn Fn(&NativeError) + Send + Sync>;

/// Handle returned by [`Pool::on_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// A connection checked out of a [`Pool`].
pub trait PoolConnection: Send + 'static {
    fn query(
        &mut self,
        spec: StatementSpec<'_>,
    ) -> impl Future<Output = Result<NativeResult, NativeError>> + Send;
}

/// A pool of backend connections.
pub trait Pool: Clone + Send + Sync + 'static {
    type Connection: PoolConnection;

    /// Check out a connection for exclusive use.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, NativeError>> + Send;

    /// Run one statement on any available connection.
    fn query(
        &self,
        spec: StatementSpec<'_>,
    ) -> impl Future<Output = Result<NativeResult, NativeError>> + Send {
        async move {
            let mut conn = self.connect().await?;
            let result = conn.query(spec).await;
            self.release(conn, result.as_ref().err()).await;
            result
        }
    }

    /// Return a connection. With an error the connection is discarded instead
    /// of being recycled.
    fn release(
        &self,
        conn: Self::Connection,
        error: Option<&NativeError>,
    ) -> impl Future<Output = ()> + Send;

    /// Close every connection. Further `connect` calls fail.
    fn end(&self) -> impl Future<Output = ()> + Send;

    fn is_closed(&self) -> bool;

    /// Register an observer for idle-connection errors.
    fn on_error(&self, handler: IdleErrorHandler) -> ListenerId;

    fn remove_error_listener(&self, id: ListenerId);

    fn config(&self) -> &PoolConfig;
}

/// Creates pools for a given configuration.
pub trait Backend: Send + Sync + 'static {
    type Pool: Pool;

    fn create_pool(&self, config: &PoolConfig) -> Result<Self::Pool, NativeError>;
}

// =============================================================================
// Listener registry
// =============================================================================

/// Idle-error observers shared by connector implementations.
#[derive(Default)]
pub struct IdleErrorListeners {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(ListenerId, IdleErrorHandler)>>,
}

impl std::fmt::Debug for IdleErrorListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleErrorListeners")
            .field("count", &self.len())
            .finish()
    }
}

impl IdleErrorListeners {
    pub fn register(&self, handler: IdleErrorHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        id
    }

    pub fn remove(&self, id: ListenerId) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(listener, _)| *listener != id);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an idle error to every observer. A panicking observer is
    /// logged and skipped.
    pub fn notify(&self, error: &NativeError) {
        let handlers: Vec<IdleErrorHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                warn!(error = %error, "Idle connection error handler panicked");
            }
        }
    }
}
