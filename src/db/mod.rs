//! Database adapter layer.
//!
//! - Type mapping from PostgreSQL OIDs to logical column types
//! - Argument coercion and binary result decoding
//! - Error classification
//! - The `Queryable` contract, transactions and the adapter factory
//! - The `sqlx` PostgreSQL connector

pub mod adapter;
pub mod backend;
pub mod errors;
pub mod executor;
pub mod params;
pub mod parsers;
pub mod postgres;
pub mod transaction;
pub mod types;

pub use adapter::{Adapter, AdapterFactory, DisposePolicy, PoolOwnership, PoolSource};
pub use backend::{
    Backend, IdleErrorHandler, IdleErrorListeners, ListenerId, NativeError, NativeField,
    NativeResult, Pool, PoolConnection, StatementMode, StatementSpec,
};
pub use errors::classify;
pub use executor::{PROVIDER, Queryable};
pub use parsers::{BinaryParser, ColumnDecoder, DecodeError, Repr, TypeParsers};
pub use postgres::{PostgresBackend, PostgresConnection, PostgresPool};
pub use transaction::Transaction;
pub use types::{NativeType, TypeKind, column_type, native_column_type};
