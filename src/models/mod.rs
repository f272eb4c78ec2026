//! Data models for the driver adapter.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod result;

// Re-export commonly used types
pub use connection::{
    ConnectionInfo, IsolationLevel, TransactionFinalization, TransactionOptions,
    UnknownIsolationLevel,
};
pub use query::{ArgType, Query, Value};
pub use result::{ColumnType, ResultSet, ScalarType};
