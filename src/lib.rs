//! PostgreSQL driver adapter.
//!
//! Executes parameterized SQL on behalf of a query engine and hands back
//! results in a database-neutral shape: column names, one logical type per
//! column and rows of tagged values. Server failures are classified into a
//! fixed [`DriverError`] taxonomy.
//!
//! ```no_run
//! use pg_driver_adapter::{AdapterFactory, AdapterOptions, PoolConfig, PostgresBackend, Query, Queryable};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PoolConfig::parse("postgres://localhost/app")?;
//! let factory = AdapterFactory::from_config(PostgresBackend, config, AdapterOptions::default());
//! let adapter = factory.connect().await?;
//! let rows = adapter.query_raw(&Query::new("SELECT 1 AS one")).await?;
//! assert_eq!(rows.column_names, vec!["one"]);
//! adapter.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{AdapterOptions, ConfigError, PoolConfig, PoolErrorHandler};
pub use db::{
    Adapter, AdapterFactory, Backend, DisposePolicy, Pool, PoolOwnership, PoolSource,
    PostgresBackend, PostgresPool, Queryable, Transaction, TypeParsers,
};
pub use error::{DriverError, DriverResult};
pub use models::{
    ArgType, ColumnType, ConnectionInfo, IsolationLevel, Query, ResultSet, ScalarType,
    TransactionFinalization, TransactionOptions, Value,
};
