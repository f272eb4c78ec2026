//! Adapter and factory.
//!
//! An [`AdapterFactory`] is built from either an existing pool or a
//! [`PoolConfig`]. Each [`Adapter`] it produces records once, at construction,
//! whether it owns its pool, and tears down exactly what it owns on
//! [`Adapter::dispose`].
//!
//! Shadow databases for migration tooling are provisioned with
//! [`AdapterFactory::connect_to_shadow_db`]: the returned adapter drops its
//! database and disposes the bootstrap adapter that created it.

use crate::config::{AdapterOptions, PoolConfig};
use crate::db::backend::{Backend, ListenerId, NativeError, Pool, StatementSpec};
use crate::db::errors::classify;
use crate::db::executor::{Queryable, affected_rows, build_result_set, on_error, prepare_args};
use crate::db::transaction::Transaction;
use crate::error::{ConnectionErrorKind, DriverError, DriverResult};
use crate::models::{ConnectionInfo, IsolationLevel, Query, ResultSet};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Ownership
// =============================================================================

/// What `dispose` does with a pool the adapter did not create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposePolicy {
    /// Only stop observing idle errors.
    Detach,
    /// End the pool.
    End,
}

/// Whether the adapter created its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOwnership {
    Owned,
    Borrowed { dispose: DisposePolicy },
}

enum Teardown<P: Pool> {
    Pool {
        ownership: PoolOwnership,
        listener: ListenerId,
    },
    Shadow {
        database: String,
        listener: ListenerId,
        bootstrap: Box<Adapter<P>>,
    },
}

// =============================================================================
// Adapter
// =============================================================================

/// A [`Queryable`] over a pool, able to open transactions and run scripts.
pub struct Adapter<P: Pool> {
    pool: P,
    ownership: PoolOwnership,
    options: AdapterOptions,
    teardown: Mutex<Option<Teardown<P>>>,
}

impl<P: Pool> std::fmt::Debug for Adapter<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("ownership", &self.ownership)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<P: Pool> Adapter<P> {
    fn new(pool: P, ownership: PoolOwnership, options: AdapterOptions) -> Self {
        let listener = register_error_listener(&pool, &options);
        Self {
            pool,
            ownership,
            options,
            teardown: Mutex::new(Some(Teardown::Pool {
                ownership,
                listener,
            })),
        }
    }

    fn shadow(pool: P, options: AdapterOptions, database: String, bootstrap: Adapter<P>) -> Self {
        let listener = register_error_listener(&pool, &options);
        Self {
            pool,
            ownership: PoolOwnership::Owned,
            options,
            teardown: Mutex::new(Some(Teardown::Shadow {
                database,
                listener,
                bootstrap: Box::new(bootstrap),
            })),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn ownership(&self) -> PoolOwnership {
        self.ownership
    }

    /// Static metadata for migration tooling. No I/O.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            schema_name: self
                .options
                .schema
                .clone()
                .or_else(|| self.pool.config().schema.clone()),
            supports_relation_joins: true,
        }
    }

    /// Open a transaction on a dedicated connection.
    pub async fn start_transaction(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> DriverResult<Transaction<P>> {
        Transaction::begin(
            &self.pool,
            isolation_level,
            Arc::clone(&self.options.type_parsers),
            self.options.finalization,
        )
        .await
    }

    /// Run a `;`-separated script, one statement at a time, stopping at the
    /// first failure.
    ///
    /// The split is naive: a `;` inside a string literal or comment splits the
    /// script there. There is no wrapping transaction, statements that ran
    /// before a failure stay applied.
    pub async fn execute_script(&self, script: &str) -> DriverResult<()> {
        const TAG: &str = "execute_script";

        for statement in split_statements(script) {
            debug!(tag = TAG, sql = %statement, "Executing script statement");
            self.pool
                .query(StatementSpec::simple(
                    statement,
                    &self.options.type_parsers,
                ))
                .await
                .map_err(|e| on_error(TAG, e))?;
        }
        Ok(())
    }

    /// Release what this adapter owns. Calling it again does nothing.
    pub async fn dispose(&self) -> DriverResult<()> {
        let Some(teardown) = self.teardown.lock().await.take() else {
            debug!("Adapter already disposed");
            return Ok(());
        };
        self.run_teardown(teardown).await
    }

    fn run_teardown(&self, teardown: Teardown<P>) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move {
            match teardown {
                Teardown::Pool {
                    ownership,
                    listener,
                } => {
                    self.pool.remove_error_listener(listener);
                    match ownership {
                        PoolOwnership::Owned
                        | PoolOwnership::Borrowed {
                            dispose: DisposePolicy::End,
                        } => {
                            self.pool.end().await;
                            info!(ownership = ?ownership, "Adapter disposed, pool ended");
                        }
                        PoolOwnership::Borrowed {
                            dispose: DisposePolicy::Detach,
                        } => {
                            info!("Adapter disposed, external pool left open");
                        }
                    }
                    Ok(())
                }
                Teardown::Shadow {
                    database,
                    listener,
                    bootstrap,
                } => {
                    self.pool.remove_error_listener(listener);
                    self.pool.end().await;

                    let dropped = bootstrap
                        .execute_script(&format!("DROP DATABASE \"{}\"", database))
                        .await;
                    match &dropped {
                        Ok(()) => info!(database = %database, "Shadow database dropped"),
                        Err(e) => {
                            warn!(database = %database, error = %e, "Failed to drop shadow database")
                        }
                    }

                    let disposed = bootstrap.dispose().await;
                    dropped.and(disposed)
                }
            }
        })
    }
}

impl<P: Pool> Queryable for Adapter<P> {
    async fn query_raw(&self, query: &Query) -> DriverResult<ResultSet> {
        const TAG: &str = "query_raw";
        let values = prepare_args(TAG, query)?;
        let result = self
            .pool
            .query(StatementSpec::prepared(
                &query.sql,
                &values,
                &self.options.type_parsers,
            ))
            .await
            .map_err(|e| on_error(TAG, e))?;
        build_result_set(result)
    }

    async fn execute_raw(&self, query: &Query) -> DriverResult<u64> {
        const TAG: &str = "execute_raw";
        let values = prepare_args(TAG, query)?;
        let result = self
            .pool
            .query(StatementSpec::prepared(
                &query.sql,
                &values,
                &self.options.type_parsers,
            ))
            .await
            .map_err(|e| on_error(TAG, e))?;
        Ok(affected_rows(&result))
    }
}

/// Forward idle-connection errors, classified, to the configured handler.
fn register_error_listener<P: Pool>(pool: &P, options: &AdapterOptions) -> ListenerId {
    let handler = options.on_pool_error.clone();
    pool.on_error(Arc::new(move |error: &NativeError| {
        let classified = classify(error);
        warn!(error = %classified, "Idle connection error");
        if let Some(handler) = &handler {
            handler(&classified);
        }
    }))
}

pub(crate) fn split_statements(script: &str) -> impl Iterator<Item = &str> {
    script.split(';').map(str::trim).filter(|s| !s.is_empty())
}

// =============================================================================
// Factory
// =============================================================================

/// Where the factory's adapters get their pool from.
#[derive(Debug, Clone)]
pub enum PoolSource<P> {
    /// A pool created and managed by the caller.
    External(P),
    Config(PoolConfig),
}

/// Creates [`Adapter`]s.
pub struct AdapterFactory<B: Backend> {
    backend: B,
    source: PoolSource<B::Pool>,
    options: AdapterOptions,
}

impl<B: Backend> AdapterFactory<B> {
    /// Adapters will create and own their pools.
    pub fn from_config(backend: B, config: PoolConfig, options: AdapterOptions) -> Self {
        Self {
            backend,
            source: PoolSource::Config(config),
            options,
        }
    }

    /// Adapters will borrow `pool`. It is only ended on dispose when
    /// `options.dispose_external_pool` is set.
    pub fn from_pool(backend: B, pool: B::Pool, options: AdapterOptions) -> Self {
        Self {
            backend,
            source: PoolSource::External(pool),
            options,
        }
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    pub fn source(&self) -> &PoolSource<B::Pool> {
        &self.source
    }

    /// Create an adapter.
    pub async fn connect(&self) -> DriverResult<Adapter<B::Pool>> {
        let (pool, ownership) = match &self.source {
            PoolSource::External(pool) if !pool.is_closed() => {
                let dispose = if self.options.dispose_external_pool {
                    DisposePolicy::End
                } else {
                    DisposePolicy::Detach
                };
                (pool.clone(), PoolOwnership::Borrowed { dispose })
            }
            PoolSource::External(pool) => {
                info!("External pool is closed, creating a new pool from its configuration");
                (self.create_pool(pool.config())?, PoolOwnership::Owned)
            }
            PoolSource::Config(config) => (self.create_pool(config)?, PoolOwnership::Owned),
        };

        debug!(ownership = ?ownership, "Adapter connected");
        Ok(Adapter::new(pool, ownership, self.options.clone()))
    }

    /// Create a uniquely named database and an adapter pointed at it.
    ///
    /// Disposing the returned adapter closes its pool, drops the database and
    /// disposes the bootstrap adapter used to create it.
    pub async fn connect_to_shadow_db(&self) -> DriverResult<Adapter<B::Pool>> {
        let prefix = &self.options.shadow_database_prefix;
        if !is_plain_identifier(prefix) {
            return Err(DriverError::connection(
                ConnectionErrorKind::Configuration,
                format!(
                    "shadow database prefix '{}' must be at most {} ASCII letters, digits or \
                     underscores",
                    prefix, MAX_SHADOW_PREFIX_LEN
                ),
            ));
        }
        let bootstrap = self.connect().await?;
        let database = format!(
            "{}{}",
            self.options.shadow_database_prefix,
            Uuid::new_v4().simple()
        );

        let config = match bootstrap.pool().config().with_database(&database) {
            Ok(config) => config,
            Err(e) => {
                dispose_quietly(&bootstrap).await;
                return Err(DriverError::connection(
                    ConnectionErrorKind::Configuration,
                    e.to_string(),
                ));
            }
        };

        if let Err(e) = bootstrap
            .execute_script(&format!("CREATE DATABASE \"{}\"", database))
            .await
        {
            dispose_quietly(&bootstrap).await;
            return Err(e);
        }
        info!(database = %database, "Shadow database created");

        let pool = match self.create_pool(&config) {
            Ok(pool) => pool,
            Err(e) => {
                if let Err(drop_err) = bootstrap
                    .execute_script(&format!("DROP DATABASE \"{}\"", database))
                    .await
                {
                    warn!(
                        database = %database,
                        error = %drop_err,
                        "Failed to drop shadow database"
                    );
                }
                dispose_quietly(&bootstrap).await;
                return Err(e);
            }
        };

        Ok(Adapter::shadow(
            pool,
            self.options.clone(),
            database,
            bootstrap,
        ))
    }

    fn create_pool(&self, config: &PoolConfig) -> DriverResult<B::Pool> {
        self.backend
            .create_pool(config)
            .map_err(|e| on_error("connect", e))
    }
}

/// Identifiers are limited to 63 bytes and the generated suffix takes 32.
const MAX_SHADOW_PREFIX_LEN: usize = 31;

/// Usable inside a quoted identifier and a `;`-split script as is.
fn is_plain_identifier(prefix: &str) -> bool {
    prefix.len() <= MAX_SHADOW_PREFIX_LEN
        && prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

async fn dispose_quietly<P: Pool>(adapter: &Adapter<P>) {
    if let Err(e) = adapter.dispose().await {
        warn!(error = %e, "Failed to dispose bootstrap adapter");
    }
}
