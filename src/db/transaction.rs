//! Transactions bound to one exclusively owned connection.
//!
//! A [`Transaction`] checks a connection out of the pool in
//! [`Transaction::begin`] and holds it until [`commit`](Transaction::commit) or
//! [`rollback`](Transaction::rollback). The connection lives in a
//! [`ConnectionGuard`], which returns it to the pool exactly once on every
//! path: finalization, a failed `BEGIN`, or the transaction being dropped.

use crate::db::backend::{NativeError, NativeResult, Pool, PoolConnection, StatementSpec};
use crate::db::executor::{Queryable, affected_rows, build_result_set, on_error, prepare_args};
use crate::db::parsers::TypeParsers;
use crate::error::DriverResult;
use crate::models::{
    IsolationLevel, Query, ResultSet, TransactionFinalization, TransactionOptions,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

// =============================================================================
// Connection Guard
// =============================================================================

/// Owns a checked-out connection and releases it at most once.
pub(crate) struct ConnectionGuard<P: Pool> {
    pool: P,
    conn: Option<P::Connection>,
}

impl<P: Pool> ConnectionGuard<P> {
    pub(crate) fn new(pool: P, conn: P::Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn conn_mut(&mut self) -> Result<&mut P::Connection, NativeError> {
        self.conn
            .as_mut()
            .ok_or_else(|| NativeError::other("transaction connection already released"))
    }

    /// Return the connection to the pool. Later calls are no-ops.
    pub(crate) async fn release(&mut self, error: Option<&NativeError>) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, error).await;
        }
    }
}

impl<P: Pool> Drop for ConnectionGuard<P> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        warn!("Transaction dropped while open, discarding its connection");
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let error = NativeError::other("transaction dropped while open");
                    pool.release(conn, Some(&error)).await;
                });
            }
            Err(_) => {
                warn!("No async runtime available, dropping connection without release");
                drop(conn);
            }
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A [`Queryable`] bound to one connection for its whole lifetime.
///
/// Statements issued concurrently on the same transaction are serialized on
/// its connection.
pub struct Transaction<P: Pool> {
    guard: Mutex<ConnectionGuard<P>>,
    options: TransactionOptions,
    parsers: Arc<TypeParsers>,
    finalization: TransactionFinalization,
}

impl<P: Pool> std::fmt::Debug for Transaction<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("options", &self.options)
            .field("finalization", &self.finalization)
            .finish_non_exhaustive()
    }
}

impl<P: Pool> Transaction<P> {
    /// Acquire a connection, send `BEGIN` and the optional isolation level.
    ///
    /// A failure after the connection was acquired releases it, flagged with
    /// the error, before the classified error is returned.
    pub(crate) async fn begin(
        pool: &P,
        isolation_level: Option<IsolationLevel>,
        parsers: Arc<TypeParsers>,
        finalization: TransactionFinalization,
    ) -> DriverResult<Self> {
        const TAG: &str = "start_transaction";

        let conn = pool.connect().await.map_err(|e| on_error(TAG, e))?;
        let mut guard = ConnectionGuard::new(pool.clone(), conn);

        if let Err(e) = Self::send_begin(&mut guard, isolation_level, &parsers).await {
            guard.release(Some(&e)).await;
            return Err(on_error(TAG, e));
        }

        debug!(
            tag = TAG,
            isolation_level = ?isolation_level,
            "Transaction started"
        );

        Ok(Self {
            guard: Mutex::new(guard),
            options: TransactionOptions {
                use_phantom_query: false,
            },
            parsers,
            finalization,
        })
    }

    async fn send_begin(
        guard: &mut ConnectionGuard<P>,
        isolation_level: Option<IsolationLevel>,
        parsers: &TypeParsers,
    ) -> Result<(), NativeError> {
        let conn = guard.conn_mut()?;
        conn.query(StatementSpec::simple("BEGIN", parsers)).await?;
        if let Some(level) = isolation_level {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            conn.query(StatementSpec::simple(&sql, parsers)).await?;
        }
        Ok(())
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Finish the transaction and release its connection.
    pub async fn commit(self) -> DriverResult<()> {
        self.finish("commit", "COMMIT").await
    }

    /// Abandon the transaction and release its connection.
    pub async fn rollback(self) -> DriverResult<()> {
        self.finish("rollback", "ROLLBACK").await
    }

    async fn finish(self, tag: &'static str, statement: &'static str) -> DriverResult<()> {
        let mut guard = self.guard.into_inner();

        let outcome = match self.finalization {
            TransactionFinalization::ReleaseOnly => Ok(()),
            TransactionFinalization::IssueStatements => match guard.conn_mut() {
                Ok(conn) => conn
                    .query(StatementSpec::simple(statement, &self.parsers))
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            },
        };

        guard.release(outcome.as_ref().err()).await;
        debug!(tag, ok = outcome.is_ok(), "Transaction finished");
        outcome.map_err(|e| on_error(tag, e))
    }

    async fn run(&self, tag: &'static str, query: &Query) -> DriverResult<NativeResult> {
        let values = prepare_args(tag, query)?;
        let mut guard = self.guard.lock().await;
        let conn = guard.conn_mut().map_err(|e| on_error(tag, e))?;
        conn.query(StatementSpec::prepared(&query.sql, &values, &self.parsers))
            .await
            .map_err(|e| on_error(tag, e))
    }
}

impl<P: Pool> Queryable for Transaction<P> {
    async fn query_raw(&self, query: &Query) -> DriverResult<ResultSet> {
        let result = self.run("query_raw", query).await?;
        build_result_set(result)
    }

    async fn execute_raw(&self, query: &Query) -> DriverResult<u64> {
        let result = self.run("execute_raw", query).await?;
        Ok(affected_rows(&result))
    }
}
