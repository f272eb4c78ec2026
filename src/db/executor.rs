//! Query execution contract.
//!
//! [`Queryable`] is what the engine talks to, implemented by both
//! [`Adapter`](crate::db::adapter::Adapter) (pooled connections) and
//! [`Transaction`](crate::db::transaction::Transaction) (one owned connection).
//! The helpers here keep the two implementations identical in how they coerce
//! arguments, build result sets and classify failures.

use crate::db::backend::{NativeError, NativeResult};
use crate::db::errors::classify;
use crate::db::params::{WireValue, coerce_args};
use crate::db::types::native_column_type;
use crate::error::{DriverError, DriverResult};
use crate::models::{Query, ResultSet};
use std::future::Future;
use tracing::debug;

/// Provider name reported to the engine.
pub const PROVIDER: &str = "postgres";

/// Executes parameterized statements.
pub trait Queryable: Send + Sync {
    /// Run a statement and return its rows with one logical type per column.
    fn query_raw(&self, query: &Query) -> impl Future<Output = DriverResult<ResultSet>> + Send;

    /// Run a statement and return the number of affected rows, `0` when the
    /// server reports none.
    fn execute_raw(&self, query: &Query) -> impl Future<Output = DriverResult<u64>> + Send;

    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn adapter_name(&self) -> &'static str {
        env!("CARGO_PKG_NAME")
    }
}

/// Coerce the bind arguments of `query`.
pub(crate) fn prepare_args(tag: &str, query: &Query) -> DriverResult<Vec<WireValue>> {
    debug!(
        tag,
        sql = %query.sql,
        params = query.args.len(),
        "Executing query"
    );
    coerce_args(&query.args, &query.arg_types)
}

/// Build a [`ResultSet`] from a connector result.
///
/// Every field is mapped through the type mapper first; one unmappable column
/// fails the whole call and no rows are returned.
pub(crate) fn build_result_set(result: NativeResult) -> DriverResult<ResultSet> {
    let column_types = result
        .fields
        .iter()
        .map(|field| native_column_type(&field.native_type).map_err(DriverError::from))
        .collect::<DriverResult<Vec<_>>>()?;

    let column_names = result.fields.into_iter().map(|f| f.name).collect();

    Ok(ResultSet {
        column_names,
        column_types,
        rows: result.rows,
    })
}

pub(crate) fn affected_rows(result: &NativeResult) -> u64 {
    result.row_count.unwrap_or(0)
}

/// Classify a connector error, logging the raw form.
pub(crate) fn on_error(tag: &str, error: NativeError) -> DriverError {
    let classified = classify(&error);
    debug!(tag, error = %error, classified = %classified, "Query failed");
    classified
}
