//! PostgreSQL connector built on `sqlx`.
//!
//! [`PostgresBackend`] creates lazily connecting [`PostgresPool`]s. Prepared
//! statements are described before execution so that every result carries its
//! field types, even when it has no rows. Cells come back in binary format and
//! are decoded through the statement's [`TypeParsers`].

use crate::config::PoolConfig;
use crate::db::backend::{
    Backend, IdleErrorHandler, IdleErrorListeners, ListenerId, NativeError, NativeField,
    NativeResult, Pool, PoolConnection, StatementMode, StatementSpec,
};
use crate::db::params::WireValue;
use crate::db::parsers::{ColumnDecoder, TypeParsers};
use crate::db::types::{FIRST_NORMAL_OBJECT_ID, NativeType, TypeKind, oid};
use crate::models::{ArgType, ScalarType, Value};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection as SqlxPoolConnection;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgDatabaseError, PgHasArrayType, PgPool,
    PgPoolOptions, PgRow, PgTypeInfo, PgTypeKind,
};
use sqlx::types::Json;
use sqlx::{
    Arguments, Column, Connection, Either, Encode, Executor, Postgres, Row, Statement, Type,
    TypeInfo, ValueRef,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Idle connections older than this are pinged before being handed out.
const IDLE_PING_AFTER: Duration = Duration::from_secs(10);

// =============================================================================
// Error conversion
// =============================================================================

impl From<sqlx::Error> for NativeError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                match db_err.try_downcast_ref::<PgDatabaseError>() {
                    Some(pg) => NativeError::Database {
                        code,
                        message,
                        constraint: pg.constraint().map(String::from),
                        table: pg.table().map(String::from),
                        column: pg.column().map(String::from),
                        detail: pg.detail().map(String::from),
                    },
                    None => NativeError::Database {
                        code,
                        message,
                        constraint: db_err.constraint().map(String::from),
                        table: None,
                        column: None,
                        detail: None,
                    },
                }
            }
            sqlx::Error::Io(io_err) => NativeError::Io {
                kind: io_err.kind(),
                message: io_err.to_string(),
            },
            sqlx::Error::Tls(tls_err) => NativeError::Tls(tls_err.to_string()),
            sqlx::Error::Protocol(msg) => NativeError::Protocol(msg),
            sqlx::Error::Configuration(msg) => NativeError::Configuration(msg.to_string()),
            sqlx::Error::PoolTimedOut => NativeError::PoolTimedOut,
            sqlx::Error::PoolClosed => NativeError::PoolClosed,
            sqlx::Error::ColumnDecode { index, source } => {
                NativeError::Decode(format!("column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => NativeError::Decode(source.to_string()),
            other => NativeError::Other(other.to_string()),
        }
    }
}

// =============================================================================
// Backend and pool
// =============================================================================

/// Creates [`PostgresPool`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresBackend;

impl Backend for PostgresBackend {
    type Pool = PostgresPool;

    fn create_pool(&self, config: &PoolConfig) -> Result<PostgresPool, NativeError> {
        let options = PgConnectOptions::from_str(&config.url)?;
        let listeners = Arc::new(IdleErrorListeners::default());
        let hook_listeners = Arc::clone(&listeners);

        info!(
            url = %config.masked_url(),
            max_connections = config.max_connections_or_default(),
            "Creating connection pool"
        );

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections_or_default())
            .max_connections(config.max_connections_or_default())
            .acquire_timeout(config.acquire_timeout_or_default())
            .idle_timeout(Some(config.idle_timeout_or_default()))
            .max_lifetime(Some(config.max_lifetime_or_default()))
            .test_before_acquire(false)
            .before_acquire(move |conn, meta| {
                let listeners = Arc::clone(&hook_listeners);
                Box::pin(async move {
                    if meta.idle_for < IDLE_PING_AFTER {
                        return Ok::<bool, sqlx::Error>(true);
                    }
                    match conn.ping().await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            let error = NativeError::from(e);
                            warn!(error = %error, "Idle connection failed health check");
                            listeners.notify(&error);
                            // Discard it, the pool opens a fresh one
                            Ok(false)
                        }
                    }
                })
            })
            .connect_lazy_with(options);

        Ok(PostgresPool {
            pool,
            config: Arc::new(config.clone()),
            listeners,
        })
    }
}

/// A `sqlx` PostgreSQL pool.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
    config: Arc<PoolConfig>,
    listeners: Arc<IdleErrorListeners>,
}

impl std::fmt::Debug for PostgresPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPool")
            .field("config", &self.config)
            .field("size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl PostgresPool {
    /// Wrap a pool built elsewhere. Idle-error listeners registered on it are
    /// never notified, since the pool has no health-check hook.
    pub fn from_pg_pool(pool: PgPool, config: PoolConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            listeners: Arc::new(IdleErrorListeners::default()),
        }
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}

impl Pool for PostgresPool {
    type Connection = PostgresConnection;

    async fn connect(&self) -> Result<PostgresConnection, NativeError> {
        let conn = self.pool.acquire().await?;
        Ok(PostgresConnection(conn))
    }

    async fn release(&self, conn: PostgresConnection, error: Option<&NativeError>) {
        match error {
            None => drop(conn),
            Some(error) => {
                debug!(error = %error, "Closing connection released with an error");
                if let Err(e) = conn.0.close().await {
                    warn!(error = %e, "Failed to close connection");
                }
            }
        }
    }

    async fn end(&self) {
        self.pool.close().await;
        info!(url = %self.config.masked_url(), "Connection pool closed");
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn on_error(&self, handler: IdleErrorHandler) -> ListenerId {
        self.listeners.register(handler)
    }

    fn remove_error_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn config(&self) -> &PoolConfig {
        &self.config
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A connection checked out of a [`PostgresPool`].
#[derive(Debug)]
pub struct PostgresConnection(SqlxPoolConnection<Postgres>);

impl PoolConnection for PostgresConnection {
    async fn query(&mut self, spec: StatementSpec<'_>) -> Result<NativeResult, NativeError> {
        match spec.mode {
            StatementMode::Prepared => self.run_prepared(spec).await,
            StatementMode::Simple => self.run_simple(spec).await,
        }
    }
}

impl PostgresConnection {
    async fn run_prepared(&mut self, spec: StatementSpec<'_>) -> Result<NativeResult, NativeError> {
        let mut args = PgArguments::default();
        let mut param_types = Vec::with_capacity(spec.values.len());
        for value in spec.values {
            bind_value(&mut args, &mut param_types, value)?;
        }

        let conn = &mut *self.0;
        let statement = (&mut *conn).prepare_with(spec.sql, &param_types).await?;
        let fields: Vec<NativeField> = statement
            .columns()
            .iter()
            .map(|col| NativeField {
                name: col.name().to_string(),
                native_type: native_type(col.type_info()),
            })
            .collect();
        let decoders = column_decoders(&fields);

        let mut result = NativeResult {
            fields,
            ..Default::default()
        };
        let mut stream = (&mut *conn).fetch_many(statement.query_with(args));
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    result.row_count = Some(result.row_count.unwrap_or(0) + done.rows_affected());
                }
                Either::Right(row) => {
                    let decoded = decode_row(&row, &decoders, spec.parsers)?;
                    result.rows.push(decoded);
                }
            }
        }
        Ok(result)
    }

    /// Simple protocol. Rows, if any, are in text format.
    async fn run_simple(&mut self, spec: StatementSpec<'_>) -> Result<NativeResult, NativeError> {
        let conn = &mut *self.0;
        let mut result = NativeResult::default();
        let mut decoders = Vec::new();
        let mut stream = (&mut *conn).fetch_many(spec.sql);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    result.row_count = Some(result.row_count.unwrap_or(0) + done.rows_affected());
                }
                Either::Right(row) => {
                    if result.fields.is_empty() {
                        result.fields = row
                            .columns()
                            .iter()
                            .map(|col| NativeField {
                                name: col.name().to_string(),
                                native_type: native_type(col.type_info()),
                            })
                            .collect();
                        decoders = column_decoders(&result.fields);
                    }
                    let decoded = decode_row(&row, &decoders, spec.parsers)?;
                    result.rows.push(decoded);
                }
            }
        }
        Ok(result)
    }
}

/// Catalog description of a column type as resolved by the driver.
fn native_type(info: &PgTypeInfo) -> NativeType {
    let type_oid = match info.oid() {
        Some(oid) => oid.0,
        None => {
            debug!(type_name = info.name(), "Column type has no OID");
            0
        }
    };
    // Unresolved declarations are named "?" and carry no kind
    if type_oid < FIRST_NORMAL_OBJECT_ID || info.name() == "?" {
        return NativeType::from_oid(type_oid);
    }
    let kind = match info.kind() {
        PgTypeKind::Simple => TypeKind::Base,
        PgTypeKind::Enum(_) => TypeKind::Enum,
        PgTypeKind::Domain(base) => TypeKind::Domain(Box::new(native_type(base))),
        PgTypeKind::Array(element) => TypeKind::Array(Box::new(native_type(element))),
        PgTypeKind::Composite(_) => TypeKind::Composite,
        PgTypeKind::Range(_) => TypeKind::Range,
        PgTypeKind::Pseudo => TypeKind::Pseudo,
    };
    NativeType::new(type_oid, info.name(), kind)
}

fn column_decoders(fields: &[NativeField]) -> Vec<ColumnDecoder> {
    fields
        .iter()
        .map(|f| ColumnDecoder::for_type(&f.native_type))
        .collect()
}

fn decode_row(
    row: &PgRow,
    decoders: &[ColumnDecoder],
    parsers: &TypeParsers,
) -> Result<Vec<Value>, NativeError> {
    (0..row.len())
        .map(|idx| -> Result<Value, NativeError> {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                return Ok(Value::Null);
            }
            let decoder = decoders.get(idx).unwrap_or(&ColumnDecoder::Opaque);
            Ok(parsers.decode(decoder, raw)?)
        })
        .collect()
}

// =============================================================================
// Parameter binding
// =============================================================================

fn push<'q, T>(
    args: &mut PgArguments,
    param_types: &mut Vec<PgTypeInfo>,
    value: T,
) -> Result<(), NativeError>
where
    T: Encode<'q, Postgres> + Type<Postgres> + 'q,
{
    param_types.push(T::type_info());
    args.add(value)
        .map_err(|e| NativeError::Protocol(format!("failed to encode parameter: {}", e)))
}

fn bind_value(
    args: &mut PgArguments,
    param_types: &mut Vec<PgTypeInfo>,
    value: &WireValue,
) -> Result<(), NativeError> {
    match value {
        WireValue::Null(arg_type) => bind_null(args, param_types, *arg_type),
        WireValue::Boolean(v) => push(args, param_types, *v),
        WireValue::Int32(v) => push(args, param_types, *v),
        WireValue::Int64(v) => push(args, param_types, *v),
        WireValue::Float(v) => push(args, param_types, *v),
        WireValue::Double(v) => push(args, param_types, *v),
        WireValue::Numeric(v) => push(args, param_types, PgNumericText(v.clone())),
        WireValue::Text(v) => push(args, param_types, v.clone()),
        WireValue::Bytes(v) => push(args, param_types, v.clone()),
        WireValue::Json(v) => push(args, param_types, Json(v.clone())),
        WireValue::Uuid(v) => push(args, param_types, *v),
        WireValue::Date(v) => push(args, param_types, *v),
        WireValue::Time(v) => push(args, param_types, *v),
        WireValue::DateTime(v) => push(args, param_types, *v),
        WireValue::Array { element, items } => bind_array(args, param_types, *element, items),
    }
}

fn bind_null(
    args: &mut PgArguments,
    param_types: &mut Vec<PgTypeInfo>,
    arg_type: ArgType,
) -> Result<(), NativeError> {
    use ScalarType as T;

    match arg_type {
        ArgType::Unknown => push(args, param_types, UntypedNull),
        ArgType::Scalar(scalar) => match scalar {
            T::Int32 => push(args, param_types, None::<i32>),
            T::Int64 => push(args, param_types, None::<i64>),
            T::Float => push(args, param_types, None::<f32>),
            T::Double => push(args, param_types, None::<f64>),
            T::Numeric => push(args, param_types, None::<PgNumericText>),
            T::Boolean => push(args, param_types, None::<bool>),
            T::Character | T::Text => push(args, param_types, None::<String>),
            // Let the server infer the enum type from context
            T::Enum => push(args, param_types, UntypedNull),
            T::Date => push(args, param_types, None::<NaiveDate>),
            T::Time => push(args, param_types, None::<NaiveTime>),
            T::DateTime => push(args, param_types, None::<DateTime<Utc>>),
            T::Json => push(args, param_types, None::<Json<JsonValue>>),
            T::Bytes => push(args, param_types, None::<Vec<u8>>),
            T::Uuid => push(args, param_types, None::<uuid::Uuid>),
        },
        ArgType::Array(scalar) => match scalar {
            T::Int32 => push(args, param_types, None::<Vec<i32>>),
            T::Int64 => push(args, param_types, None::<Vec<i64>>),
            T::Float => push(args, param_types, None::<Vec<f32>>),
            T::Double => push(args, param_types, None::<Vec<f64>>),
            T::Numeric => push(args, param_types, None::<Vec<PgNumericText>>),
            T::Boolean => push(args, param_types, None::<Vec<bool>>),
            T::Character | T::Text | T::Enum => push(args, param_types, None::<Vec<String>>),
            T::Date => push(args, param_types, None::<Vec<NaiveDate>>),
            T::Time => push(args, param_types, None::<Vec<NaiveTime>>),
            T::DateTime => push(args, param_types, None::<Vec<DateTime<Utc>>>),
            T::Json => push(args, param_types, None::<Vec<Json<JsonValue>>>),
            T::Bytes => push(args, param_types, None::<Vec<Vec<u8>>>),
            T::Uuid => push(args, param_types, None::<Vec<uuid::Uuid>>),
        },
    }
}

/// Collect array items into `Vec<Option<T>>`, the shape `sqlx` encodes as a
/// one-dimensional array.
fn items_of<T>(
    items: &[WireValue],
    extract: impl Fn(&WireValue) -> Option<T>,
) -> Result<Vec<Option<T>>, NativeError> {
    items
        .iter()
        .map(|item| match item {
            WireValue::Null(_) => Ok(None),
            WireValue::Array { .. } => Err(NativeError::other(
                "multi-dimensional array parameters are not supported",
            )),
            other => extract(other).map(Some).ok_or_else(|| {
                NativeError::other(format!("array item {:?} does not match element type", other))
            }),
        })
        .collect()
}

fn bind_array(
    args: &mut PgArguments,
    param_types: &mut Vec<PgTypeInfo>,
    element: ScalarType,
    items: &[WireValue],
) -> Result<(), NativeError> {
    use ScalarType as T;

    match element {
        T::Int32 => {
            let v = items_of(items, |i| match i {
                WireValue::Int32(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Int64 => {
            let v = items_of(items, |i| match i {
                WireValue::Int64(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Float => {
            let v = items_of(items, |i| match i {
                WireValue::Float(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Double => {
            let v = items_of(items, |i| match i {
                WireValue::Double(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Numeric => {
            let v = items_of(items, |i| match i {
                WireValue::Numeric(v) => Some(PgNumericText(v.clone())),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Boolean => {
            let v = items_of(items, |i| match i {
                WireValue::Boolean(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Character | T::Text | T::Enum => {
            let v = items_of(items, |i| match i {
                WireValue::Text(v) => Some(v.clone()),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Date => {
            let v = items_of(items, |i| match i {
                WireValue::Date(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Time => {
            let v = items_of(items, |i| match i {
                WireValue::Time(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::DateTime => {
            let v = items_of(items, |i| match i {
                WireValue::DateTime(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Json => {
            let v = items_of(items, |i| match i {
                WireValue::Json(v) => Some(Json(v.clone())),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Bytes => {
            let v = items_of(items, |i| match i {
                WireValue::Bytes(v) => Some(v.clone()),
                _ => None,
            })?;
            push(args, param_types, v)
        }
        T::Uuid => {
            let v = items_of(items, |i| match i {
                WireValue::Uuid(v) => Some(*v),
                _ => None,
            })?;
            push(args, param_types, v)
        }
    }
}

// =============================================================================
// Custom parameter types
// =============================================================================

/// NULL with an unspecified type; the server infers it from context.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Exact decimal text, sent as binary NUMERIC.
#[derive(Debug, Clone)]
struct PgNumericText(String);

impl Type<Postgres> for PgNumericText {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(oid::NUMERIC))
    }
}

impl PgHasArrayType for PgNumericText {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(oid::NUMERIC_ARRAY))
    }
}

impl Encode<'_, Postgres> for PgNumericText {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        buf.extend_from_slice(&encode_numeric(&self.0)?);
        Ok(IsNull::No)
    }
}

/// Encode decimal text (`-12.340`, `1e-3`, `NaN`, `Infinity`) in NUMERIC's
/// binary format: ndigits, weight, sign, dscale, base-10000 digits.
fn encode_numeric(text: &str) -> Result<Vec<u8>, String> {
    const NUMERIC_POS: u16 = 0x0000;
    const NUMERIC_NEG: u16 = 0x4000;
    const NUMERIC_NAN: u16 = 0xC000;
    const NUMERIC_PINF: u16 = 0xD000;
    const NUMERIC_NINF: u16 = 0xF000;

    let header = |ndigits: i16, weight: i16, sign: u16, dscale: u16| {
        let mut buf = Vec::with_capacity(8);
        buf.extend(ndigits.to_be_bytes());
        buf.extend(weight.to_be_bytes());
        buf.extend(sign.to_be_bytes());
        buf.extend(dscale.to_be_bytes());
        buf
    };

    let trimmed = text.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "nan" => return Ok(header(0, 0, NUMERIC_NAN, 0)),
        "infinity" | "+infinity" | "inf" | "+inf" => return Ok(header(0, 0, NUMERIC_PINF, 0)),
        "-infinity" | "-inf" => return Ok(header(0, 0, NUMERIC_NINF, 0)),
        _ => {}
    }

    let invalid = || format!("invalid numeric value '{}'", text);
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => {
            let exp: i32 = unsigned[pos + 1..].parse().map_err(|_| invalid())?;
            (&unsigned[..pos], exp)
        }
        None => (unsigned, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    // All digits, and the position of the decimal point within them
    let mut digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes())
        .map(|b| b - b'0')
        .collect();
    let mut point = int_part.len() as i64 + i64::from(exponent);
    let dscale = (digits.len() as i64 - point).max(0);
    if dscale > i64::from(i16::MAX) || point.abs() > 131_072 {
        return Err(invalid());
    }

    if point < 0 {
        digits.splice(0..0, std::iter::repeat_n(0, (-point) as usize));
        point = 0;
    }
    if point > digits.len() as i64 {
        digits.resize(point as usize, 0);
    }
    // Put the decimal point on a group boundary
    let lead = (4 - point % 4) % 4;
    digits.splice(0..0, std::iter::repeat_n(0, lead as usize));
    point += lead;
    while digits.len() % 4 != 0 {
        digits.push(0);
    }

    let mut groups: Vec<i16> = digits
        .chunks(4)
        .map(|c| c.iter().fold(0i16, |acc, d| acc * 10 + i16::from(*d)))
        .collect();
    let mut weight = point / 4 - 1;

    while groups.first() == Some(&0) {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let sign = if negative && !groups.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };
    if groups.is_empty() {
        weight = 0;
    }

    let mut buf = header(groups.len() as i16, weight as i16, sign, dscale as u16);
    for g in groups {
        buf.extend(g.to_be_bytes());
    }
    Ok(buf)
}
