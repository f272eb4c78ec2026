//! Per-query type parser table.
//!
//! Result cells are decoded through `sqlx`'s PostgreSQL `Decode` impls and
//! converted into [`Value`]s. [`TypeParsers`] is an immutable table of
//! caller-supplied overrides on top of those builtins. It is shared by the
//! adapter and passed along with every statement instead of living in
//! process-wide state.
//!
//! `sqlx` has no exact-text reading for NUMERIC and MONEY, and none for INET,
//! CIDR and BIT without extra crates, so those few conversions live here.

use crate::db::types::{self, NativeType, TypeKind, oid};
use crate::models::{ColumnType, Value};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::{Oid, PgMoney, PgTimeTz};
use sqlx::postgres::{PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::types::Json;
use sqlx::{Decode, Postgres, Type, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Decoder for one binary-format value.
pub type BinaryParser = fn(&[u8]) -> Result<Value, DecodeError>;

/// A cell could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to decode {type_name}: {message}")]
pub struct DecodeError {
    pub type_name: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(type_name: &str, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }

    fn driver(value: &PgValueRef<'_>, err: BoxDynError) -> Self {
        Self::new(value.type_info().name(), err.to_string())
    }
}

/// Microseconds between 1970-01-01 and 2000-01-01.
const POSTGRES_EPOCH_MICROS: i64 = 946_684_800 * 1_000_000;

const MICROS_PER_DAY: i64 = 86_400_000_000;

// =============================================================================
// Column decoders
// =============================================================================

/// How the values of a decoded column are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr {
    /// Read as this builtin type.
    Builtin(u32),
    /// A user-defined type whose values are text labels: enums and
    /// extension types such as `citext`.
    Label,
}

/// How the cells of one result column are read. Built once per statement
/// from the column's [`NativeType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDecoder {
    /// `oid` is the reported column type, the key for overrides.
    Scalar { oid: u32, repr: Repr },
    /// One-dimensional array. Overrides are keyed by `element_oid`.
    Array { element_oid: u32, repr: Repr },
    /// No logical mapping. Cells are carried as they arrived and the result
    /// is rejected before it reaches the caller.
    Opaque,
}

impl ColumnDecoder {
    pub fn for_type(native: &NativeType) -> Self {
        if native.is_builtin() {
            if let Some(element) = types::array_element(native.oid) {
                return if is_builtin_scalar(element) {
                    Self::Array {
                        element_oid: element,
                        repr: Repr::Builtin(element),
                    }
                } else {
                    Self::Opaque
                };
            }
            return if is_builtin_scalar(native.oid) {
                Self::Scalar {
                    oid: native.oid,
                    repr: Repr::Builtin(native.oid),
                }
            } else {
                Self::Opaque
            };
        }

        match &native.kind {
            TypeKind::Base | TypeKind::Enum => Self::Scalar {
                oid: native.oid,
                repr: Repr::Label,
            },
            TypeKind::Domain(base) => match Self::for_type(base) {
                Self::Scalar { repr, .. } => Self::Scalar {
                    oid: native.oid,
                    repr,
                },
                other => other,
            },
            TypeKind::Array(element) => match Self::for_type(element) {
                Self::Scalar { repr, .. } => Self::Array {
                    element_oid: element.oid,
                    repr,
                },
                _ => Self::Opaque,
            },
            TypeKind::Composite | TypeKind::Range | TypeKind::Pseudo => Self::Opaque,
        }
    }
}

fn is_builtin_scalar(type_oid: u32) -> bool {
    matches!(types::column_type(type_oid), Ok(ColumnType::Scalar(_)))
}

// =============================================================================
// Parser table
// =============================================================================

/// Immutable table of binary decoder overrides.
#[derive(Clone, Default)]
pub struct TypeParsers {
    overrides: HashMap<u32, BinaryParser>,
}

impl std::fmt::Debug for TypeParsers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut oids: Vec<_> = self.overrides.keys().copied().collect();
        oids.sort_unstable();
        f.debug_struct("TypeParsers")
            .field("overrides", &oids)
            .finish()
    }
}

impl TypeParsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the decoder for binary values of `type_oid`. Also applies to
    /// elements of arrays of that type.
    pub fn with_override(mut self, type_oid: u32, parser: BinaryParser) -> Self {
        self.overrides.insert(type_oid, parser);
        self
    }

    pub fn override_for(&self, type_oid: u32) -> Option<BinaryParser> {
        self.overrides.get(&type_oid).copied()
    }

    /// Decode one non-null cell of a column.
    pub fn decode(
        &self,
        decoder: &ColumnDecoder,
        value: PgValueRef<'_>,
    ) -> Result<Value, DecodeError> {
        let binary = value.format() == PgValueFormat::Binary;
        match *decoder {
            ColumnDecoder::Scalar { oid, repr } => {
                if let Some(parser) = self.override_for(oid).filter(|_| binary) {
                    let bytes = value.as_bytes().map_err(|e| DecodeError::driver(&value, e))?;
                    return parser(bytes);
                }
                read(repr, value.clone(), false).map_err(|e| DecodeError::driver(&value, e))
            }
            ColumnDecoder::Array { element_oid, repr } => {
                if let Some(parser) = self.override_for(element_oid).filter(|_| binary) {
                    let items = <Vec<Option<Vec<u8>>> as Decode<Postgres>>::decode(value.clone())
                        .map_err(|e| DecodeError::driver(&value, e))?;
                    return items
                        .iter()
                        .map(|item| match item {
                            Some(bytes) => parser(bytes),
                            None => Ok(Value::Null),
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array);
                }
                read(repr, value.clone(), true).map_err(|e| DecodeError::driver(&value, e))
            }
            ColumnDecoder::Opaque => {
                let cell = if binary {
                    value.as_bytes().map(|b| Value::Bytes(b.to_vec()))
                } else {
                    value.as_str().map(|s| Value::Text(s.to_string()))
                };
                cell.map_err(|e| DecodeError::driver(&value, e))
            }
        }
    }
}

// =============================================================================
// Driver types
// =============================================================================

/// A `sqlx` type that converts into a [`Value`].
trait CellValue: for<'r> Decode<'r, Postgres> + Type<Postgres> {
    fn into_value(self) -> Value;
}

type Reader = for<'r> fn(PgValueRef<'r>) -> Result<Value, BoxDynError>;

fn read_scalar<T: CellValue>(value: PgValueRef<'_>) -> Result<Value, BoxDynError> {
    Ok(<T as Decode<Postgres>>::decode(value)?.into_value())
}

fn read_array<T: CellValue>(value: PgValueRef<'_>) -> Result<Value, BoxDynError> {
    let items = <Vec<Option<T>> as Decode<Postgres>>::decode(value)?;
    Ok(Value::Array(
        items
            .into_iter()
            .map(|item| item.map_or(Value::Null, CellValue::into_value))
            .collect(),
    ))
}

fn reader<T: CellValue>(array: bool) -> Reader {
    if array {
        read_array::<T>
    } else {
        read_scalar::<T>
    }
}

fn read(repr: Repr, value: PgValueRef<'_>, array: bool) -> Result<Value, BoxDynError> {
    let reader = match repr {
        Repr::Label => reader::<Label>(array),
        Repr::Builtin(type_oid) => match type_oid {
            oid::BOOL => reader::<bool>(array),
            oid::INT2 => reader::<i16>(array),
            oid::INT4 => reader::<i32>(array),
            oid::INT8 => reader::<i64>(array),
            oid::OID => reader::<Oid>(array),
            oid::FLOAT4 => reader::<f32>(array),
            oid::FLOAT8 => reader::<f64>(array),
            oid::NUMERIC => reader::<NumericCell>(array),
            oid::MONEY => reader::<MoneyCell>(array),
            oid::CHAR => reader::<i8>(array),
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::XML => {
                reader::<String>(array)
            }
            oid::INET | oid::CIDR => reader::<InetCell>(array),
            oid::BIT | oid::VARBIT => reader::<BitCell>(array),
            oid::DATE => reader::<DateCell>(array),
            oid::TIME => reader::<TimeCell>(array),
            oid::TIMETZ => reader::<PgTimeTz<NaiveTime, FixedOffset>>(array),
            oid::TIMESTAMP | oid::TIMESTAMPTZ => reader::<TimestampCell>(array),
            oid::JSON | oid::JSONB => reader::<Json<JsonValue>>(array),
            oid::BYTEA => reader::<Vec<u8>>(array),
            oid::UUID => reader::<uuid::Uuid>(array),
            other => return Err(format!("no decoder for type oid {}", other).into()),
        },
    };
    reader(value)
}

impl CellValue for bool {
    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

impl CellValue for i16 {
    fn into_value(self) -> Value {
        Value::Int32(i32::from(self))
    }
}

impl CellValue for i32 {
    fn into_value(self) -> Value {
        Value::Int32(self)
    }
}

impl CellValue for i64 {
    fn into_value(self) -> Value {
        Value::Int64(self)
    }
}

impl CellValue for Oid {
    fn into_value(self) -> Value {
        Value::Int64(i64::from(self.0))
    }
}

impl CellValue for f32 {
    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl CellValue for f64 {
    fn into_value(self) -> Value {
        Value::Double(self)
    }
}

/// `"char"`, a single byte.
impl CellValue for i8 {
    fn into_value(self) -> Value {
        Value::Text(char::from(self as u8).to_string())
    }
}

impl CellValue for String {
    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl CellValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl CellValue for uuid::Uuid {
    fn into_value(self) -> Value {
        Value::Uuid(self)
    }
}

impl CellValue for Json<JsonValue> {
    fn into_value(self) -> Value {
        Value::Json(self.0)
    }
}

/// The zone offset is dropped, the wall-clock time is kept.
impl CellValue for PgTimeTz<NaiveTime, FixedOffset> {
    fn into_value(self) -> Value {
        Value::Time(self.time)
    }
}

// =============================================================================
// Local cell types
// =============================================================================

macro_rules! local_cell {
    ($name:ident, $type_oid:expr) => {
        struct $name(Value);

        impl Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                PgTypeInfo::with_oid(Oid($type_oid))
            }

            fn compatible(_ty: &PgTypeInfo) -> bool {
                true
            }
        }

        impl CellValue for $name {
            fn into_value(self) -> Value {
                self.0
            }
        }
    };
}

local_cell!(Label, oid::TEXT);
local_cell!(NumericCell, oid::NUMERIC);
local_cell!(MoneyCell, oid::MONEY);
local_cell!(InetCell, oid::INET);
local_cell!(BitCell, oid::VARBIT);
local_cell!(DateCell, oid::DATE);
local_cell!(TimeCell, oid::TIME);
local_cell!(TimestampCell, oid::TIMESTAMPTZ);

impl Decode<'_, Postgres> for Label {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        let text = <&str as Decode<Postgres>>::decode(value)?;
        // Text never contains NUL, so this is a binary-framed value
        if text.contains('\0') {
            return Err("value is not sent as text; register a type parser override".into());
        }
        Ok(Self(Value::Text(text.to_string())))
    }
}

impl Decode<'_, Postgres> for NumericCell {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        let text = match value.format() {
            PgValueFormat::Binary => numeric_to_text(value.as_bytes()?)?,
            PgValueFormat::Text => value.as_str()?.to_string(),
        };
        Ok(Self(Value::Numeric(text)))
    }
}

impl Decode<'_, Postgres> for MoneyCell {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        let text = match value.format() {
            PgValueFormat::Binary => {
                let cents = <PgMoney as Decode<Postgres>>::decode(value)?.0;
                let sign = if cents < 0 { "-" } else { "" };
                let abs = cents.unsigned_abs();
                format!("{}{}.{:02}", sign, abs / 100, abs % 100)
            }
            PgValueFormat::Text => value.as_str()?.to_string(),
        };
        Ok(Self(Value::Numeric(text)))
    }
}

impl Decode<'_, Postgres> for InetCell {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        let text = match value.format() {
            PgValueFormat::Binary => inet_to_text(value.as_bytes()?)?,
            PgValueFormat::Text => value.as_str()?.to_string(),
        };
        Ok(Self(Value::Text(text)))
    }
}

impl Decode<'_, Postgres> for BitCell {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        let text = match value.format() {
            PgValueFormat::Binary => bits_to_text(value.as_bytes()?)?,
            PgValueFormat::Text => value.as_str()?.to_string(),
        };
        Ok(Self(Value::Text(text)))
    }
}

/// `infinity` and `-infinity` in text format.
fn text_infinity(value: &PgValueRef<'_>) -> Option<Value> {
    if value.format() != PgValueFormat::Text {
        return None;
    }
    match value.as_str() {
        Ok(s @ ("infinity" | "-infinity")) => Some(Value::Text(s.to_string())),
        _ => None,
    }
}

impl Decode<'_, Postgres> for DateCell {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        if let Some(infinite) = text_infinity(&value) {
            return Ok(Self(infinite));
        }
        if value.format() == PgValueFormat::Text {
            return Ok(Self(Value::Date(<NaiveDate as Decode<Postgres>>::decode(value)?)));
        }
        let days = <i32 as Decode<Postgres>>::decode(value)?;
        Ok(Self(date_from_days(days)?))
    }
}

impl Decode<'_, Postgres> for TimeCell {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        if value.format() == PgValueFormat::Text {
            if value.as_str()? == "24:00:00" {
                return Ok(Self(Value::Text("24:00:00".into())));
            }
            return Ok(Self(Value::Time(<NaiveTime as Decode<Postgres>>::decode(value)?)));
        }
        let micros = <i64 as Decode<Postgres>>::decode(value.clone())?;
        if micros == MICROS_PER_DAY {
            return Ok(Self(Value::Text("24:00:00".into())));
        }
        if !(0..MICROS_PER_DAY).contains(&micros) {
            return Err(format!("{}us out of range", micros).into());
        }
        Ok(Self(Value::Time(<NaiveTime as Decode<Postgres>>::decode(value)?)))
    }
}

impl Decode<'_, Postgres> for TimestampCell {
    fn decode(value: PgValueRef<'_>) -> Result<Self, BoxDynError> {
        if let Some(infinite) = text_infinity(&value) {
            return Ok(Self(infinite));
        }
        if value.format() == PgValueFormat::Text {
            // Array elements in text format carry no type of their own
            let at = match <DateTime<Utc> as Decode<Postgres>>::decode(value.clone()) {
                Ok(at) => at,
                Err(_) => <NaiveDateTime as Decode<Postgres>>::decode(value)?.and_utc(),
            };
            return Ok(Self(Value::DateTime(at)));
        }
        let micros = <i64 as Decode<Postgres>>::decode(value)?;
        Ok(Self(timestamp_from_micros(micros)?))
    }
}

// =============================================================================
// Conversions without a driver counterpart
// =============================================================================

fn date_from_days(days: i32) -> Result<Value, BoxDynError> {
    match days {
        i32::MAX => return Ok(Value::Text("infinity".into())),
        i32::MIN => return Ok(Value::Text("-infinity".into())),
        _ => {}
    }
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .zip(TimeDelta::try_days(i64::from(days)))
        .and_then(|(epoch, delta)| epoch.checked_add_signed(delta))
        .map(Value::Date)
        .ok_or_else(|| format!("{} days out of range", days).into())
}

fn timestamp_from_micros(micros: i64) -> Result<Value, BoxDynError> {
    match micros {
        i64::MAX => return Ok(Value::Text("infinity".into())),
        i64::MIN => return Ok(Value::Text("-infinity".into())),
        _ => {}
    }
    micros
        .checked_add(POSTGRES_EPOCH_MICROS)
        .and_then(DateTime::from_timestamp_micros)
        .map(Value::DateTime)
        .ok_or_else(|| format!("{}us out of range", micros).into())
}

/// Binary NUMERIC to its exact decimal text.
pub(crate) fn numeric_to_text(bytes: &[u8]) -> Result<String, BoxDynError> {
    const NUMERIC_NEG: u16 = 0x4000;
    const NUMERIC_NAN: u16 = 0xC000;
    const NUMERIC_PINF: u16 = 0xD000;
    const NUMERIC_NINF: u16 = 0xF000;

    if bytes.len() < 8 || bytes.len() % 2 != 0 {
        return Err("invalid NUMERIC value".into());
    }
    let words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect();
    let (header, digits) = words.split_at(4);
    let ndigits = header[0] as i16;
    let weight = i32::from(header[1] as i16);
    let sign = header[2];
    let dscale = usize::from(header[3]);

    match sign {
        NUMERIC_NAN => return Ok("NaN".into()),
        NUMERIC_PINF => return Ok("Infinity".into()),
        NUMERIC_NINF => return Ok("-Infinity".into()),
        _ => {}
    }
    if usize::try_from(ndigits).ok() != Some(digits.len()) {
        return Err(format!("NUMERIC header claims {} digits", ndigits).into());
    }
    if let Some(d) = digits.iter().find(|&&d| d >= 10_000) {
        return Err(format!("invalid NUMERIC digit {}", d).into());
    }

    let digit_at = |group: i32| -> u16 {
        usize::try_from(group)
            .ok()
            .and_then(|g| digits.get(g).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit_at(0).to_string());
        for group in 1..=weight {
            out.push_str(&format!("{:04}", digit_at(group)));
        }
    }

    if dscale > 0 {
        out.push('.');
        let mut fraction = String::new();
        let mut group = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(group)));
            group += 1;
        }
        fraction.truncate(dscale);
        out.push_str(&fraction);
    }
    Ok(out)
}

/// Binary INET/CIDR to PostgreSQL's text form.
fn inet_to_text(bytes: &[u8]) -> Result<String, BoxDynError> {
    const PGSQL_AF_INET: u8 = 2;
    const PGSQL_AF_INET6: u8 = 3;

    let [family, bits, is_cidr, len, addr @ ..] = bytes else {
        return Err("invalid INET value".into());
    };
    if addr.len() != usize::from(*len) {
        return Err("INET address length mismatch".into());
    }
    let (text, full) = match *family {
        PGSQL_AF_INET => (Ipv4Addr::from(<[u8; 4]>::try_from(addr)?).to_string(), 32),
        PGSQL_AF_INET6 => (Ipv6Addr::from(<[u8; 16]>::try_from(addr)?).to_string(), 128),
        other => return Err(format!("unknown address family {}", other).into()),
    };
    if *is_cidr != 0 || *bits != full {
        Ok(format!("{}/{}", text, bits))
    } else {
        Ok(text)
    }
}

/// Binary BIT/VARBIT to a string of `0` and `1`.
fn bits_to_text(bytes: &[u8]) -> Result<String, BoxDynError> {
    let (len, data) = bytes
        .split_first_chunk::<4>()
        .ok_or("invalid BIT value")?;
    let len = usize::try_from(i32::from_be_bytes(*len))?;
    if data.len() != len.div_ceil(8) {
        return Err("BIT length mismatch".into());
    }
    Ok((0..len)
        .map(|i| {
            if data[i / 8] & (0x80 >> (i % 8)) != 0 {
                '1'
            } else {
                '0'
            }
        })
        .collect())
}
