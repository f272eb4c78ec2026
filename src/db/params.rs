//! Bind-parameter coercion.
//!
//! Turns the engine's [`Value`] arguments, together with their declared
//! [`ArgType`]s, into [`WireValue`]s that the connector can bind without
//! further inspection. Byte carriers collapse into a single canonical form,
//! NULLs keep their declared type and arrays carry an explicit element type.

use crate::error::{DriverError, DriverResult};
use crate::models::{ArgType, ScalarType, Value};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A bind value in the representation the connector sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// NULL of the declared type. `Unknown` binds untyped.
    Null(ArgType),
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(DateTime<Utc>),
    Array {
        element: ScalarType,
        items: Vec<WireValue>,
    },
}

impl WireValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }
}

/// Coerce every argument of a query.
///
/// `arg_types` is index-aligned with `args`; missing entries count as
/// [`ArgType::Unknown`].
pub fn coerce_args(args: &[Value], arg_types: &[ArgType]) -> DriverResult<Vec<WireValue>> {
    args.iter()
        .enumerate()
        .map(|(index, value)| {
            let declared = arg_types.get(index).copied().unwrap_or_default();
            coerce(index, value, declared)
        })
        .collect()
}

fn coerce(index: usize, value: &Value, declared: ArgType) -> DriverResult<WireValue> {
    match (value, declared) {
        (Value::Null, _) => Ok(WireValue::Null(declared)),
        (Value::Array(items), ArgType::Array(element)) => coerce_array(index, items, Some(element)),
        (Value::Array(items), ArgType::Unknown) => coerce_array(index, items, None),
        (Value::Array(_), ArgType::Scalar(target)) => Err(DriverError::invalid_argument(
            index,
            format!("expected a {:?} value, got an array", target),
        )),
        (_, ArgType::Array(element)) => Err(DriverError::invalid_argument(
            index,
            format!(
                "expected an array of {:?}, got {}",
                element,
                value.type_name()
            ),
        )),
        (_, ArgType::Scalar(target)) => coerce_scalar(index, value, Some(target)),
        (_, ArgType::Unknown) => coerce_scalar(index, value, None),
    }
}

fn coerce_array(
    index: usize,
    items: &[Value],
    element: Option<ScalarType>,
) -> DriverResult<WireValue> {
    let element = element
        .or_else(|| infer_element(items))
        .unwrap_or(ScalarType::Text);

    let items = items
        .iter()
        .map(|item| match item {
            Value::Null => Ok(WireValue::Null(ArgType::Scalar(element))),
            // Multi-dimensional arrays nest
            Value::Array(inner) => coerce_array(index, inner, Some(element)),
            other => coerce_scalar(index, other, Some(element)),
        })
        .collect::<DriverResult<Vec<_>>>()?;

    Ok(WireValue::Array { element, items })
}

/// Element type of an undeclared array, from its first non-null item.
fn infer_element(items: &[Value]) -> Option<ScalarType> {
    items.iter().find_map(|item| match item {
        Value::Null => None,
        Value::Array(inner) => infer_element(inner),
        Value::Boolean(_) => Some(ScalarType::Boolean),
        Value::Int32(_) => Some(ScalarType::Int32),
        Value::Int64(_) => Some(ScalarType::Int64),
        Value::Float(_) => Some(ScalarType::Float),
        Value::Double(_) => Some(ScalarType::Double),
        Value::Numeric(_) => Some(ScalarType::Numeric),
        Value::Text(_) => Some(ScalarType::Text),
        Value::Bytes(_) => Some(ScalarType::Bytes),
        Value::Json(_) => Some(ScalarType::Json),
        Value::Uuid(_) => Some(ScalarType::Uuid),
        Value::Date(_) => Some(ScalarType::Date),
        Value::Time(_) => Some(ScalarType::Time),
        Value::DateTime(_) => Some(ScalarType::DateTime),
    })
}

fn coerce_scalar(
    index: usize,
    value: &Value,
    target: Option<ScalarType>,
) -> DriverResult<WireValue> {
    use ScalarType as T;

    let mismatch = || {
        DriverError::invalid_argument(
            index,
            format!(
                "cannot convert {} to {}",
                value.type_name(),
                target.map(|t| format!("{:?}", t)).unwrap_or_default()
            ),
        )
    };

    let wire = match (value, target) {
        (Value::Null, _) => WireValue::Null(target.map(ArgType::Scalar).unwrap_or_default()),
        (Value::Array(_), _) => return Err(mismatch()),

        (Value::Bytes(b), None | Some(T::Bytes)) => WireValue::Bytes(b.clone()),
        (Value::Bytes(_), _) => return Err(mismatch()),

        (Value::Text(s), None | Some(T::Text | T::Character | T::Enum)) => {
            WireValue::Text(s.clone())
        }
        (Value::Text(s), Some(target)) => parse_text(index, s, target)?,

        (Value::Boolean(b), None | Some(T::Boolean)) => WireValue::Boolean(*b),
        (Value::Boolean(b), Some(T::Text)) => WireValue::Text(b.to_string()),
        (Value::Boolean(_), _) => return Err(mismatch()),

        (Value::Int32(v), None | Some(T::Int32)) => WireValue::Int32(*v),
        (Value::Int32(v), Some(T::Int64)) => WireValue::Int64(i64::from(*v)),
        (Value::Int32(v), Some(T::Double)) => WireValue::Double(f64::from(*v)),
        (Value::Int32(v), Some(T::Float)) => {
            let f = *v as f32;
            if f as i64 != i64::from(*v) {
                return Err(out_of_range(index, v, "Float"));
            }
            WireValue::Float(f)
        }
        (Value::Int32(v), Some(T::Numeric)) => WireValue::Numeric(v.to_string()),
        (Value::Int32(v), Some(T::Text)) => WireValue::Text(v.to_string()),
        (Value::Int32(_), _) => return Err(mismatch()),

        (Value::Int64(v), None | Some(T::Int64)) => WireValue::Int64(*v),
        (Value::Int64(v), Some(T::Int32)) => WireValue::Int32(
            i32::try_from(*v).map_err(|_| out_of_range(index, v, "Int32"))?,
        ),
        (Value::Int64(v), Some(T::Double)) => {
            let d = *v as f64;
            if d as i64 != *v {
                return Err(out_of_range(index, v, "Double"));
            }
            WireValue::Double(d)
        }
        (Value::Int64(v), Some(T::Numeric)) => WireValue::Numeric(v.to_string()),
        (Value::Int64(v), Some(T::Text)) => WireValue::Text(v.to_string()),
        (Value::Int64(_), _) => return Err(mismatch()),

        (Value::Float(f), None | Some(T::Float)) => WireValue::Float(*f),
        (Value::Float(f), Some(T::Double)) => WireValue::Double(f64::from(*f)),
        (Value::Float(f), Some(T::Numeric)) => {
            WireValue::Numeric(float_to_numeric(f64::from(*f), f.to_string()))
        }
        (Value::Float(f), Some(T::Text)) => WireValue::Text(f.to_string()),
        (Value::Float(_), _) => return Err(mismatch()),

        (Value::Double(d), None | Some(T::Double)) => WireValue::Double(*d),
        (Value::Double(d), Some(T::Float)) => {
            let f = *d as f32;
            if d.is_finite() && f64::from(f) != *d {
                return Err(out_of_range(index, d, "Float"));
            }
            WireValue::Float(f)
        }
        (Value::Double(d), Some(T::Int32)) => WireValue::Int32(
            exact_integer(*d)
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| out_of_range(index, d, "Int32"))?,
        ),
        (Value::Double(d), Some(T::Int64)) => {
            WireValue::Int64(exact_integer(*d).ok_or_else(|| out_of_range(index, d, "Int64"))?)
        }
        (Value::Double(d), Some(T::Numeric)) => {
            WireValue::Numeric(float_to_numeric(*d, d.to_string()))
        }
        (Value::Double(d), Some(T::Text)) => WireValue::Text(d.to_string()),
        (Value::Double(_), _) => return Err(mismatch()),

        (Value::Numeric(s), None | Some(T::Numeric)) => {
            if !is_numeric_literal(s) {
                return Err(DriverError::invalid_argument(
                    index,
                    format!("'{}' is not a valid numeric value", s),
                ));
            }
            WireValue::Numeric(s.trim().to_string())
        }
        (Value::Numeric(s), Some(target)) => parse_text(index, s, target)?,

        (Value::Json(j), None | Some(T::Json)) => WireValue::Json(j.clone()),
        (Value::Json(j), Some(T::Text)) => WireValue::Text(j.to_string()),
        (Value::Json(_), _) => return Err(mismatch()),

        (Value::Uuid(u), None | Some(T::Uuid)) => WireValue::Uuid(*u),
        (Value::Uuid(u), Some(T::Text)) => WireValue::Text(u.to_string()),
        (Value::Uuid(_), _) => return Err(mismatch()),

        (Value::Date(d), None | Some(T::Date)) => WireValue::Date(*d),
        (Value::Date(d), Some(T::Text)) => WireValue::Text(d.to_string()),
        (Value::Date(d), Some(T::DateTime)) => {
            WireValue::DateTime(d.and_time(NaiveTime::MIN).and_utc())
        }
        (Value::Date(_), _) => return Err(mismatch()),

        (Value::Time(t), None | Some(T::Time)) => WireValue::Time(*t),
        (Value::Time(t), Some(T::Text)) => WireValue::Text(t.to_string()),
        (Value::Time(_), _) => return Err(mismatch()),

        (Value::DateTime(dt), None | Some(T::DateTime)) => WireValue::DateTime(*dt),
        (Value::DateTime(dt), Some(T::Text)) => WireValue::Text(dt.to_rfc3339()),
        (Value::DateTime(_), _) => return Err(mismatch()),
    };
    Ok(wire)
}

/// Parse a textual argument into the declared type.
fn parse_text(index: usize, s: &str, target: ScalarType) -> DriverResult<WireValue> {
    use ScalarType as T;

    let invalid = |what: &str| {
        DriverError::invalid_argument(index, format!("'{}' is not a valid {}", truncate(s), what))
    };
    let trimmed = s.trim();

    let wire = match target {
        T::Text | T::Character | T::Enum => WireValue::Text(s.to_string()),
        T::Bytes => WireValue::Bytes(
            STANDARD
                .decode(trimmed)
                .map_err(|_| invalid("base64 byte sequence"))?,
        ),
        T::Int32 => WireValue::Int32(trimmed.parse().map_err(|_| invalid("Int32"))?),
        T::Int64 => WireValue::Int64(trimmed.parse().map_err(|_| invalid("Int64"))?),
        T::Float => WireValue::Float(trimmed.parse().map_err(|_| invalid("Float"))?),
        T::Double => WireValue::Double(trimmed.parse().map_err(|_| invalid("Double"))?),
        T::Numeric => {
            if !is_numeric_literal(trimmed) {
                return Err(invalid("numeric value"));
            }
            WireValue::Numeric(trimmed.to_string())
        }
        T::Boolean => WireValue::Boolean(parse_bool(trimmed).ok_or_else(|| invalid("boolean"))?),
        T::Uuid => WireValue::Uuid(Uuid::parse_str(trimmed).map_err(|_| invalid("UUID"))?),
        T::Date => WireValue::Date(
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| invalid("date"))?,
        ),
        T::Time => WireValue::Time(
            NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f").map_err(|_| invalid("time"))?,
        ),
        T::DateTime => {
            WireValue::DateTime(parse_datetime(trimmed).ok_or_else(|| invalid("datetime"))?)
        }
        T::Json => WireValue::Json(serde_json::from_str(s).map_err(|_| invalid("JSON document"))?),
    };
    Ok(wire)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "on" => Some(true),
        "false" | "f" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.f]` read as UTC.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Accepts what PostgreSQL's numeric input accepts, minus whitespace padding.
fn is_numeric_literal(s: &str) -> bool {
    let s = s.trim();
    if matches!(
        s.to_ascii_lowercase().as_str(),
        "nan" | "infinity" | "+infinity" | "-infinity" | "inf" | "+inf" | "-inf"
    ) {
        return true;
    }

    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => (&unsigned[..pos], Some(&unsigned[pos + 1..])),
        None => (unsigned, None),
    };

    let mut parts = mantissa.splitn(2, '.');
    let int_part = parts.next().unwrap_or_default();
    let frac_part = parts.next().unwrap_or_default();
    let digits_ok = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if int_part.is_empty() && frac_part.is_empty() {
        return false;
    }
    if !digits_ok(int_part) || !digits_ok(frac_part) {
        return false;
    }

    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !exp.is_empty() && digits_ok(exp)
        }
    }
}

fn float_to_numeric(f: f64, text: String) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        text
    }
}

fn exact_integer(d: f64) -> Option<i64> {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 9.007_199_254_740_992e15 {
        Some(d as i64)
    } else {
        None
    }
}

fn out_of_range(index: usize, value: &dyn std::fmt::Display, target: &str) -> DriverError {
    DriverError::invalid_argument(index, format!("{} cannot be represented as {}", value, target))
}

fn truncate(s: &str) -> String {
    const MAX: usize = 64;
    match s.char_indices().nth(MAX) {
        Some((pos, _)) => format!("{}...", &s[..pos]),
        None => s.to_string(),
    }
}
