//! PostgreSQL type mappings.
//!
//! Maps native type OIDs, as reported in a statement's row description, to the
//! logical [`ColumnType`] attached to each result column.
//!
//! The mapping is total over the builtin catalog: every OID is either mapped or
//! rejected with [`UnsupportedNativeDataType`] naming the type. OIDs at or above
//! [`FIRST_NORMAL_OBJECT_ID`] belong to user-defined types. Those are mapped by
//! their catalog description ([`NativeType`]): enums and base types are text,
//! domains follow their base type, arrays follow their element, and composites
//! and ranges are rejected.

use crate::models::{ColumnType, ScalarType};

// =============================================================================
// Builtin OIDs
// =============================================================================

pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const CHAR: u32 = 18;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const XML: u32 = 142;
    pub const CIDR: u32 = 650;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const MONEY: u32 = 790;
    pub const INET: u32 = 869;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const TIMETZ: u32 = 1266;
    pub const BIT: u32 = 1560;
    pub const VARBIT: u32 = 1562;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;

    pub const BOOL_ARRAY: u32 = 1000;
    pub const BYTEA_ARRAY: u32 = 1001;
    pub const CHAR_ARRAY: u32 = 1002;
    pub const NAME_ARRAY: u32 = 1003;
    pub const INT2_ARRAY: u32 = 1005;
    pub const INT4_ARRAY: u32 = 1007;
    pub const TEXT_ARRAY: u32 = 1009;
    pub const BPCHAR_ARRAY: u32 = 1014;
    pub const VARCHAR_ARRAY: u32 = 1015;
    pub const INT8_ARRAY: u32 = 1016;
    pub const FLOAT4_ARRAY: u32 = 1021;
    pub const FLOAT8_ARRAY: u32 = 1022;
    pub const OID_ARRAY: u32 = 1028;
    pub const INET_ARRAY: u32 = 1041;
    pub const CIDR_ARRAY: u32 = 651;
    pub const MONEY_ARRAY: u32 = 791;
    pub const TIMESTAMP_ARRAY: u32 = 1115;
    pub const DATE_ARRAY: u32 = 1182;
    pub const TIME_ARRAY: u32 = 1183;
    pub const TIMESTAMPTZ_ARRAY: u32 = 1185;
    pub const NUMERIC_ARRAY: u32 = 1231;
    pub const TIMETZ_ARRAY: u32 = 1270;
    pub const BIT_ARRAY: u32 = 1561;
    pub const VARBIT_ARRAY: u32 = 1563;
    pub const UUID_ARRAY: u32 = 2951;
    pub const JSON_ARRAY: u32 = 199;
    pub const JSONB_ARRAY: u32 = 3807;
    pub const XML_ARRAY: u32 = 143;
}

/// OIDs below this value are reserved for the builtin catalog.
pub const FIRST_NORMAL_OBJECT_ID: u32 = 16384;

/// A native type the adapter has no logical column type for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported native data type: {type_name}")]
pub struct UnsupportedNativeDataType {
    pub type_name: String,
}

impl From<UnsupportedNativeDataType> for crate::error::DriverError {
    fn from(e: UnsupportedNativeDataType) -> Self {
        Self::UnsupportedNativeDataType {
            type_name: e.type_name,
        }
    }
}

// =============================================================================
// Native type descriptions
// =============================================================================

/// How a user-defined type is built, per the server catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypeKind {
    /// Builtin, extension base type, or a type the driver did not resolve.
    #[default]
    Base,
    Enum,
    Domain(Box<NativeType>),
    Array(Box<NativeType>),
    Composite,
    Range,
    Pseudo,
}

/// A column type as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeType {
    pub oid: u32,
    pub name: String,
    pub kind: TypeKind,
}

impl NativeType {
    /// A type known by OID alone.
    pub fn from_oid(oid: u32) -> Self {
        Self {
            oid,
            name: type_name(oid),
            kind: TypeKind::Base,
        }
    }

    pub fn new(oid: u32, name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            oid,
            name: name.into(),
            kind,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.oid < FIRST_NORMAL_OBJECT_ID
    }
}

// =============================================================================
// Type Classification
// =============================================================================

/// Map a described native type to its logical column type.
pub fn native_column_type(native: &NativeType) -> Result<ColumnType, UnsupportedNativeDataType> {
    if native.is_builtin() {
        return column_type(native.oid);
    }
    let unsupported = || UnsupportedNativeDataType {
        type_name: native.name.clone(),
    };
    match &native.kind {
        TypeKind::Base | TypeKind::Enum => Ok(ColumnType::Scalar(ScalarType::Text)),
        TypeKind::Domain(base) => native_column_type(base),
        TypeKind::Array(element) => match native_column_type(element) {
            Ok(ColumnType::Scalar(scalar)) => Ok(ColumnType::Array(scalar)),
            _ => Err(unsupported()),
        },
        TypeKind::Composite | TypeKind::Range | TypeKind::Pseudo => Err(unsupported()),
    }
}

/// Map a native type OID to its logical column type.
///
/// User-defined OIDs without a catalog description are read as text.
pub fn column_type(type_oid: u32) -> Result<ColumnType, UnsupportedNativeDataType> {
    if let Some(scalar) = scalar_type(type_oid) {
        return Ok(ColumnType::Scalar(scalar));
    }
    if let Some(element) = array_element(type_oid).and_then(scalar_type) {
        return Ok(ColumnType::Array(element));
    }
    if type_oid >= FIRST_NORMAL_OBJECT_ID {
        return Ok(ColumnType::Scalar(ScalarType::Text));
    }
    Err(UnsupportedNativeDataType {
        type_name: type_name(type_oid),
    })
}

fn scalar_type(type_oid: u32) -> Option<ScalarType> {
    let scalar = match type_oid {
        oid::INT2 | oid::INT4 => ScalarType::Int32,
        oid::INT8 | oid::OID => ScalarType::Int64,
        oid::FLOAT4 => ScalarType::Float,
        oid::FLOAT8 => ScalarType::Double,
        oid::NUMERIC | oid::MONEY => ScalarType::Numeric,
        oid::BOOL => ScalarType::Boolean,
        oid::CHAR => ScalarType::Character,
        oid::TEXT
        | oid::VARCHAR
        | oid::BPCHAR
        | oid::NAME
        | oid::XML
        | oid::INET
        | oid::CIDR
        | oid::BIT
        | oid::VARBIT => ScalarType::Text,
        oid::DATE => ScalarType::Date,
        oid::TIME | oid::TIMETZ => ScalarType::Time,
        oid::TIMESTAMP | oid::TIMESTAMPTZ => ScalarType::DateTime,
        oid::JSON | oid::JSONB => ScalarType::Json,
        oid::BYTEA => ScalarType::Bytes,
        oid::UUID => ScalarType::Uuid,
        _ => return None,
    };
    Some(scalar)
}

/// Element OID of a builtin array type.
pub fn array_element(type_oid: u32) -> Option<u32> {
    let element = match type_oid {
        oid::BOOL_ARRAY => oid::BOOL,
        oid::BYTEA_ARRAY => oid::BYTEA,
        oid::CHAR_ARRAY => oid::CHAR,
        oid::NAME_ARRAY => oid::NAME,
        oid::INT2_ARRAY => oid::INT2,
        oid::INT4_ARRAY => oid::INT4,
        oid::TEXT_ARRAY => oid::TEXT,
        oid::BPCHAR_ARRAY => oid::BPCHAR,
        oid::VARCHAR_ARRAY => oid::VARCHAR,
        oid::INT8_ARRAY => oid::INT8,
        oid::FLOAT4_ARRAY => oid::FLOAT4,
        oid::FLOAT8_ARRAY => oid::FLOAT8,
        oid::OID_ARRAY => oid::OID,
        oid::INET_ARRAY => oid::INET,
        oid::CIDR_ARRAY => oid::CIDR,
        oid::MONEY_ARRAY => oid::MONEY,
        oid::TIMESTAMP_ARRAY => oid::TIMESTAMP,
        oid::DATE_ARRAY => oid::DATE,
        oid::TIME_ARRAY => oid::TIME,
        oid::TIMESTAMPTZ_ARRAY => oid::TIMESTAMPTZ,
        oid::NUMERIC_ARRAY => oid::NUMERIC,
        oid::TIMETZ_ARRAY => oid::TIMETZ,
        oid::BIT_ARRAY => oid::BIT,
        oid::VARBIT_ARRAY => oid::VARBIT,
        oid::UUID_ARRAY => oid::UUID,
        oid::JSON_ARRAY => oid::JSON,
        oid::JSONB_ARRAY => oid::JSONB,
        oid::XML_ARRAY => oid::XML,
        _ => return None,
    };
    Some(element)
}

/// Human-readable name of a builtin type, or `oid:<n>` when unknown.
pub fn type_name(type_oid: u32) -> String {
    let name = match type_oid {
        22 => "int2vector",
        24 => "regproc",
        27 => "tid",
        28 => "xid",
        29 => "cid",
        30 => "oidvector",
        194 => "pg_node_tree",
        600 => "point",
        601 => "lseg",
        602 => "path",
        603 => "box",
        604 => "polygon",
        628 => "line",
        718 => "circle",
        774 => "macaddr8",
        829 => "macaddr",
        1033 => "aclitem",
        1186 => "interval",
        1187 => "_interval",
        1790 => "refcursor",
        2202 => "regprocedure",
        2203 => "regoper",
        2204 => "regoperator",
        2205 => "regclass",
        2206 => "regtype",
        2249 => "record",
        2275 => "cstring",
        2276 => "any",
        2278 => "void",
        3220 => "pg_lsn",
        3361 => "pg_ndistinct",
        3614 => "tsvector",
        3615 => "tsquery",
        3642 => "gtsvector",
        3904 => "int4range",
        3906 => "numrange",
        3908 => "tsrange",
        3910 => "tstzrange",
        3912 => "daterange",
        3926 => "int8range",
        4072 => "jsonpath",
        4089 => "regnamespace",
        4096 => "regrole",
        4451 => "int4multirange",
        4532 => "nummultirange",
        5038 => "pg_snapshot",
        5069 => "xid8",
        _ => return format!("oid:{}", type_oid),
    };
    name.to_string()
}
