//! Result set data models.

use crate::models::query::Value;
use serde::{Deserialize, Serialize};

/// Logical scalar type shared by result columns and declared arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Int32,
    Int64,
    Float,
    Double,
    Numeric,
    Boolean,
    Character,
    Text,
    Date,
    Time,
    DateTime,
    Json,
    Enum,
    Bytes,
    Uuid,
}

/// Logical column type attached to every column of a [`ResultSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Scalar(ScalarType),
    Array(ScalarType),
}

impl ColumnType {
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// The scalar type, or the element type for arrays.
    pub fn scalar(&self) -> ScalarType {
        match self {
            Self::Scalar(t) | Self::Array(t) => *t,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(t) => write!(f, "{:?}", t),
            Self::Array(t) => write!(f, "{:?}Array", t),
        }
    }
}

/// Rows returned by `query_raw`, with one logical type per column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub column_names: Vec<String>,
    /// Index-aligned with `column_names` and with every row.
    pub column_types: Vec<ColumnType>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_display() {
        assert_eq!(ColumnType::Scalar(ScalarType::Int32).to_string(), "Int32");
        assert_eq!(ColumnType::Array(ScalarType::Text).to_string(), "TextArray");
    }

    #[test]
    fn test_result_set_lookup() {
        let rs = ResultSet {
            column_names: vec!["id".into(), "name".into()],
            column_types: vec![
                ColumnType::Scalar(ScalarType::Int32),
                ColumnType::Scalar(ScalarType::Text),
            ],
            rows: vec![vec![Value::Int32(1), Value::Text("a".into())]],
        };
        assert_eq!(rs.row_count(), 1);
        assert_eq!(rs.column_index("name"), Some(1));
        assert_eq!(rs.column_index("missing"), None);
        assert!(ResultSet::default().is_empty());
    }
}
