//! Connection and transaction related data models.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Static capability metadata exposed to migration tooling. No I/O involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Schema the engine should qualify objects with, if configured.
    pub schema_name: Option<String>,
    pub supports_relation_joins: bool,
}

/// Transaction isolation levels understood by PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Error returned when parsing an unknown isolation level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown isolation level: {0}")]
pub struct UnknownIsolationLevel(pub String);

impl FromStr for IsolationLevel {
    type Err = UnknownIsolationLevel;

    /// Accepts both the SQL spelling (`"READ COMMITTED"`) and the engine's
    /// camel-cased names (`"ReadCommitted"`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "readuncommitted" => Ok(Self::ReadUncommitted),
            "readcommitted" => Ok(Self::ReadCommitted),
            "repeatableread" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(UnknownIsolationLevel(s.to_string())),
        }
    }
}

/// Options describing how the engine should drive a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// When true the engine must not send real COMMIT/ROLLBACK statements.
    pub use_phantom_query: bool,
}

/// How `commit` and `rollback` finish the transaction on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionFinalization {
    /// Only release the connection. The engine has already sent
    /// `COMMIT`/`ROLLBACK` through `execute_raw`.
    #[default]
    ReleaseOnly,
    /// Send `COMMIT`/`ROLLBACK` before releasing the connection.
    IssueStatements,
}
