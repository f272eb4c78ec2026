//! Integration tests for query execution through a pooled adapter.

mod support;

use pg_driver_adapter::db::params::WireValue;
use pg_driver_adapter::db::types::oid;
use pg_driver_adapter::db::{NativeError, StatementMode};
use pg_driver_adapter::error::{ConnectionErrorKind, ConstraintKind};
use pg_driver_adapter::{
    Adapter, AdapterFactory, AdapterOptions, ArgType, ColumnType, DriverError, Query, Queryable,
    ScalarType, TypeParsers, Value,
};
use std::sync::Arc;
use support::{FakeBackend, FakePool, FakeServer, Reply, db_error, test_config};

async fn adapter(server: &Arc<FakeServer>, options: AdapterOptions) -> Adapter<FakePool> {
    AdapterFactory::from_config(FakeBackend::new(server), test_config(), options)
        .connect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_query_raw_maps_columns() {
    let server = FakeServer::new();
    server.on(
        "FROM users",
        Reply::Rows {
            fields: vec![
                ("id", oid::INT4),
                ("email", oid::VARCHAR),
                ("tags", oid::TEXT_ARRAY),
                ("mood", 70_001),
            ],
            rows: vec![vec![
                Value::Int32(1),
                Value::Text("a@example.com".into()),
                Value::Array(vec![Value::Text("x".into())]),
                Value::Text("happy".into()),
            ]],
        },
    );
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let rs = adapter
        .query_raw(&Query::new("SELECT id, email, tags, mood FROM users"))
        .await
        .unwrap();

    assert_eq!(rs.column_names, vec!["id", "email", "tags", "mood"]);
    assert_eq!(
        rs.column_types,
        vec![
            ColumnType::Scalar(ScalarType::Int32),
            ColumnType::Scalar(ScalarType::Text),
            ColumnType::Array(ScalarType::Text),
            // User-defined types (enums) come back as text
            ColumnType::Scalar(ScalarType::Text),
        ]
    );
    assert_eq!(rs.row_count(), 1);
    assert_eq!(server.connects(), 1);
    assert_eq!(server.outstanding(), 0);
}

#[tokio::test]
async fn test_query_raw_empty_result_keeps_columns() {
    let server = FakeServer::new();
    server.on(
        "FROM users",
        Reply::Rows {
            fields: vec![("id", oid::INT8)],
            rows: vec![],
        },
    );
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let rs = adapter
        .query_raw(&Query::new("SELECT id FROM users WHERE false"))
        .await
        .unwrap();
    assert!(rs.is_empty());
    assert_eq!(rs.column_types, vec![ColumnType::Scalar(ScalarType::Int64)]);
}

#[tokio::test]
async fn test_unsupported_column_type_fails_whole_query() {
    let server = FakeServer::new();
    server.on(
        "FROM events",
        Reply::Rows {
            fields: vec![("id", oid::INT4), ("span", 1186)],
            rows: vec![vec![Value::Int32(1), Value::Text("1 day".into())]],
        },
    );
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let err = adapter
        .query_raw(&Query::new("SELECT id, span FROM events"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DriverError::UnsupportedNativeDataType {
            type_name: "interval".into()
        }
    );
    assert_eq!(server.outstanding(), 0);
}

#[tokio::test]
async fn test_execute_raw_counts() {
    let server = FakeServer::new();
    server.on("UPDATE", Reply::Count(3));
    server.on("LISTEN", Reply::Silent);
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let n = adapter
        .execute_raw(&Query::new("UPDATE users SET active = true"))
        .await
        .unwrap();
    assert_eq!(n, 3);

    // No count reported by the server
    let n = adapter.execute_raw(&Query::new("LISTEN jobs")).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_arguments_are_coerced_before_sending() {
    let server = FakeServer::new();
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let query = Query::new("INSERT INTO t VALUES ($1, $2, $3, $4)")
        .with_typed_arg("42", ArgType::Scalar(ScalarType::Int32))
        .with_typed_arg(Value::Null, ArgType::Scalar(ScalarType::Uuid))
        .with_arg(vec![1u8, 2, 3])
        .with_typed_arg(
            Value::Array(vec![Value::Text("7".into()), Value::Null]),
            ArgType::Array(ScalarType::Int64),
        );
    adapter.execute_raw(&query).await.unwrap();

    let log = server.log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].mode, StatementMode::Prepared);
    assert_eq!(
        log[0].values,
        vec![
            WireValue::Int32(42),
            WireValue::Null(ArgType::Scalar(ScalarType::Uuid)),
            WireValue::Bytes(vec![1, 2, 3]),
            WireValue::Array {
                element: ScalarType::Int64,
                items: vec![
                    WireValue::Int64(7),
                    WireValue::Null(ArgType::Scalar(ScalarType::Int64)),
                ],
            },
        ]
    );
}

#[tokio::test]
async fn test_invalid_argument_never_reaches_server() {
    let server = FakeServer::new();
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let query = Query::new("SELECT $1").with_typed_arg("abc", ArgType::Scalar(ScalarType::Int32));
    let err = adapter.query_raw(&query).await.unwrap_err();

    assert!(matches!(err, DriverError::InvalidArgument { index: 0, .. }));
    assert_eq!(server.connects(), 0);
    assert!(server.log().is_empty());
}

#[tokio::test]
async fn test_server_errors_are_classified() {
    let server = FakeServer::new();
    server.on(
        "INSERT INTO users",
        Reply::Fail(NativeError::Database {
            code: Some("23505".into()),
            message: "duplicate key value violates unique constraint \"users_email_key\"".into(),
            constraint: Some("users_email_key".into()),
            table: Some("users".into()),
            column: None,
            detail: Some("Key (email)=(a@example.com) already exists.".into()),
        }),
    );
    server.on("FROM nope", Reply::Fail(db_error("42P01", "relation \"nope\" does not exist")));
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let err = adapter
        .execute_raw(&Query::new("INSERT INTO users (email) VALUES ('a@example.com')"))
        .await
        .unwrap_err();
    match err {
        DriverError::ConstraintViolation { kind, fields, .. } => {
            assert_eq!(kind, ConstraintKind::Unique);
            assert_eq!(fields, vec!["email".to_string()]);
        }
        other => panic!("unexpected {:?}", other),
    }

    let err = adapter
        .query_raw(&Query::new("SELECT * FROM nope"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DriverError::TableDoesNotExist {
            table: Some("nope".into())
        }
    );

    // Failed statements discard their connection
    assert_eq!(server.released_with_error(), 2);
    assert_eq!(server.outstanding(), 0);
}

#[tokio::test]
async fn test_connect_failure_is_classified() {
    let server = FakeServer::new();
    server.fail_connect(Some(NativeError::Io {
        kind: std::io::ErrorKind::ConnectionRefused,
        message: "Connection refused".into(),
    }));
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let err = adapter.query_raw(&Query::new("SELECT 1")).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Connection {
            kind: ConnectionErrorKind::NotReachable,
            ..
        }
    ));
    assert!(err.is_retryable());
}

fn upper_text(bytes: &[u8]) -> Result<Value, pg_driver_adapter::db::DecodeError> {
    Ok(Value::Text(String::from_utf8_lossy(bytes).to_uppercase()))
}

#[tokio::test]
async fn test_type_parser_overrides_apply_to_results() {
    let server = FakeServer::new();
    server.on(
        "FROM notes",
        Reply::Binary {
            fields: vec![("digest", oid::BYTEA), ("body", oid::TEXT)],
            rows: vec![vec![Some(vec![0xde, 0xad]), Some(b"hi".to_vec())]],
        },
    );
    let parsers = TypeParsers::new().with_override(oid::TEXT, upper_text);
    let adapter = adapter(&server, AdapterOptions::default().with_type_parsers(parsers)).await;

    let rs = adapter
        .query_raw(&Query::new("SELECT digest, body FROM notes"))
        .await
        .unwrap();
    assert_eq!(
        rs.rows,
        vec![vec![Value::Bytes(vec![0xde, 0xad]), Value::Text("HI".into())]]
    );
}

#[tokio::test]
async fn test_arguments_come_back_as_they_were_sent() {
    let server = FakeServer::new();
    server.on(
        "SELECT $1",
        Reply::Echo {
            fields: vec![
                ("a", oid::INT4),
                ("b", oid::INT8),
                ("c", oid::TEXT),
                ("d", oid::BOOL),
                ("e", oid::BYTEA),
            ],
        },
    );
    let adapter = adapter(&server, AdapterOptions::default()).await;

    let args = vec![
        Value::Int32(-42),
        Value::Int64(9_007_199_254_740_993),
        Value::Text("naïve".into()),
        Value::Boolean(false),
        Value::Bytes(vec![0, 255, 1]),
    ];
    let query = args
        .iter()
        .cloned()
        .fold(Query::new("SELECT $1, $2, $3, $4, $5"), Query::with_arg);
    let rs = adapter.query_raw(&query).await.unwrap();

    assert_eq!(rs.rows, vec![args]);
    assert_eq!(
        rs.column_types,
        vec![
            ColumnType::Scalar(ScalarType::Int32),
            ColumnType::Scalar(ScalarType::Int64),
            ColumnType::Scalar(ScalarType::Text),
            ColumnType::Scalar(ScalarType::Boolean),
            ColumnType::Scalar(ScalarType::Bytes),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_queries_release_every_connection() {
    let server = FakeServer::new();
    server.set_latency(std::time::Duration::from_millis(5));
    server.on("SELECT", Reply::Count(1));
    let adapter = Arc::new(adapter(&server, AdapterOptions::default()).await);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move {
                adapter
                    .execute_raw(&Query::new(format!("SELECT {}", i)))
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    assert_eq!(server.connects(), 8);
    assert_eq!(server.outstanding(), 0);
}

#[tokio::test]
async fn test_provider_and_adapter_name() {
    let server = FakeServer::new();
    let adapter = adapter(&server, AdapterOptions::default()).await;
    assert_eq!(adapter.provider(), "postgres");
    assert_eq!(adapter.adapter_name(), "pg-driver-adapter");
}
